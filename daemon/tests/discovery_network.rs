use std::time::Duration;

use discv5_daemon::discovery::packet::{random_nonce, Packet, MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use discv5_daemon::discovery::{
    Contact, DiscoveryConfig, DiscoveryEvent, DiscoveryHandle, DiscoveryServer, EntryStatus,
    NodeId, NodeUrl, RequestError,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const TIMEOUT: Duration = Duration::from_secs(10);

fn local_config() -> DiscoveryConfig {
    DiscoveryConfig {
        bind_address: Some("127.0.0.1:0".to_string()),
        ..DiscoveryConfig::default()
    }
}

async fn spawn_node(
    config: DiscoveryConfig,
) -> (DiscoveryServer, DiscoveryHandle, UnboundedReceiver<DiscoveryEvent>) {
    let (server, events) = DiscoveryServer::start(config).await.expect("start node");
    let handle = server.handle();
    (server, handle, events)
}

async fn contact_of(handle: &DiscoveryHandle) -> Contact {
    Contact::Record(handle.local_record().await.expect("local record"))
}

#[tokio::test]
async fn test_ping_over_udp() {
    let (a_server, a, _a_events) = spawn_node(local_config()).await;
    let (b_server, b, _b_events) = spawn_node(local_config()).await;

    let pong = timeout(TIMEOUT, a.ping(contact_of(&b).await))
        .await
        .expect("ping timed out")
        .expect("ping failed");
    assert_eq!(pong.observed_addr, a.local_addr());
    assert_eq!(pong.enr_seq, 1);

    // both sides now hold each other as connected peers
    let entries = a.table_entries().await.unwrap();
    assert!(entries
        .iter()
        .any(|e| e.node_id() == b.node_id() && e.status == EntryStatus::Connected));
    let entries = b.table_entries().await.unwrap();
    assert!(entries.iter().any(|e| e.node_id() == a.node_id()));

    a_server.shutdown().await;
    b_server.shutdown().await;
}

#[tokio::test]
async fn test_lookup_across_three_nodes() {
    let (a_server, a, _a_events) = spawn_node(local_config()).await;
    let (b_server, b, _b_events) = spawn_node(local_config()).await;
    let (c_server, c, _c_events) = spawn_node(local_config()).await;

    let c_record = c.local_record().await.unwrap();
    b.add_enr(c_record.clone()).await.unwrap();
    a.add_enr(b.local_record().await.unwrap()).await.unwrap();

    let result = timeout(TIMEOUT, a.find_node(*c.node_id()))
        .await
        .expect("lookup timed out")
        .unwrap();
    assert_eq!(result.first(), Some(&c_record));

    for server in [a_server, b_server, c_server] {
        server.shutdown().await;
    }
}

#[tokio::test]
async fn test_bootstrap_from_url() {
    let (b_server, b, _b_events) = spawn_node(local_config()).await;
    let b_record = b.local_record().await.unwrap();
    let url = NodeUrl::new(*b_record.public_key(), b.local_addr());

    let config = DiscoveryConfig {
        bootstrap_nodes: vec![url.to_string()],
        ..local_config()
    };
    let (a_server, _a, mut a_events) = spawn_node(config).await;

    // the record of a raw bootstrap contact is fetched after the handshake
    let added = timeout(TIMEOUT, async {
        while let Some(event) = a_events.recv().await {
            if let DiscoveryEvent::EnrAdded { record, .. } = event {
                return Some(record);
            }
        }
        None
    })
    .await
    .expect("bootstrap timed out");
    assert_eq!(added, Some(b_record));

    a_server.shutdown().await;
    b_server.shutdown().await;
}

#[tokio::test]
async fn test_talk_request() {
    let (a_server, a, _a_events) = spawn_node(local_config()).await;
    let (b_server, b, mut b_events) = spawn_node(local_config()).await;

    let responder = tokio::spawn({
        let b = b.clone();
        async move {
            while let Some(event) = b_events.recv().await {
                if let DiscoveryEvent::TalkRequestReceived(request) = event {
                    let mut reply = request.payload.clone();
                    reply.reverse();
                    b.send_talk_response(request.node_address, request.id, reply)
                        .await
                        .unwrap();
                    return request.protocol;
                }
            }
            Vec::new()
        }
    });

    let response = timeout(
        TIMEOUT,
        a.talk_request(contact_of(&b).await, b"echo".to_vec(), b"abc".to_vec()),
    )
    .await
    .expect("talk timed out")
    .unwrap();
    assert_eq!(response, b"cba");
    assert_eq!(responder.await.unwrap(), b"echo");

    a_server.shutdown().await;
    b_server.shutdown().await;
}

#[tokio::test]
async fn test_requests_fail_after_shutdown() {
    let (a_server, a, _a_events) = spawn_node(local_config()).await;
    let (b_server, b, _b_events) = spawn_node(local_config()).await;
    let b_contact = contact_of(&b).await;

    a_server.shutdown().await;
    assert_eq!(a.ping(b_contact).await, Err(RequestError::ServiceStopped));
    b_server.shutdown().await;
}

/// Undecryptable message packet of `size` bytes addressed to `dest`.
fn message_packet(dest: &NodeId, size: usize) -> Vec<u8> {
    let mut packet = Packet::new_message(NodeId::random(), random_nonce());
    let header_size = packet.encode(dest).len();
    packet.message = vec![0x5a; size - header_size];
    packet.encode(dest)
}

#[tokio::test]
async fn test_oversized_datagram_ignored() {
    let (b_server, b, _b_events) = spawn_node(local_config()).await;
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 2048];

    // a well-formed unknown sender is challenged
    let packet = message_packet(b.node_id(), MAX_PACKET_SIZE);
    assert_eq!(packet.len(), MAX_PACKET_SIZE);
    socket.send_to(&packet, b.local_addr()).await.unwrap();
    let (len, from) = timeout(TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("no WHOAREYOU")
        .unwrap();
    assert_eq!(from, b.local_addr());
    assert_eq!(len, MIN_PACKET_SIZE);

    // a larger packet of the same kind gets no answer at all
    let packet = message_packet(b.node_id(), MAX_PACKET_SIZE + 91);
    socket.send_to(&packet, b.local_addr()).await.unwrap();
    assert!(
        timeout(Duration::from_millis(500), socket.recv_from(&mut buf))
            .await
            .is_err()
    );

    b_server.shutdown().await;
}
