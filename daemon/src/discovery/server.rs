//! UDP front-end for the discovery protocol.
//!
//! A single reactor task owns the socket and the [`Service`]. It reacts to:
//! - commands sent through a [`DiscoveryHandle`]
//! - datagrams read from the socket
//! - the earliest protocol deadline (request retries, session timeouts,
//!   lookup timeouts, pings)
//! - maintenance intervals (bucket refresh, bootstrap, pruning)
//!
//! Every branch runs to completion on the reactor, so protocol state never
//! needs a lock.

use std::future::pending;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use discv5_common::tokio::net::UdpSocket;
use discv5_common::tokio::sync::{mpsc, oneshot};
use discv5_common::tokio::task::JoinHandle;
use discv5_common::tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use discv5_common::tokio::{select, spawn_task};
use log::{debug, error, info, trace, warn};

use super::config::DiscoveryConfig;
use super::crypto::{CryptoBackend, Secp256k1Backend};
use super::error::{DiscoveryError, DiscoveryResult, RequestError, SessionError};
use super::identity::{NodeAddress, NodeId, NodeIdentity};
use super::messages::RequestId;
use super::packet::MAX_PACKET_SIZE;
use super::record::{Contact, NodeRecord};
use super::routing_table::{BucketEntry, InsertResult};
use super::service::{DiscoveryEvent, FindNodeResult, PingResponse, Service};
use super::url::NodeUrl;

/// Interval for pinging bootstrap nodes while the table has no live peer.
const BOOTSTRAP_INTERVAL: Duration = Duration::from_secs(60);

/// Interval for dropping expired rate limiter state.
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

enum Command {
    FindNode {
        target: NodeId,
        tx: oneshot::Sender<Vec<NodeRecord>>,
    },
    FindNodeAt {
        contact: Contact,
        distances: Vec<u64>,
        tx: oneshot::Sender<FindNodeResult>,
    },
    Ping {
        contact: Contact,
        tx: oneshot::Sender<Result<PingResponse, RequestError>>,
    },
    TalkRequest {
        contact: Contact,
        protocol: Vec<u8>,
        payload: Vec<u8>,
        tx: oneshot::Sender<Result<Vec<u8>, RequestError>>,
    },
    TalkResponse {
        node_address: NodeAddress,
        id: RequestId,
        payload: Vec<u8>,
        tx: oneshot::Sender<Result<(), SessionError>>,
    },
    AddEnr {
        record: NodeRecord,
        tx: oneshot::Sender<Result<InsertResult, RequestError>>,
    },
    LocalRecord(oneshot::Sender<NodeRecord>),
    TableEntries(oneshot::Sender<Vec<BucketEntry>>),
    Stop,
}

/// Cloneable handle to a running discovery node.
///
/// Every call is forwarded to the reactor task. Once the node is stopped,
/// calls fail with `ServiceStopped`.
#[derive(Clone)]
pub struct DiscoveryHandle {
    commands: mpsc::UnboundedSender<Command>,
    node_id: NodeId,
    local_addr: SocketAddr,
}

impl DiscoveryHandle {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Address the UDP socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn send(&self, command: Command) -> DiscoveryResult<()> {
        self.commands
            .send(command)
            .map_err(|_| DiscoveryError::ServiceStopped)
    }

    /// Iterative lookup for the nodes closest to `target`.
    pub async fn find_node(&self, target: NodeId) -> DiscoveryResult<Vec<NodeRecord>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::FindNode { target, tx })?;
        rx.await.map_err(|_| DiscoveryError::ServiceStopped)
    }

    /// Ask a single node for the records at the given log2 distances.
    pub async fn find_node_at(
        &self,
        contact: Contact,
        distances: Vec<u64>,
    ) -> Result<Vec<NodeRecord>, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::FindNodeAt {
            contact,
            distances,
            tx,
        })
        .map_err(|_| RequestError::ServiceStopped)?;
        rx.await.map_err(|_| RequestError::ServiceStopped)?
    }

    pub async fn ping(&self, contact: Contact) -> Result<PingResponse, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Ping { contact, tx })
            .map_err(|_| RequestError::ServiceStopped)?;
        rx.await.map_err(|_| RequestError::ServiceStopped)?
    }

    pub async fn talk_request(
        &self,
        contact: Contact,
        protocol: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::TalkRequest {
            contact,
            protocol,
            payload,
            tx,
        })
        .map_err(|_| RequestError::ServiceStopped)?;
        rx.await.map_err(|_| RequestError::ServiceStopped)?
    }

    /// Answer a [`DiscoveryEvent::TalkRequestReceived`].
    pub async fn send_talk_response(
        &self,
        node_address: NodeAddress,
        id: RequestId,
        payload: Vec<u8>,
    ) -> DiscoveryResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::TalkResponse {
            node_address,
            id,
            payload,
            tx,
        })?;
        rx.await.map_err(|_| DiscoveryError::ServiceStopped)??;
        Ok(())
    }

    /// Add a signed record to the routing table.
    pub async fn add_enr(&self, record: NodeRecord) -> DiscoveryResult<InsertResult> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::AddEnr { record, tx })?;
        Ok(rx.await.map_err(|_| DiscoveryError::ServiceStopped)??)
    }

    pub async fn local_record(&self) -> DiscoveryResult<NodeRecord> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::LocalRecord(tx))?;
        rx.await.map_err(|_| DiscoveryError::ServiceStopped)
    }

    pub async fn table_entries(&self) -> DiscoveryResult<Vec<BucketEntry>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::TableEntries(tx))?;
        rx.await.map_err(|_| DiscoveryError::ServiceStopped)
    }

    /// Stop the reactor. Requests still in flight fail with `ServiceStopped`.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

/// Running discovery node.
pub struct DiscoveryServer {
    handle: DiscoveryHandle,
    task: JoinHandle<()>,
}

impl DiscoveryServer {
    /// Bind the socket and spawn the reactor.
    pub async fn start(
        config: DiscoveryConfig,
    ) -> DiscoveryResult<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>)> {
        let backend: Arc<dyn CryptoBackend> = Arc::new(Secp256k1Backend::new());
        let identity = match &config.private_key {
            Some(key) => {
                let bytes = hex::decode(key.trim_start_matches("0x")).map_err(|e| {
                    DiscoveryError::ConfigError(format!("invalid private key: {}", e))
                })?;
                let secret: [u8; 32] = bytes.try_into().map_err(|_| {
                    DiscoveryError::ConfigError("private key must be 32 bytes".to_string())
                })?;
                NodeIdentity::from_secret_bytes(backend, secret)?
            }
            None => NodeIdentity::generate(backend)?,
        };
        Self::start_with_identity(config, Arc::new(identity)).await
    }

    pub async fn start_with_identity(
        config: DiscoveryConfig,
        identity: Arc<NodeIdentity>,
    ) -> DiscoveryResult<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>)> {
        config.validate()?;

        let mut bootstrap = Vec::with_capacity(config.bootstrap_nodes.len());
        for url in &config.bootstrap_nodes {
            match NodeUrl::parse(url) {
                Ok(url) => bootstrap.push(url.to_contact()),
                Err(e) => {
                    if log::log_enabled!(log::Level::Error) {
                        error!("Invalid bootstrap node URL '{}': {}", url, e);
                    }
                }
            }
        }

        let bind_address = config.get_bind_address();
        let socket = UdpSocket::bind(&bind_address)
            .await
            .map_err(|e| DiscoveryError::BindFailed(bind_address.clone(), e))?;
        let local_addr = socket.local_addr()?;

        // an unspecified bind address is not worth advertising, peers will vote on it
        let advertised = (!local_addr.ip().is_unspecified()).then_some(local_addr);
        let record = NodeRecord::new(&identity, 1, advertised)?;

        if log::log_enabled!(log::Level::Info) {
            info!(
                "Discovery listening on {} as {}",
                local_addr,
                NodeUrl::new(*identity.public_key(), advertised.unwrap_or(local_addr))
            );
        }

        let node_id = *identity.node_id();
        let refresh_interval = config.refresh_interval;
        let (service, events) = Service::new(identity, record, config)?;
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let reactor = Reactor {
            service,
            socket,
            commands: commands_rx,
            bootstrap,
            refresh_interval,
            bootstrapped: false,
        };
        let task = spawn_task("discovery-reactor", reactor.run());

        let handle = DiscoveryHandle {
            commands,
            node_id,
            local_addr,
        };
        Ok((Self { handle, task }, events))
    }

    pub fn handle(&self) -> DiscoveryHandle {
        self.handle.clone()
    }

    /// Stop the reactor and wait for it to exit.
    pub async fn shutdown(self) {
        self.handle.stop();
        if let Err(e) = self.task.await {
            if log::log_enabled!(log::Level::Error) {
                error!("Discovery reactor failed: {}", e);
            }
        }
    }
}

struct Reactor {
    service: Service,
    socket: UdpSocket,
    commands: mpsc::UnboundedReceiver<Command>,
    bootstrap: Vec<Contact>,
    refresh_interval: Duration,
    /// Set once the first self lookup has been started.
    bootstrapped: bool,
}

impl Reactor {
    async fn run(mut self) {
        // one spare byte so an oversized datagram is seen as such, not truncated
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        let mut refresh_timer = interval(self.refresh_interval);
        let mut bootstrap_timer = interval(BOOTSTRAP_INTERVAL);
        let mut prune_timer = interval(PRUNE_INTERVAL);
        for timer in [&mut refresh_timer, &mut bootstrap_timer, &mut prune_timer] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            let deadline = self.service.next_deadline();
            let timeout = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending().await,
                }
            };

            select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Stop) | None => break,
                    Some(command) => self.on_command(command),
                },
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((len, from)) => {
                        metrics::counter!("discv5_packets_received_total").increment(1);
                        if log::log_enabled!(log::Level::Trace) {
                            trace!("Received {} bytes from {}", len, from);
                        }
                        if len > MAX_PACKET_SIZE {
                            metrics::counter!("discv5_packets_dropped_total").increment(1);
                            if log::log_enabled!(log::Level::Debug) {
                                debug!("Dropping oversized datagram from {}", from);
                            }
                            continue;
                        }
                        self.service.handle_datagram(from, &buf[..len], Instant::now());
                    }
                    Err(e) => {
                        if log::log_enabled!(log::Level::Error) {
                            error!("Error receiving packet: {}", e);
                        }
                    }
                },
                _ = timeout => {
                    self.service.on_timeout(Instant::now());
                }
                _ = bootstrap_timer.tick() => {
                    self.service.bootstrap(&self.bootstrap, Instant::now());
                }
                _ = refresh_timer.tick() => {
                    self.service.refresh(Instant::now());
                }
                _ = prune_timer.tick() => {
                    self.service.prune(Instant::now());
                }
            }

            // populate the buckets around us as soon as a first peer is known
            if !self.bootstrapped && !self.service.table().is_empty() {
                self.bootstrapped = true;
                let local_id = *self.service.local_id();
                self.service.find_node(local_id, None, Instant::now());
            }

            self.flush().await;
        }

        if log::log_enabled!(log::Level::Info) {
            info!("Discovery service stopped");
        }
        self.service.stop();
    }

    fn on_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::FindNode { target, tx } => {
                self.service.find_node(target, Some(tx), now);
            }
            Command::FindNodeAt {
                contact,
                distances,
                tx,
            } => self.service.find_node_at(contact, distances, tx, now),
            Command::Ping { contact, tx } => self.service.ping(contact, tx, now),
            Command::TalkRequest {
                contact,
                protocol,
                payload,
                tx,
            } => self.service.talk_request(contact, protocol, payload, tx, now),
            Command::TalkResponse {
                node_address,
                id,
                payload,
                tx,
            } => {
                let _ = tx.send(self.service.send_talk_response(node_address, id, payload));
            }
            Command::AddEnr { record, tx } => {
                let _ = tx.send(self.service.add_enr(record, now));
            }
            Command::LocalRecord(tx) => {
                let _ = tx.send(self.service.local_record().clone());
            }
            Command::TableEntries(tx) => {
                let _ = tx.send(self.service.table().entries());
            }
            Command::Stop => {}
        }
    }

    async fn flush(&mut self) {
        for packet in self.service.drain_outbound() {
            if is_unroutable(packet.dest.ip()) {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Not sending {} packet to {}", packet.flag.as_str(), packet.dest);
                }
                continue;
            }
            match self.socket.send_to(&packet.bytes, packet.dest).await {
                Ok(_) => {
                    metrics::counter!("discv5_packets_sent_total").increment(1);
                }
                Err(e) => {
                    if log::log_enabled!(log::Level::Warn) {
                        warn!("Failed to send packet to {}: {}", packet.dest, e);
                    }
                }
            }
        }
    }
}

fn is_unroutable(ip: IpAddr) -> bool {
    ip.is_unspecified() || ip.is_multicast()
}
