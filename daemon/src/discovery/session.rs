//! Session layer: one encrypted session per [`NodeAddress`].
//!
//! Outbound, a request to a peer without a session is queued and a random
//! packet is sent instead. The peer cannot decrypt it and answers with a
//! WHOAREYOU challenge, which we answer with a handshake packet carrying the
//! first queued request. The session is established once the peer's first
//! message decrypts with the derived keys.
//!
//! Inbound, an undecryptable message yields [`SessionEvent::WhoAreYouRequest`].
//! The owner answers with [`SessionService::send_whoareyou`], supplying the
//! record it knows for the peer, and a valid handshake establishes the session.
//!
//! Queued requests are sent in FIFO order exactly once when the session
//! becomes established, or failed when it is dropped.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use discv5_common::serializer::Serializer;
use log::{debug, trace, warn};
use lru::LruCache;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::crypto::{
    decrypt_message, derive_keys_from_ephemeral, encrypt_message, generate_session_keys,
    sign_id_nonce, verify_id_nonce, SessionKeys,
};
use super::error::{CryptoError, DecodeError, DiscoveryError, DiscoveryResult, RequestError, SessionError};
use super::identity::{NodeAddress, NodeId, NodeIdentity};
use super::messages::{Message, Request, RequestId, Response, ResponseBody, MAX_NODES_PACKETS};
use super::packet::{
    random_nonce, HandshakeAuthdata, Nonce, Packet, PacketFlag, WhoAreYouAuthdata, ID_NONCE_SIZE,
    MAX_PACKET_SIZE,
};
use super::record::{Contact, NodeRecord};
use super::timer::{TimerHandle, TimerQueue};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub request_timeout: Duration,
    pub request_retries: usize,
    pub session_timeout: Duration,
    pub session_cache_capacity: usize,
    pub session_establish_timeout: Duration,
}

/// Which side started the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug)]
pub enum SessionEvent {
    Established {
        node_address: NodeAddress,
        /// Record the peer proved ownership of, if we have one.
        record: Option<NodeRecord>,
        direction: Direction,
    },
    /// A packet from `node_address` could not be decrypted. The owner
    /// should call [`SessionService::send_whoareyou`] with this nonce.
    WhoAreYouRequest {
        node_address: NodeAddress,
        nonce: Nonce,
    },
    Request {
        node_address: NodeAddress,
        request: Request,
    },
    Response {
        node_address: NodeAddress,
        response: Response,
    },
    RequestFailed {
        request_id: RequestId,
        node_address: NodeAddress,
        error: RequestError,
    },
}

/// A datagram ready for the socket.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub dest: SocketAddr,
    pub flag: PacketFlag,
    pub bytes: Vec<u8>,
}

enum SessionStatus {
    /// Random packet sent, waiting for the peer's challenge.
    RandomPacketSent,
    /// We challenged the peer and wait for its handshake.
    WhoAreYouSent {
        challenge_data: Vec<u8>,
        remote_record: Option<NodeRecord>,
    },
    /// Handshake sent, established on the first message that decrypts.
    HandshakeSent { keys: SessionKeys },
    Established { keys: SessionKeys },
}

impl SessionStatus {
    fn name(&self) -> &'static str {
        match self {
            Self::RandomPacketSent => "random-packet-sent",
            Self::WhoAreYouSent { .. } => "whoareyou-sent",
            Self::HandshakeSent { .. } => "handshake-sent",
            Self::Established { .. } => "established",
        }
    }
}

struct Session {
    status: SessionStatus,
    contact: Option<Contact>,
    queue: VecDeque<RequestId>,
    establish_timer: Option<TimerHandle>,
    expire_timer: Option<TimerHandle>,
}

impl Session {
    fn new(status: SessionStatus, contact: Option<Contact>) -> Self {
        Self {
            status,
            contact,
            queue: VecDeque::new(),
            establish_timer: None,
            expire_timer: None,
        }
    }
}

struct SentPacket {
    nonce: Nonce,
    flag: PacketFlag,
    bytes: Vec<u8>,
}

struct PendingRequest {
    node_address: NodeAddress,
    request: Request,
    /// None while queued behind the handshake.
    sent: Option<SentPacket>,
    retries: usize,
    timer: Option<TimerHandle>,
    nodes_received: u64,
}

#[derive(Debug, Clone)]
enum SessionTimer {
    Request(RequestId),
    Establish(NodeAddress),
    Expire(NodeAddress),
}

pub struct SessionService {
    identity: Arc<NodeIdentity>,
    local_record: NodeRecord,
    config: SessionConfig,
    sessions: LruCache<NodeAddress, Session>,
    // packet nonce -> peer, and the request it carried (None for random packets)
    awaiting_whoareyou: HashMap<Nonce, (NodeAddress, Option<RequestId>)>,
    pending_requests: HashMap<RequestId, PendingRequest>,
    timers: TimerQueue<SessionTimer>,
    events: mpsc::UnboundedSender<SessionEvent>,
    outbound: mpsc::UnboundedSender<OutboundPacket>,
}

fn seal_message(
    src_id: &NodeId,
    dest_id: &NodeId,
    keys: &SessionKeys,
    plaintext: &[u8],
) -> Result<SentPacket, CryptoError> {
    let nonce = random_nonce();
    let mut packet = Packet::new_message(*src_id, nonce);
    let aad = packet.authenticated_data();
    packet.message = encrypt_message(&keys.encryption_key, &nonce, plaintext, &aad)?;
    Ok(SentPacket {
        nonce,
        flag: PacketFlag::Message,
        bytes: packet.encode(dest_id),
    })
}

impl SessionService {
    pub fn new(
        identity: Arc<NodeIdentity>,
        local_record: NodeRecord,
        config: SessionConfig,
    ) -> DiscoveryResult<(
        Self,
        mpsc::UnboundedReceiver<SessionEvent>,
        mpsc::UnboundedReceiver<OutboundPacket>,
    )> {
        let capacity = NonZeroUsize::new(config.session_cache_capacity).ok_or_else(|| {
            DiscoveryError::ConfigError("session cache capacity must be non-zero".to_string())
        })?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let service = Self {
            identity,
            local_record,
            config,
            sessions: LruCache::new(capacity),
            awaiting_whoareyou: HashMap::new(),
            pending_requests: HashMap::new(),
            timers: TimerQueue::new(),
            events,
            outbound,
        };
        Ok((service, events_rx, outbound_rx))
    }

    pub fn local_id(&self) -> &NodeId {
        self.identity.node_id()
    }

    pub fn local_record(&self) -> &NodeRecord {
        &self.local_record
    }

    /// Record sent in future handshakes.
    pub fn update_local_record(&mut self, record: NodeRecord) {
        self.local_record = record;
    }

    pub fn is_established(&self, node_address: &NodeAddress) -> bool {
        self.sessions
            .peek(node_address)
            .is_some_and(|s| matches!(s.status, SessionStatus::Established { .. }))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.len()
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn emit(&self, event: SessionEvent) {
        // receiver dropped means the owner is shutting down
        let _ = self.events.send(event);
    }

    fn send_bytes(&self, dest: SocketAddr, flag: PacketFlag, bytes: Vec<u8>) {
        if bytes.len() > MAX_PACKET_SIZE {
            if log::log_enabled!(log::Level::Warn) {
                warn!(
                    "Dropping oversized {} packet to {} ({} bytes)",
                    flag.as_str(),
                    dest,
                    bytes.len()
                );
            }
            return;
        }
        if log::log_enabled!(log::Level::Trace) {
            trace!("Sending {} packet to {} ({} bytes)", flag.as_str(), dest, bytes.len());
        }
        let _ = self.outbound.send(OutboundPacket { dest, flag, bytes });
    }

    /// Send `request` to `contact`, opening a session first if needed.
    ///
    /// Failures after this returns are reported as
    /// [`SessionEvent::RequestFailed`].
    pub fn send_request(
        &mut self,
        contact: Contact,
        request: Request,
        now: Instant,
    ) -> Result<(), SessionError> {
        let node_address = contact.node_address()?;
        if node_address.node_id == *self.identity.node_id() {
            return Err(SessionError::SelfSession);
        }

        let id = request.id.clone();
        self.pending_requests.insert(
            id.clone(),
            PendingRequest {
                node_address,
                request,
                sent: None,
                retries: 0,
                timer: None,
                nodes_received: 0,
            },
        );

        let keys = match self.sessions.get_mut(&node_address) {
            Some(session) => match &session.status {
                SessionStatus::Established { keys } => Some(keys.clone()),
                _ => {
                    session.queue.push_back(id);
                    if session.contact.is_none() {
                        session.contact = Some(contact);
                    }
                    return Ok(());
                }
            },
            None => None,
        };

        if let Some(keys) = keys {
            return self.transmit(&id, &keys, now).map_err(|e| {
                self.remove_pending(&id);
                SessionError::Crypto(e)
            });
        }

        if log::log_enabled!(log::Level::Debug) {
            debug!("Starting handshake with {}", node_address);
        }
        let packet = Packet::new_random(*self.identity.node_id());
        self.awaiting_whoareyou
            .insert(packet.header.nonce, (node_address, None));

        let mut session = Session::new(SessionStatus::RandomPacketSent, Some(contact));
        session.queue.push_back(id);
        session.establish_timer = Some(self.timers.insert(
            now + self.config.session_establish_timeout,
            SessionTimer::Establish(node_address),
        ));
        self.insert_session(node_address, session);
        self.send_bytes(
            node_address.socket_addr,
            PacketFlag::Message,
            packet.encode(&node_address.node_id),
        );
        Ok(())
    }

    /// Answer a request over an established session.
    pub fn send_response(
        &mut self,
        node_address: NodeAddress,
        response: Response,
    ) -> Result<(), SessionError> {
        let keys = match self.sessions.get(&node_address).map(|s| &s.status) {
            Some(SessionStatus::Established { keys }) => keys.clone(),
            _ => return Err(SessionError::NoSession(node_address)),
        };

        let sent = seal_message(
            self.identity.node_id(),
            &node_address.node_id,
            &keys,
            &response.encode(),
        )?;
        self.send_bytes(node_address.socket_addr, sent.flag, sent.bytes);
        Ok(())
    }

    /// Challenge `node_address` for the packet that carried `nonce`.
    ///
    /// `record` is the newest record we know for the peer; without one the
    /// peer must include its record in the handshake.
    pub fn send_whoareyou(
        &mut self,
        node_address: NodeAddress,
        nonce: Nonce,
        record: Option<NodeRecord>,
        now: Instant,
    ) {
        let mut id_nonce = [0u8; ID_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut id_nonce);
        let enr_seq = record.as_ref().map_or(0, NodeRecord::seq);
        let packet = Packet::new_whoareyou(nonce, id_nonce, enr_seq);

        let status = SessionStatus::WhoAreYouSent {
            challenge_data: packet.authenticated_data(),
            remote_record: record.clone(),
        };
        let establish_deadline = now + self.config.session_establish_timeout;

        match self.sessions.get_mut(&node_address) {
            Some(session) => {
                session.status = status;
                if let Some(timer) = session.expire_timer.take() {
                    self.timers.cancel(timer);
                }
                if session.establish_timer.is_none() {
                    session.establish_timer = Some(
                        self.timers
                            .insert(establish_deadline, SessionTimer::Establish(node_address)),
                    );
                }
            }
            None => {
                let mut session = Session::new(status, record.map(Contact::Record));
                session.establish_timer = Some(
                    self.timers
                        .insert(establish_deadline, SessionTimer::Establish(node_address)),
                );
                self.insert_session(node_address, session);
            }
        }

        self.send_bytes(
            node_address.socket_addr,
            PacketFlag::WhoAreYou,
            packet.encode(&node_address.node_id),
        );
    }

    /// Process a decoded packet received from `src`.
    pub fn on_packet(&mut self, src: SocketAddr, packet: Packet, now: Instant) -> DiscoveryResult<()> {
        if log::log_enabled!(log::Level::Trace) {
            trace!("Received {} packet from {}", packet.header.flag.as_str(), src);
        }
        match packet.header.flag {
            PacketFlag::Message => self.on_message(src, packet, now),
            PacketFlag::WhoAreYou => self.on_whoareyou(src, packet, now),
            PacketFlag::Handshake => self.on_handshake(src, packet, now),
        }
    }

    fn on_message(&mut self, src: SocketAddr, packet: Packet, now: Instant) -> DiscoveryResult<()> {
        let node_address = NodeAddress::new(packet.src_id()?, src);
        let aad = packet.authenticated_data();

        let (attempt, handshake_sent) = match self.sessions.get(&node_address).map(|s| &s.status) {
            Some(SessionStatus::Established { keys }) => (
                Some(decrypt_message(
                    &keys.decryption_key,
                    &packet.header.nonce,
                    &packet.message,
                    &aad,
                )),
                false,
            ),
            Some(SessionStatus::HandshakeSent { keys }) => (
                Some(decrypt_message(
                    &keys.decryption_key,
                    &packet.header.nonce,
                    &packet.message,
                    &aad,
                )),
                true,
            ),
            Some(SessionStatus::WhoAreYouSent { .. }) => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Already challenged {}, ignoring message", node_address);
                }
                return Ok(());
            }
            Some(SessionStatus::RandomPacketSent)
                if self.identity.node_id().as_bytes() > node_address.node_id.as_bytes() =>
            {
                // both sides started a handshake; the peer answers ours
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Concurrent handshake with {}, waiting for its challenge", node_address);
                }
                return Ok(());
            }
            _ => (None, false),
        };

        match attempt {
            Some(Ok(plaintext)) => {
                if handshake_sent {
                    self.complete_outgoing(node_address, now);
                }
                self.handle_plaintext(node_address, &plaintext, now)
            }
            Some(Err(e)) if handshake_sent => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Undecryptable message from {} during handshake: {}", node_address, e);
                }
                Ok(())
            }
            Some(Err(e)) => {
                // the peer lost its session keys
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Session with {} failed to decrypt ({}), challenging", node_address, e);
                }
                self.emit(SessionEvent::WhoAreYouRequest {
                    node_address,
                    nonce: packet.header.nonce,
                });
                Ok(())
            }
            None => {
                self.emit(SessionEvent::WhoAreYouRequest {
                    node_address,
                    nonce: packet.header.nonce,
                });
                Ok(())
            }
        }
    }

    fn on_whoareyou(&mut self, src: SocketAddr, packet: Packet, now: Instant) -> DiscoveryResult<()> {
        let nonce = packet.header.nonce;
        let Some((node_address, request_id)) = self.awaiting_whoareyou.get(&nonce).cloned() else {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Unsolicited WHOAREYOU from {}", src);
            }
            return Ok(());
        };
        if node_address.socket_addr != src {
            if log::log_enabled!(log::Level::Warn) {
                warn!("WHOAREYOU for {} received from {}", node_address, src);
            }
            return Ok(());
        }

        let authdata = WhoAreYouAuthdata::from_bytes(&packet.header.authdata).map_err(DecodeError::from)?;
        let challenge_data = packet.authenticated_data();
        self.awaiting_whoareyou.remove(&nonce);

        let Some(contact) = self
            .sessions
            .peek(&node_address)
            .and_then(|session| session.contact.clone())
        else {
            if log::log_enabled!(log::Level::Debug) {
                debug!("No key known for {}, cannot answer challenge", node_address);
            }
            return Ok(());
        };

        let local_id = *self.identity.node_id();
        let prepared = generate_session_keys(
            self.identity.backend().as_ref(),
            &local_id,
            &node_address.node_id,
            contact.public_key(),
            &challenge_data,
        )
        .and_then(|(keys, ephemeral_pubkey)| {
            let id_signature = sign_id_nonce(
                &self.identity,
                &challenge_data,
                &ephemeral_pubkey,
                &node_address.node_id,
            )?;
            Ok((keys, ephemeral_pubkey, id_signature))
        });
        let (keys, ephemeral_pubkey, id_signature) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.remove_session(&node_address, RequestError::Session(SessionError::Crypto(e.clone())));
                return Err(e.into());
            }
        };

        let Some(session) = self.sessions.get_mut(&node_address) else {
            return Ok(());
        };
        let carried = match request_id {
            Some(id) => Some(id),
            None => session.queue.pop_front(),
        };

        // requests sealed with the old keys go out again after the handshake
        let resend: Vec<RequestId> = self
            .pending_requests
            .iter()
            .filter(|(id, p)| {
                p.node_address == node_address && p.sent.is_some() && Some(*id) != carried.as_ref()
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in resend {
            if let Some(pending) = self.pending_requests.get_mut(&id) {
                if let Some(timer) = pending.timer.take() {
                    self.timers.cancel(timer);
                }
                if let Some(sent) = pending.sent.take() {
                    self.awaiting_whoareyou.remove(&sent.nonce);
                }
                pending.retries = 0;
            }
            session.queue.push_front(id);
        }

        let record = (authdata.enr_seq < self.local_record.seq()).then(|| self.local_record.encode());
        let handshake = HandshakeAuthdata {
            src_id: local_id,
            id_signature: id_signature.to_vec(),
            ephemeral_pubkey: ephemeral_pubkey.to_vec(),
            record,
        };
        let handshake_nonce = random_nonce();
        let mut packet = Packet::new_handshake(handshake_nonce, &handshake);
        let plaintext = carried
            .as_ref()
            .and_then(|id| self.pending_requests.get(id))
            .map(|p| p.request.encode())
            .unwrap_or_default();
        packet.message =
            match encrypt_message(&keys.encryption_key, &handshake_nonce, &plaintext, &challenge_data) {
                Ok(message) => message,
                Err(e) => {
                    if let Some(id) = carried {
                        session.queue.push_front(id);
                    }
                    self.remove_session(&node_address, RequestError::Session(SessionError::Crypto(e.clone())));
                    return Err(e.into());
                }
            };
        let bytes = packet.encode(&node_address.node_id);

        session.status = SessionStatus::HandshakeSent { keys };

        if let Some(id) = carried {
            if let Some(pending) = self.pending_requests.get_mut(&id) {
                if let Some(timer) = pending.timer.take() {
                    self.timers.cancel(timer);
                }
                pending.timer = Some(
                    self.timers
                        .insert(now + self.config.request_timeout, SessionTimer::Request(id.clone())),
                );
                pending.sent = Some(SentPacket {
                    nonce: handshake_nonce,
                    flag: PacketFlag::Handshake,
                    bytes: bytes.clone(),
                });
                self.awaiting_whoareyou
                    .insert(handshake_nonce, (node_address, Some(id)));
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            debug!("Answering challenge from {} with handshake", node_address);
        }
        self.send_bytes(src, PacketFlag::Handshake, bytes);
        Ok(())
    }

    fn on_handshake(&mut self, src: SocketAddr, packet: Packet, now: Instant) -> DiscoveryResult<()> {
        let authdata = HandshakeAuthdata::from_bytes(&packet.header.authdata).map_err(DecodeError::from)?;
        let node_address = NodeAddress::new(authdata.src_id, src);

        let (challenge_data, known_record) = match self.sessions.peek(&node_address).map(|s| &s.status) {
            Some(SessionStatus::WhoAreYouSent {
                challenge_data,
                remote_record,
            }) => (challenge_data.clone(), remote_record.clone()),
            status => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!(
                        "Unexpected handshake from {} in state {}",
                        node_address,
                        status.map_or("none", SessionStatus::name)
                    );
                }
                return Ok(());
            }
        };

        let backend = self.identity.backend().clone();
        let sent_record = match authdata.record.as_deref().map(NodeRecord::decode).transpose() {
            Ok(record) => record,
            Err(e) => {
                self.remove_session(&node_address, RequestError::Session(SessionError::NoSession(node_address)));
                return Err(e.into());
            }
        };
        if let Some(record) = &sent_record {
            if *record.node_id() != authdata.src_id || !record.verify(backend.as_ref()) {
                if log::log_enabled!(log::Level::Warn) {
                    warn!("Handshake from {} carries an invalid record", node_address);
                }
                self.remove_session(&node_address, RequestError::Session(SessionError::NoSession(node_address)));
                return Err(CryptoError::InvalidSignature.into());
            }
        }

        let record = match (sent_record, known_record) {
            (Some(sent), Some(known)) if known.seq() > sent.seq() => Some(known),
            (Some(sent), _) => Some(sent),
            (None, known) => known,
        };
        let Some(record) = record else {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Handshake from {} without a record to verify against", node_address);
            }
            self.remove_session(&node_address, RequestError::Session(SessionError::NoSession(node_address)));
            return Ok(());
        };

        if !verify_id_nonce(
            backend.as_ref(),
            record.public_key(),
            &challenge_data,
            &authdata.ephemeral_pubkey,
            self.identity.node_id(),
            &authdata.id_signature,
        ) {
            if log::log_enabled!(log::Level::Warn) {
                warn!("Invalid identity signature from {}", node_address);
            }
            self.remove_session(
                &node_address,
                RequestError::Session(SessionError::Crypto(CryptoError::InvalidSignature)),
            );
            return Err(CryptoError::InvalidSignature.into());
        }

        let established = derive_keys_from_ephemeral(
            &self.identity,
            &authdata.src_id,
            &authdata.ephemeral_pubkey,
            &challenge_data,
        )
        .map_err(DiscoveryError::from)
        .and_then(|keys| {
            let plaintext = decrypt_message(
                &keys.decryption_key,
                &packet.header.nonce,
                &packet.message,
                &challenge_data,
            )?;
            Ok((keys, plaintext))
        });
        let (keys, plaintext) = match established {
            Ok(result) => result,
            Err(e) => {
                self.remove_session(&node_address, RequestError::Session(SessionError::NoSession(node_address)));
                return Err(e);
            }
        };

        if log::log_enabled!(log::Level::Debug) {
            debug!("Session established with {} (incoming)", node_address);
        }
        self.establish(node_address, keys, Some(record), Direction::Incoming, now);

        if plaintext.is_empty() {
            return Ok(());
        }
        self.handle_plaintext(node_address, &plaintext, now)
    }

    fn complete_outgoing(&mut self, node_address: NodeAddress, now: Instant) {
        let Some(session) = self.sessions.peek(&node_address) else {
            return;
        };
        let SessionStatus::HandshakeSent { keys } = &session.status else {
            return;
        };
        let keys = keys.clone();
        let record = session.contact.as_ref().and_then(Contact::record).cloned();

        if log::log_enabled!(log::Level::Debug) {
            debug!("Session established with {} (outgoing)", node_address);
        }
        self.establish(node_address, keys, record, Direction::Outgoing, now);
    }

    fn establish(
        &mut self,
        node_address: NodeAddress,
        keys: SessionKeys,
        record: Option<NodeRecord>,
        direction: Direction,
        now: Instant,
    ) {
        let Some(session) = self.sessions.get_mut(&node_address) else {
            return;
        };
        session.status = SessionStatus::Established { keys: keys.clone() };
        if let Some(timer) = session.establish_timer.take() {
            self.timers.cancel(timer);
        }
        if let Some(timer) = session.expire_timer.take() {
            self.timers.cancel(timer);
        }
        session.expire_timer = Some(self.timers.insert(
            now + self.config.session_timeout,
            SessionTimer::Expire(node_address),
        ));
        if let Some(record) = &record {
            session.contact = Some(Contact::Record(record.clone()));
        }
        let queued: Vec<RequestId> = session.queue.drain(..).collect();

        self.awaiting_whoareyou
            .retain(|_, (addr, id)| *addr != node_address || id.is_some());

        self.emit(SessionEvent::Established {
            node_address,
            record,
            direction,
        });

        for id in queued {
            if let Err(e) = self.transmit(&id, &keys, now) {
                self.fail_request(&id, RequestError::Session(SessionError::Crypto(e)));
            }
        }
    }

    /// Seal a registered request and send it, arming its retransmission timer.
    fn transmit(&mut self, id: &RequestId, keys: &SessionKeys, now: Instant) -> Result<(), CryptoError> {
        let Some(pending) = self.pending_requests.get_mut(id) else {
            return Ok(());
        };
        let sent = seal_message(
            self.identity.node_id(),
            &pending.node_address.node_id,
            keys,
            &pending.request.encode(),
        )?;

        if let Some(previous) = pending.sent.take() {
            self.awaiting_whoareyou.remove(&previous.nonce);
        }
        if let Some(timer) = pending.timer.take() {
            self.timers.cancel(timer);
        }
        pending.timer = Some(
            self.timers
                .insert(now + self.config.request_timeout, SessionTimer::Request(id.clone())),
        );
        self.awaiting_whoareyou
            .insert(sent.nonce, (pending.node_address, Some(id.clone())));

        let dest = pending.node_address.socket_addr;
        let bytes = sent.bytes.clone();
        pending.sent = Some(sent);
        self.send_bytes(dest, PacketFlag::Message, bytes);
        Ok(())
    }

    fn handle_plaintext(
        &mut self,
        node_address: NodeAddress,
        plaintext: &[u8],
        now: Instant,
    ) -> DiscoveryResult<()> {
        match Message::decode(plaintext)? {
            Message::Request(request) => self.emit(SessionEvent::Request {
                node_address,
                request,
            }),
            Message::Response(response) => self.on_response(node_address, response, now),
        }
        Ok(())
    }

    fn on_response(&mut self, node_address: NodeAddress, response: Response, now: Instant) {
        let Some(pending) = self.pending_requests.get_mut(&response.id) else {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Response {} from {} matches no request", response.id, node_address);
            }
            return;
        };
        if pending.node_address != node_address {
            if log::log_enabled!(log::Level::Warn) {
                warn!(
                    "Response {} from {}, expected {}",
                    response.id, node_address, pending.node_address
                );
            }
            return;
        }

        if let ResponseBody::Nodes { total, .. } = &response.body {
            let expected = (*total).clamp(1, MAX_NODES_PACKETS);
            pending.nodes_received += 1;
            if pending.nodes_received < expected {
                // more NODES packets to come; the retry timer becomes a plain deadline
                if let Some(timer) = pending.timer.take() {
                    self.timers.cancel(timer);
                }
                pending.timer = Some(self.timers.insert(
                    now + self.config.request_timeout,
                    SessionTimer::Request(response.id.clone()),
                ));
                self.emit(SessionEvent::Response {
                    node_address,
                    response,
                });
                return;
            }
        }

        self.remove_pending(&response.id);
        self.emit(SessionEvent::Response {
            node_address,
            response,
        });
    }

    fn remove_pending(&mut self, id: &RequestId) -> Option<PendingRequest> {
        let mut pending = self.pending_requests.remove(id)?;
        if let Some(timer) = pending.timer.take() {
            self.timers.cancel(timer);
        }
        if let Some(sent) = &pending.sent {
            self.awaiting_whoareyou.remove(&sent.nonce);
        }
        Some(pending)
    }

    fn fail_request(&mut self, id: &RequestId, error: RequestError) {
        if let Some(pending) = self.remove_pending(id) {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Request {} to {} failed: {}", id, pending.node_address, error);
            }
            self.emit(SessionEvent::RequestFailed {
                request_id: id.clone(),
                node_address: pending.node_address,
                error,
            });
        }
    }

    fn insert_session(&mut self, node_address: NodeAddress, session: Session) {
        if let Some((evicted_address, evicted)) = self.sessions.push(node_address, session) {
            if evicted_address != node_address {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Session cache full, evicting {}", evicted_address);
                }
                self.discard_session(&evicted_address, evicted, RequestError::SessionEvicted);
            }
        }
    }

    fn remove_session(&mut self, node_address: &NodeAddress, error: RequestError) {
        if let Some(session) = self.sessions.pop(node_address) {
            self.discard_session(node_address, session, error);
        }
    }

    fn discard_session(&mut self, node_address: &NodeAddress, session: Session, error: RequestError) {
        if let Some(timer) = session.establish_timer {
            self.timers.cancel(timer);
        }
        if let Some(timer) = session.expire_timer {
            self.timers.cancel(timer);
        }
        self.awaiting_whoareyou
            .retain(|_, (addr, id)| addr != node_address || id.is_some());
        for id in session.queue {
            self.fail_request(&id, error.clone());
        }
    }

    /// Fire every timer due at `now`.
    pub fn on_timeout(&mut self, now: Instant) {
        while let Some((handle, timer)) = self.timers.pop_expired(now) {
            match timer {
                SessionTimer::Request(id) => self.on_request_timeout(handle, id, now),
                SessionTimer::Establish(node_address) => {
                    let current = self
                        .sessions
                        .peek(&node_address)
                        .is_some_and(|s| s.establish_timer == Some(handle));
                    if current {
                        if log::log_enabled!(log::Level::Debug) {
                            debug!("Handshake with {} timed out", node_address);
                        }
                        self.remove_session(&node_address, RequestError::SessionEstablishTimeout);
                    }
                }
                SessionTimer::Expire(node_address) => {
                    let current = self
                        .sessions
                        .peek(&node_address)
                        .is_some_and(|s| s.expire_timer == Some(handle));
                    if current {
                        if log::log_enabled!(log::Level::Debug) {
                            debug!("Session with {} expired", node_address);
                        }
                        self.remove_session(&node_address, RequestError::SessionEvicted);
                    }
                }
            }
        }
    }

    fn on_request_timeout(&mut self, handle: TimerHandle, id: RequestId, now: Instant) {
        let Some(pending) = self.pending_requests.get_mut(&id) else {
            return;
        };
        if pending.timer != Some(handle) {
            return;
        }
        pending.timer = None;

        if pending.nodes_received == 0 && pending.retries < self.config.request_retries {
            if let Some(sent) = &pending.sent {
                pending.retries += 1;
                pending.timer = Some(
                    self.timers
                        .insert(now + self.config.request_timeout, SessionTimer::Request(id.clone())),
                );
                if log::log_enabled!(log::Level::Debug) {
                    debug!(
                        "Retrying request {} to {} ({}/{})",
                        id, pending.node_address, pending.retries, self.config.request_retries
                    );
                }
                let (dest, flag, bytes) = (pending.node_address.socket_addr, sent.flag, sent.bytes.clone());
                self.send_bytes(dest, flag, bytes);
                return;
            }
        }
        self.fail_request(&id, RequestError::Timeout);
    }

    /// Drop every session and request without reporting them.
    pub fn clear(&mut self) {
        self.sessions.clear();
        self.awaiting_whoareyou.clear();
        self.pending_requests.clear();
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::super::crypto::Secp256k1Backend;
    use super::super::messages::RequestBody;
    use super::*;
    use std::net::IpAddr;

    struct TestNode {
        service: SessionService,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        outbound: mpsc::UnboundedReceiver<OutboundPacket>,
        record: NodeRecord,
        addr: SocketAddr,
    }

    fn config() -> SessionConfig {
        SessionConfig {
            request_timeout: Duration::from_secs(1),
            request_retries: 1,
            session_timeout: Duration::from_secs(3600),
            session_cache_capacity: 16,
            session_establish_timeout: Duration::from_secs(5),
        }
    }

    fn node(port: u16) -> TestNode {
        let identity =
            Arc::new(NodeIdentity::generate(Arc::new(Secp256k1Backend::new())).unwrap());
        let addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], port));
        let record = NodeRecord::new(&identity, 1, Some(addr)).unwrap();
        let (service, events, outbound) =
            SessionService::new(identity, record.clone(), config()).unwrap();
        TestNode {
            service,
            events,
            outbound,
            record,
            addr,
        }
    }

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    /// Deliver everything `from` has queued to `to`, returning the flags seen.
    fn deliver(from: &mut TestNode, to: &mut TestNode, now: Instant) -> Vec<PacketFlag> {
        let mut flags = Vec::new();
        for packet in drain(&mut from.outbound) {
            assert_eq!(packet.dest, to.addr);
            flags.push(packet.flag);
            let decoded = Packet::decode(to.record.node_id(), &packet.bytes).unwrap();
            assert_eq!(decoded.header.flag, packet.flag);
            let _ = to.service.on_packet(from.addr, decoded, now);
        }
        flags
    }

    fn ping() -> Request {
        Request {
            id: RequestId::random(),
            body: RequestBody::Ping { enr_seq: 1 },
        }
    }

    fn pong(id: RequestId) -> Response {
        Response {
            id,
            body: ResponseBody::Pong {
                enr_seq: 1,
                ip: IpAddr::from([127, 0, 0, 1]),
                port: 9000,
            },
        }
    }

    /// Run the handshake for a ping from `a` to `b` and answer it.
    fn establish(a: &mut TestNode, b: &mut TestNode, now: Instant) -> Vec<PacketFlag> {
        let request = ping();
        let request_id = request.id.clone();
        a.service
            .send_request(Contact::Record(b.record.clone()), request, now)
            .unwrap();

        let mut flags = deliver(a, b, now);
        let b_addr = NodeAddress::new(*a.record.node_id(), a.addr);
        for event in drain(&mut b.events) {
            if let SessionEvent::WhoAreYouRequest { node_address, nonce } = event {
                assert_eq!(node_address, b_addr);
                b.service.send_whoareyou(node_address, nonce, None, now);
            }
        }
        flags.extend(deliver(b, a, now));
        flags.extend(deliver(a, b, now));

        let events = drain(&mut b.events);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Established { direction: Direction::Incoming, record: Some(r), .. }
                if r == &a.record
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Request { request, .. } if request.id == request_id
        )));
        b.service.send_response(b_addr, pong(request_id)).unwrap();
        deliver(b, a, now);
        flags
    }

    #[test]
    fn test_handshake_flow() {
        let mut a = node(9000);
        let mut b = node(9001);
        let now = Instant::now();

        let flags = establish(&mut a, &mut b, now);
        assert_eq!(
            flags,
            vec![PacketFlag::Message, PacketFlag::WhoAreYou, PacketFlag::Handshake]
        );

        let events = drain(&mut a.events);
        assert!(matches!(
            events[0],
            SessionEvent::Established { direction: Direction::Outgoing, .. }
        ));
        assert!(matches!(events[1], SessionEvent::Response { .. }));

        let b_address = NodeAddress::new(*b.record.node_id(), b.addr);
        assert!(a.service.is_established(&b_address));
        assert_eq!(a.service.pending_request_count(), 0);
    }

    #[test]
    fn test_queued_requests_flushed_in_order() {
        let mut a = node(9010);
        let mut b = node(9011);
        let now = Instant::now();

        let first = ping();
        let second = ping();
        let third = ping();
        let order = vec![first.id.clone(), second.id.clone(), third.id.clone()];
        let contact = Contact::Record(b.record.clone());
        a.service.send_request(contact.clone(), first, now).unwrap();
        a.service.send_request(contact.clone(), second, now).unwrap();
        a.service.send_request(contact, third, now).unwrap();

        // one random packet for the whole queue
        assert_eq!(deliver(&mut a, &mut b, now), vec![PacketFlag::Message]);
        for event in drain(&mut b.events) {
            if let SessionEvent::WhoAreYouRequest { node_address, nonce } = event {
                b.service.send_whoareyou(node_address, nonce, None, now);
            }
        }
        deliver(&mut b, &mut a, now);
        deliver(&mut a, &mut b, now);

        // answering the handshake request establishes a, which sends the rest
        let b_addr = NodeAddress::new(*a.record.node_id(), a.addr);
        b.service.send_response(b_addr, pong(order[0].clone())).unwrap();
        deliver(&mut b, &mut a, now);
        assert_eq!(
            deliver(&mut a, &mut b, now),
            vec![PacketFlag::Message, PacketFlag::Message]
        );

        let received: Vec<RequestId> = drain(&mut b.events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Request { request, .. } => Some(request.id),
                _ => None,
            })
            .collect();
        assert_eq!(received, order);
    }

    #[test]
    fn test_retry_then_timeout() {
        let mut a = node(9020);
        let mut b = node(9021);
        let now = Instant::now();
        establish(&mut a, &mut b, now);
        drain(&mut a.events);

        let request = ping();
        let id = request.id.clone();
        a.service
            .send_request(Contact::Record(b.record.clone()), request, now)
            .unwrap();
        let first = drain(&mut a.outbound);
        assert_eq!(first.len(), 1);

        a.service.on_timeout(now + Duration::from_secs(1));
        let retry = drain(&mut a.outbound);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].bytes, first[0].bytes);
        assert!(drain(&mut a.events).is_empty());

        a.service.on_timeout(now + Duration::from_secs(2));
        let events = drain(&mut a.events);
        assert!(matches!(
            &events[..],
            [SessionEvent::RequestFailed { request_id, error: RequestError::Timeout, .. }]
                if *request_id == id
        ));
    }

    #[test]
    fn test_establish_timeout_fails_queue() {
        let mut a = node(9030);
        let b = node(9031);
        let now = Instant::now();

        a.service
            .send_request(Contact::Record(b.record.clone()), ping(), now)
            .unwrap();
        assert_eq!(a.service.session_count(), 1);

        a.service.on_timeout(now + Duration::from_secs(5));
        assert_eq!(a.service.session_count(), 0);
        let events = drain(&mut a.events);
        assert!(matches!(
            &events[..],
            [SessionEvent::RequestFailed { error: RequestError::SessionEstablishTimeout, .. }]
        ));
    }

    #[test]
    fn test_invalid_signature_resets_session() {
        let mut a = node(9040);
        let mut b = node(9041);
        let now = Instant::now();

        a.service
            .send_request(Contact::Record(b.record.clone()), ping(), now)
            .unwrap();
        deliver(&mut a, &mut b, now);
        for event in drain(&mut b.events) {
            if let SessionEvent::WhoAreYouRequest { node_address, nonce } = event {
                b.service.send_whoareyou(node_address, nonce, None, now);
            }
        }
        deliver(&mut b, &mut a, now);

        let handshake = drain(&mut a.outbound).remove(0);
        let mut packet = Packet::decode(b.record.node_id(), &handshake.bytes).unwrap();
        let mut authdata = HandshakeAuthdata::from_bytes(&packet.header.authdata).unwrap();
        authdata.id_signature[0] ^= 0xff;
        packet.header.authdata = authdata.to_bytes();

        assert!(b.service.on_packet(a.addr, packet, now).is_err());
        assert_eq!(b.service.session_count(), 0);
        assert!(!drain(&mut b.events)
            .iter()
            .any(|e| matches!(e, SessionEvent::Established { .. })));
    }

    #[test]
    fn test_concurrent_handshake_tie_break() {
        let mut a = node(9050);
        let mut b = node(9051);
        let now = Instant::now();

        a.service
            .send_request(Contact::Record(b.record.clone()), ping(), now)
            .unwrap();
        b.service
            .send_request(Contact::Record(a.record.clone()), ping(), now)
            .unwrap();
        deliver(&mut a, &mut b, now);
        deliver(&mut b, &mut a, now);

        let a_challenges = drain(&mut a.events)
            .iter()
            .filter(|e| matches!(e, SessionEvent::WhoAreYouRequest { .. }))
            .count();
        let b_challenges = drain(&mut b.events)
            .iter()
            .filter(|e| matches!(e, SessionEvent::WhoAreYouRequest { .. }))
            .count();

        // only the node with the lower id answers the other's random packet
        if a.record.node_id().as_bytes() < b.record.node_id().as_bytes() {
            assert_eq!((a_challenges, b_challenges), (1, 0));
        } else {
            assert_eq!((a_challenges, b_challenges), (0, 1));
        }
    }

    #[test]
    fn test_lru_eviction_fails_queued() {
        let identity =
            Arc::new(NodeIdentity::generate(Arc::new(Secp256k1Backend::new())).unwrap());
        let record = NodeRecord::new(&identity, 1, None).unwrap();
        let mut small = config();
        small.session_cache_capacity = 1;
        let (mut service, mut events, _outbound) =
            SessionService::new(identity, record, small).unwrap();
        let now = Instant::now();

        let first = node(9060);
        let second = node(9061);
        service
            .send_request(Contact::Record(first.record.clone()), ping(), now)
            .unwrap();
        service
            .send_request(Contact::Record(second.record.clone()), ping(), now)
            .unwrap();

        assert_eq!(service.session_count(), 1);
        assert!(matches!(
            &drain(&mut events)[..],
            [SessionEvent::RequestFailed { error: RequestError::SessionEvicted, .. }]
        ));
    }

    #[test]
    fn test_self_session_rejected() {
        let mut a = node(9070);
        let contact = Contact::Record(a.record.clone());
        assert_eq!(
            a.service.send_request(contact, ping(), Instant::now()),
            Err(SessionError::SelfSession)
        );
        assert_eq!(a.service.pending_request_count(), 0);
    }
}
