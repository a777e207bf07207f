//! Protocol orchestration on top of the session layer.
//!
//! [`Service`] owns the routing table, running lookups, requests in flight
//! and NODES reassembly. It is driven by the reactor in
//! [`super::server`]: every inbound datagram, timer expiry and API call
//! goes through a `&mut self` method, and the packets it produces are
//! collected with [`Service::drain_outbound`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::addr_votes::AddrVotes;
use super::config::DiscoveryConfig;
use super::error::{CryptoError, DiscoveryResult, RequestError, SessionError};
use super::identity::{log2_distance, NodeAddress, NodeId, NodeIdentity};
use super::lookup::{Lookup, LookupId, LookupStep};
use super::messages::{
    pack_nodes, Request, RequestBody, RequestId, Response, ResponseBody, MAX_NODES_PACKETS,
    MAX_NODES_RESPONSE,
};
use super::packet::Packet;
use super::rate_limiter::RateLimiter;
use super::record::{Contact, NodeRecord};
use super::routing_table::{EntryStatus, InsertResult, RoutingTable, TableEvent};
use super::session::{Direction, OutboundPacket, SessionEvent, SessionService};
use super::timer::{TimerHandle, TimerQueue};

/// Events surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A record not in the routing table was learned from a NODES response.
    Discovered(NodeRecord),
    /// A record entered the routing table, possibly replacing `replaced`.
    EnrAdded {
        record: NodeRecord,
        replaced: Option<NodeId>,
    },
    /// The local record now advertises this address.
    AddressUpdated(SocketAddr),
    TalkRequestReceived(TalkRequest),
    TalkResponseReceived {
        node_id: NodeId,
        response: Vec<u8>,
    },
}

/// Inbound TALKREQ, answered with [`Service::send_talk_response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TalkRequest {
    pub id: RequestId,
    pub node_address: NodeAddress,
    pub protocol: Vec<u8>,
    pub payload: Vec<u8>,
}

/// Answer to a PING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResponse {
    pub enr_seq: u64,
    /// Our address as seen by the peer.
    pub observed_addr: SocketAddr,
}

pub type FindNodeResult = Result<Vec<NodeRecord>, RequestError>;
pub type PingResult = Result<PingResponse, RequestError>;
pub type TalkResult = Result<Vec<u8>, RequestError>;

enum RequestCallback {
    FindNode(oneshot::Sender<FindNodeResult>),
    Ping(oneshot::Sender<PingResult>),
    Talk(oneshot::Sender<TalkResult>),
}

impl RequestCallback {
    fn fail(self, error: RequestError) {
        // receivers may be gone, the caller lost interest
        match self {
            Self::FindNode(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Ping(tx) => {
                let _ = tx.send(Err(error));
            }
            Self::Talk(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

struct ActiveRequest {
    contact: Contact,
    body: RequestBody,
    lookup_id: Option<LookupId>,
    callback: Option<RequestCallback>,
}

#[derive(Default)]
struct NodesReassembly {
    expected: u64,
    received: u64,
    records: Vec<NodeRecord>,
}

struct ActiveLookup {
    lookup: Lookup,
    callback: Option<oneshot::Sender<Vec<NodeRecord>>>,
}

pub struct Service {
    identity: Arc<NodeIdentity>,
    local_record: NodeRecord,
    config: DiscoveryConfig,
    session: SessionService,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    outbound: mpsc::UnboundedReceiver<OutboundPacket>,
    table: RoutingTable,
    table_events: mpsc::UnboundedReceiver<TableEvent>,
    lookups: HashMap<LookupId, ActiveLookup>,
    next_lookup_id: LookupId,
    active_requests: HashMap<RequestId, ActiveRequest>,
    nodes_reassembly: HashMap<RequestId, NodesReassembly>,
    ping_timers: TimerQueue<NodeId>,
    ping_handles: HashMap<NodeId, TimerHandle>,
    addr_votes: AddrVotes,
    rate_limiter: RateLimiter,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl Service {
    pub fn new(
        identity: Arc<NodeIdentity>,
        local_record: NodeRecord,
        config: DiscoveryConfig,
    ) -> DiscoveryResult<(Self, mpsc::UnboundedReceiver<DiscoveryEvent>)> {
        config.validate()?;

        let (session, session_events, outbound) =
            SessionService::new(identity.clone(), local_record.clone(), config.session_config())?;
        let (table, table_events) = RoutingTable::new(
            *identity.node_id(),
            config.bucket_size,
            config.pending_timeout,
        );
        let rate_limiter =
            RateLimiter::new(config.ip_quota(), config.global_quota(), config.ban_duration)?;
        let (events, events_rx) = mpsc::unbounded_channel();

        let service = Self {
            addr_votes: AddrVotes::new(config.addr_votes_to_update_enr),
            identity,
            local_record,
            config,
            session,
            session_events,
            outbound,
            table,
            table_events,
            lookups: HashMap::new(),
            next_lookup_id: 0,
            active_requests: HashMap::new(),
            nodes_reassembly: HashMap::new(),
            ping_timers: TimerQueue::new(),
            ping_handles: HashMap::new(),
            rate_limiter,
            events,
        };
        Ok((service, events_rx))
    }

    pub fn local_id(&self) -> &NodeId {
        self.identity.node_id()
    }

    pub fn local_record(&self) -> &NodeRecord {
        &self.local_record
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn active_request_count(&self) -> usize {
        self.active_requests.len()
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.len()
    }

    fn emit(&self, event: DiscoveryEvent) {
        let _ = self.events.send(event);
    }

    /// Packets produced since the last call.
    pub fn drain_outbound(&mut self) -> Vec<OutboundPacket> {
        let mut packets = Vec::new();
        while let Ok(packet) = self.outbound.try_recv() {
            packets.push(packet);
        }
        packets
    }

    /// Entry point for every datagram read from the socket.
    pub fn handle_datagram(&mut self, src: SocketAddr, data: &[u8], now: Instant) {
        if !self.rate_limiter.allows(src.ip(), now) {
            return;
        }

        let packet = match Packet::decode(self.identity.node_id(), data) {
            Ok(packet) => packet,
            Err(e) => {
                metrics::counter!("discv5_packets_dropped_total").increment(1);
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Dropping packet from {}: {}", src, e);
                }
                return;
            }
        };

        if let Err(e) = self.session.on_packet(src, packet, now) {
            metrics::counter!("discv5_packets_dropped_total").increment(1);
            if log::log_enabled!(log::Level::Debug) {
                debug!("Failed to process packet from {}: {}", src, e);
            }
        }
        self.process(now);
    }

    /// Earliest instant at which [`Service::on_timeout`] has work to do.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        [
            self.session.next_deadline(),
            self.table.next_deadline(),
            self.ping_timers.next_deadline(),
            self.lookups.values().map(|l| l.lookup.deadline()).min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn on_timeout(&mut self, now: Instant) {
        self.session.on_timeout(now);
        self.table.apply_pending(now);

        while let Some((_, node_id)) = self.ping_timers.pop_expired(now) {
            self.ping_handles.remove(&node_id);
            match self.table.get(&node_id) {
                Some(entry) if entry.is_connected() => {
                    let contact = Contact::Record(entry.record.clone());
                    self.send_ping(contact, None, now);
                    self.schedule_ping(node_id, now);
                }
                _ => {}
            }
        }

        let expired: Vec<LookupId> = self
            .lookups
            .iter()
            .filter(|(_, l)| l.lookup.deadline() <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.advance_lookup(id, now);
        }

        self.process(now);
    }

    /// Handle everything the session layer and the table have signalled.
    fn process(&mut self, now: Instant) {
        loop {
            if let Ok(event) = self.session_events.try_recv() {
                self.on_session_event(event, now);
                continue;
            }
            if let Ok(event) = self.table_events.try_recv() {
                self.on_table_event(event, now);
                continue;
            }
            break;
        }
    }

    fn on_session_event(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::Established {
                node_address,
                record,
                direction,
            } => self.on_established(node_address, record, direction, now),
            SessionEvent::WhoAreYouRequest {
                node_address,
                nonce,
            } => {
                let record = self
                    .table
                    .get(&node_address.node_id)
                    .map(|entry| entry.record.clone());
                self.session.send_whoareyou(node_address, nonce, record, now);
            }
            SessionEvent::Request {
                node_address,
                request,
            } => self.handle_request(node_address, request, now),
            SessionEvent::Response {
                node_address,
                response,
            } => self.handle_response(node_address, response, now),
            SessionEvent::RequestFailed {
                request_id, error, ..
            } => self.handle_request_failure(request_id, error, now),
        }
    }

    fn on_table_event(&mut self, event: TableEvent, now: Instant) {
        match event {
            TableEvent::PendingEviction { candidate, pending } => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!(
                        "Bucket full for {}, probing {}",
                        pending,
                        candidate.node_id()
                    );
                }
                self.send_ping(Contact::Record(candidate), None, now);
            }
            TableEvent::AppliedEviction { inserted, evicted } => {
                let node_id = *inserted.node_id();
                if let Some(evicted) = &evicted {
                    self.cancel_ping(evicted.node_id());
                }
                if self.table.get(&node_id).is_some_and(|e| e.is_connected()) {
                    self.schedule_ping(node_id, now);
                }
                self.emit(DiscoveryEvent::EnrAdded {
                    record: inserted,
                    replaced: evicted.map(|r| *r.node_id()),
                });
            }
        }
    }

    fn on_established(
        &mut self,
        node_address: NodeAddress,
        record: Option<NodeRecord>,
        direction: Direction,
        now: Instant,
    ) {
        if log::log_enabled!(log::Level::Debug) {
            debug!("Session established with {} ({:?})", node_address, direction);
        }

        match record {
            // only records reachable at the address we talk to go into the table
            Some(record) if record.udp_socket() == Some(node_address.socket_addr) => {
                self.connect(record, now);
            }
            Some(_) => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!(
                        "Record of {} does not advertise {}, not adding it",
                        node_address.node_id, node_address.socket_addr
                    );
                }
            }
            None if direction == Direction::Outgoing => {
                // raw contact: ask the peer for its record
                let contact = self
                    .active_requests
                    .values()
                    .map(|r| &r.contact)
                    .find(|c| c.node_id() == node_address.node_id)
                    .cloned();
                if let Some(contact) = contact {
                    let body = RequestBody::FindNode { distances: vec![0] };
                    if let Err(e) = self.send_request(contact, body, None, None, now) {
                        if log::log_enabled!(log::Level::Debug) {
                            debug!("Cannot request record of {}: {}", node_address, e);
                        }
                    }
                }
            }
            None => {}
        }
    }

    /// Insert or refresh a peer we hold a session with.
    fn connect(&mut self, record: NodeRecord, now: Instant) {
        let node_id = *record.node_id();
        match self
            .table
            .insert_or_update(record.clone(), EntryStatus::Connected, now)
        {
            InsertResult::Inserted => {
                self.schedule_ping(node_id, now);
                self.emit(DiscoveryEvent::EnrAdded {
                    record,
                    replaced: None,
                });
            }
            InsertResult::StatusUpdatedAndPromoted | InsertResult::UpdatedAndPromoted => {
                self.schedule_ping(node_id, now);
            }
            result => {
                if log::log_enabled!(log::Level::Trace) {
                    trace!("Table insert of {}: {:?}", node_id, result);
                }
            }
        }
    }

    fn schedule_ping(&mut self, node_id: NodeId, now: Instant) {
        self.cancel_ping(&node_id);
        let handle = self
            .ping_timers
            .insert(now + self.config.ping_interval, node_id);
        self.ping_handles.insert(node_id, handle);
    }

    fn cancel_ping(&mut self, node_id: &NodeId) {
        if let Some(handle) = self.ping_handles.remove(node_id) {
            self.ping_timers.cancel(handle);
        }
    }

    /// Register a request and hand it to the session layer.
    fn send_request(
        &mut self,
        contact: Contact,
        body: RequestBody,
        lookup_id: Option<LookupId>,
        callback: Option<RequestCallback>,
        now: Instant,
    ) -> Result<RequestId, SessionError> {
        let ip = contact.ip();
        let request = Request {
            id: RequestId::random(),
            body: body.clone(),
        };
        let id = request.id.clone();

        self.active_requests.insert(
            id.clone(),
            ActiveRequest {
                contact: contact.clone(),
                body,
                lookup_id,
                callback,
            },
        );
        if let Some(ip) = ip {
            self.rate_limiter.add_expected_response(ip);
        }

        if let Err(e) = self.session.send_request(contact, request, now) {
            if let Some(active) = self.active_requests.remove(&id) {
                if let Some(ip) = ip {
                    self.rate_limiter.remove_expected_response(ip);
                }
                if let Some(callback) = active.callback {
                    callback.fail(RequestError::Session(e.clone()));
                }
            }
            return Err(e);
        }
        Ok(id)
    }

    fn send_ping(
        &mut self,
        contact: Contact,
        callback: Option<RequestCallback>,
        now: Instant,
    ) {
        let node_id = contact.node_id();
        let body = RequestBody::Ping {
            enr_seq: self.local_record.seq(),
        };
        if let Err(e) = self.send_request(contact, body, None, callback, now) {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Failed to ping {}: {}", node_id, e);
            }
        }
    }

    /// Start a lookup for `target`. `callback` receives the closest nodes
    /// found; it is dropped without a value if the service stops first.
    pub fn find_node(
        &mut self,
        target: NodeId,
        callback: Option<oneshot::Sender<Vec<NodeRecord>>>,
        now: Instant,
    ) -> LookupId {
        let id = self.next_lookup_id;
        self.next_lookup_id = self.next_lookup_id.wrapping_add(1);

        let seeds = self.table.closest(&target, self.config.lookup_parallelism);
        if log::log_enabled!(log::Level::Debug) {
            debug!("Starting lookup {} for {} with {} seeds", id, target, seeds.len());
        }
        let lookup = Lookup::new(target, seeds, self.config.lookup_config(), now);
        self.lookups.insert(id, ActiveLookup { lookup, callback });
        self.advance_lookup(id, now);
        self.process(now);
        id
    }

    fn advance_lookup(&mut self, id: LookupId, now: Instant) {
        loop {
            let Some(active) = self.lookups.get_mut(&id) else {
                return;
            };
            match active.lookup.next_step(now) {
                LookupStep::Contact { record, distances } => {
                    let node_id = *record.node_id();
                    let body = RequestBody::FindNode { distances };
                    if self
                        .send_request(Contact::Record(record), body, Some(id), None, now)
                        .is_err()
                    {
                        if let Some(active) = self.lookups.get_mut(&id) {
                            active.lookup.on_failure(&node_id);
                        }
                    }
                }
                LookupStep::Waiting => return,
                LookupStep::Finished => {
                    self.finish_lookup(id);
                    return;
                }
            }
        }
    }

    fn finish_lookup(&mut self, id: LookupId) {
        let Some(active) = self.lookups.remove(&id) else {
            return;
        };
        let result = active.lookup.result();
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "Lookup {} for {} finished with {} results",
                id,
                active.lookup.target(),
                result.len()
            );
        }
        if let Some(callback) = active.callback {
            let _ = callback.send(result);
        }
    }

    /// Single FINDNODE to `contact`, outside any lookup.
    pub fn find_node_at(
        &mut self,
        contact: Contact,
        distances: Vec<u64>,
        callback: oneshot::Sender<FindNodeResult>,
        now: Instant,
    ) {
        let body = RequestBody::FindNode { distances };
        let _ = self.send_request(
            contact,
            body,
            None,
            Some(RequestCallback::FindNode(callback)),
            now,
        );
        self.process(now);
    }

    pub fn ping(&mut self, contact: Contact, callback: oneshot::Sender<PingResult>, now: Instant) {
        self.send_ping(contact, Some(RequestCallback::Ping(callback)), now);
        self.process(now);
    }

    pub fn talk_request(
        &mut self,
        contact: Contact,
        protocol: Vec<u8>,
        payload: Vec<u8>,
        callback: oneshot::Sender<TalkResult>,
        now: Instant,
    ) {
        let body = RequestBody::TalkReq {
            protocol,
            request: payload,
        };
        let _ = self.send_request(contact, body, None, Some(RequestCallback::Talk(callback)), now);
        self.process(now);
    }

    pub fn send_talk_response(
        &mut self,
        node_address: NodeAddress,
        id: RequestId,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        let response = Response {
            id,
            body: ResponseBody::TalkResp { response: payload },
        };
        self.session.send_response(node_address, response)
    }

    /// Add a verified record to the table as disconnected.
    pub fn add_enr(&mut self, record: NodeRecord, now: Instant) -> Result<InsertResult, RequestError> {
        if !record.verify(self.identity.backend().as_ref()) {
            return Err(RequestError::Session(SessionError::Crypto(
                CryptoError::InvalidSignature,
            )));
        }
        let result = self
            .table
            .insert_or_update(record.clone(), EntryStatus::Disconnected, now);
        if result == InsertResult::Inserted {
            self.emit(DiscoveryEvent::EnrAdded {
                record,
                replaced: None,
            });
        }
        self.process(now);
        Ok(result)
    }

    fn handle_request(&mut self, node_address: NodeAddress, request: Request, now: Instant) {
        if log::log_enabled!(log::Level::Trace) {
            trace!("Request {} from {}: {:?}", request.id, node_address, request.body);
        }
        match request.body {
            RequestBody::Ping { enr_seq } => {
                let response = Response {
                    id: request.id,
                    body: ResponseBody::Pong {
                        enr_seq: self.local_record.seq(),
                        ip: node_address.socket_addr.ip(),
                        port: node_address.socket_addr.port(),
                    },
                };
                self.respond(node_address, response);
                self.check_record_seq(node_address, enr_seq, now);
            }
            RequestBody::FindNode { distances } => {
                self.handle_find_node(node_address, request.id, distances);
            }
            RequestBody::TalkReq { protocol, request: payload } => {
                self.emit(DiscoveryEvent::TalkRequestReceived(TalkRequest {
                    id: request.id,
                    node_address,
                    protocol,
                    payload,
                }));
            }
            RequestBody::RegTopic { .. } | RequestBody::TopicQuery { .. } => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Ignoring topic request from {}", node_address);
                }
            }
        }
    }

    fn respond(&mut self, node_address: NodeAddress, response: Response) {
        if let Err(e) = self.session.send_response(node_address, response) {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Failed to respond to {}: {}", node_address, e);
            }
        }
    }

    /// Fetch the record of a table peer advertising a newer sequence number.
    fn check_record_seq(&mut self, node_address: NodeAddress, enr_seq: u64, now: Instant) {
        let Some(entry) = self.table.get(&node_address.node_id) else {
            return;
        };
        if entry.record.seq() >= enr_seq {
            return;
        }
        let contact = Contact::Record(entry.record.clone());
        if log::log_enabled!(log::Level::Debug) {
            debug!("{} has a newer record ({}), requesting it", node_address, enr_seq);
        }
        let body = RequestBody::FindNode { distances: vec![0] };
        let _ = self.send_request(contact, body, None, None, now);
    }

    fn handle_find_node(&mut self, node_address: NodeAddress, id: RequestId, distances: Vec<u64>) {
        let mut records: Vec<NodeRecord> = Vec::new();
        let mut seen = Vec::new();
        for distance in distances {
            if records.len() >= MAX_NODES_RESPONSE {
                break;
            }
            if seen.contains(&distance) {
                continue;
            }
            seen.push(distance);

            if distance == 0 {
                records.push(self.local_record.clone());
            } else {
                records.extend(
                    self.table
                        .values(distance)
                        .iter()
                        .filter(|e| *e.node_id() != node_address.node_id)
                        .map(|e| e.record.clone()),
                );
            }
        }
        records.truncate(MAX_NODES_RESPONSE);

        let packets = pack_nodes(&records);
        let total = packets.len() as u64;
        if log::log_enabled!(log::Level::Trace) {
            trace!(
                "Answering FINDNODE from {} with {} records in {} packets",
                node_address,
                records.len(),
                total
            );
        }
        for nodes in packets {
            let response = Response {
                id: id.clone(),
                body: ResponseBody::Nodes { total, nodes },
            };
            self.respond(node_address, response);
        }
    }

    fn handle_response(&mut self, node_address: NodeAddress, response: Response, now: Instant) {
        let Some(active) = self.active_requests.get(&response.id) else {
            if log::log_enabled!(log::Level::Debug) {
                debug!("Unexpected response {} from {}", response.id, node_address);
            }
            return;
        };

        let expected = active.contact.node_address().ok();
        if expected != Some(node_address) {
            if log::log_enabled!(log::Level::Warn) {
                warn!(
                    "Response {} from {} (expected {:?})",
                    response.id, node_address, expected
                );
            }
            return;
        }
        // the session already dropped its side of the request
        if !response.body.match_request(&active.body) {
            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "Response {} from {} does not answer the request: {:?}",
                    response.id, node_address, response.body
                );
            }
            self.handle_request_failure(response.id, RequestError::ResponseMismatch, now);
            return;
        }

        match response.body {
            ResponseBody::Pong { enr_seq, ip, port } => {
                let Some(active) = self.complete_request(&response.id) else {
                    return;
                };
                self.on_pong(node_address, enr_seq, SocketAddr::new(ip, port), now);
                if let Some(RequestCallback::Ping(tx)) = active.callback {
                    let _ = tx.send(Ok(PingResponse {
                        enr_seq,
                        observed_addr: SocketAddr::new(ip, port),
                    }));
                }
            }
            ResponseBody::Nodes { total, nodes } => {
                self.on_nodes(node_address, response.id, total, nodes, now);
            }
            ResponseBody::TalkResp { response: payload } => {
                let Some(active) = self.complete_request(&response.id) else {
                    return;
                };
                self.emit(DiscoveryEvent::TalkResponseReceived {
                    node_id: node_address.node_id,
                    response: payload.clone(),
                });
                if let Some(RequestCallback::Talk(tx)) = active.callback {
                    let _ = tx.send(Ok(payload));
                }
            }
            ResponseBody::Ticket { .. } | ResponseBody::RegConfirmation { .. } => {
                self.complete_request(&response.id);
            }
        }
    }

    fn complete_request(&mut self, id: &RequestId) -> Option<ActiveRequest> {
        let active = self.active_requests.remove(id)?;
        if let Some(ip) = active.contact.ip() {
            self.rate_limiter.remove_expected_response(ip);
        }
        Some(active)
    }

    fn on_pong(&mut self, node_address: NodeAddress, enr_seq: u64, observed: SocketAddr, now: Instant) {
        if self.table.contains(&node_address.node_id) {
            self.table
                .update_status(&node_address.node_id, EntryStatus::Connected);
        }
        self.check_record_seq(node_address, enr_seq, now);

        if !self.config.enr_update {
            return;
        }
        if !self
            .addr_votes
            .add_vote(node_address.node_id, observed, now)
        {
            return;
        }
        if self.local_record.udp_socket() == Some(observed) {
            return;
        }

        let record = match self.local_record.with_udp_socket(&self.identity, observed) {
            Ok(record) => record,
            Err(e) => {
                if log::log_enabled!(log::Level::Warn) {
                    warn!("Failed to sign updated local record: {}", e);
                }
                return;
            }
        };
        if log::log_enabled!(log::Level::Info) {
            info!(
                "External address updated to {} (record seq {})",
                observed,
                record.seq()
            );
        }
        self.local_record = record.clone();
        self.session.update_local_record(record);
        self.emit(DiscoveryEvent::AddressUpdated(observed));

        // peers learn the new sequence number from our PING
        for record in self.table.connected() {
            self.send_ping(Contact::Record(record), None, now);
        }
    }

    fn on_nodes(
        &mut self,
        node_address: NodeAddress,
        id: RequestId,
        total: u64,
        nodes: Vec<NodeRecord>,
        now: Instant,
    ) {
        let requested = match self.active_requests.get(&id).map(|a| &a.body) {
            Some(RequestBody::FindNode { distances }) => Some(distances.clone()),
            _ => None,
        };
        let backend = self.identity.backend().clone();
        let mut records: Vec<NodeRecord> = nodes
            .into_iter()
            .filter(|record| {
                if !record.verify(backend.as_ref()) {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Invalid record {} from {}", record.node_id(), node_address);
                    }
                    return false;
                }
                match &requested {
                    Some(distances) => {
                        let distance =
                            log2_distance(&node_address.node_id, record.node_id()).unwrap_or(0);
                        distances.contains(&distance)
                    }
                    None => true,
                }
            })
            .collect();

        if total > 1 {
            let reassembly = self.nodes_reassembly.entry(id.clone()).or_default();
            reassembly.expected = total.min(MAX_NODES_PACKETS);
            reassembly.received += 1;
            let room = MAX_NODES_RESPONSE.saturating_sub(reassembly.records.len());
            reassembly.records.extend(records.into_iter().take(room));

            if reassembly.received < reassembly.expected {
                return;
            }
            records = self
                .nodes_reassembly
                .remove(&id)
                .map(|r| r.records)
                .unwrap_or_default();
        } else {
            records.truncate(MAX_NODES_RESPONSE);
        }

        let Some(active) = self.complete_request(&id) else {
            return;
        };
        self.discovered(node_address, records, active.lookup_id, active.callback, now);
    }

    /// Feed records learned from `node_address` into the table, lookups and callers.
    fn discovered(
        &mut self,
        node_address: NodeAddress,
        records: Vec<NodeRecord>,
        lookup_id: Option<LookupId>,
        callback: Option<RequestCallback>,
        now: Instant,
    ) {
        let local_id = *self.identity.node_id();
        let mut found = Vec::with_capacity(records.len());

        for record in records {
            let node_id = *record.node_id();
            if node_id == local_id {
                continue;
            }

            match self.table.get(&node_id) {
                Some(entry) => {
                    if record.seq() > entry.record.seq() {
                        self.table.update_record(record.clone());
                    }
                }
                None if node_id == node_address.node_id => {
                    // the responder's own record, fetched with FINDNODE [0]
                    if record.udp_socket() == Some(node_address.socket_addr) {
                        self.connect(record.clone(), now);
                    }
                }
                None => self.emit(DiscoveryEvent::Discovered(record.clone())),
            }
            found.push(record);
        }

        if let Some(id) = lookup_id {
            if let Some(active) = self.lookups.get_mut(&id) {
                active.lookup.on_success(&node_address.node_id, found.clone());
                self.advance_lookup(id, now);
            }
        }
        if let Some(RequestCallback::FindNode(tx)) = callback {
            let _ = tx.send(Ok(found));
        }
    }

    fn handle_request_failure(&mut self, id: RequestId, error: RequestError, now: Instant) {
        let Some(active) = self.complete_request(&id) else {
            return;
        };
        let node_id = active.contact.node_id();
        if log::log_enabled!(log::Level::Debug) {
            debug!("Request {} to {} failed: {}", id, node_id, error);
        }

        if self.table.contains(&node_id) {
            self.table.update_status(&node_id, EntryStatus::Disconnected);
        }

        // keep what arrived of a multi-packet NODES response
        if let Some(reassembly) = self.nodes_reassembly.remove(&id) {
            if !reassembly.records.is_empty() {
                if let Ok(node_address) = active.contact.node_address() {
                    self.discovered(
                        node_address,
                        reassembly.records,
                        active.lookup_id,
                        active.callback,
                        now,
                    );
                    return;
                }
            }
        }

        if let Some(lookup_id) = active.lookup_id {
            if let Some(lookup) = self.lookups.get_mut(&lookup_id) {
                lookup.lookup.on_failure(&node_id);
                self.advance_lookup(lookup_id, now);
            }
        }
        if let Some(callback) = active.callback {
            callback.fail(error);
        }
    }

    /// Look up a random target to keep the buckets fresh.
    pub fn refresh(&mut self, now: Instant) {
        if self.table.is_empty() {
            return;
        }
        self.find_node(NodeId::random(), None, now);
    }

    /// Ping bootstrap contacts while the table has no connected peer.
    pub fn bootstrap(&mut self, contacts: &[Contact], now: Instant) {
        if !self.table.connected().is_empty() {
            return;
        }
        for contact in contacts {
            if log::log_enabled!(log::Level::Info) {
                info!("Contacting bootstrap node {}", contact.node_id());
            }
            self.send_ping(contact.clone(), None, now);
        }
        self.process(now);
    }

    pub fn prune(&mut self, now: Instant) {
        self.rate_limiter.prune(now);
    }

    pub fn is_banned(&self, ip: &IpAddr, now: Instant) -> bool {
        self.rate_limiter.is_banned(ip, now)
    }

    /// Abandon all lookups and requests. Pending callbacks are dropped
    /// without a value.
    pub fn stop(&mut self) {
        self.lookups.clear();
        self.active_requests.clear();
        self.nodes_reassembly.clear();
        self.ping_timers.clear();
        self.ping_handles.clear();
        self.addr_votes.clear();
        self.rate_limiter.clear();
        self.session.clear();
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::super::crypto::Secp256k1Backend;
    use super::super::packet::PacketFlag;
    use super::*;
    use std::time::Duration;

    struct TestNode {
        service: Service,
        events: mpsc::UnboundedReceiver<DiscoveryEvent>,
        addr: SocketAddr,
    }

    fn node(port: u16) -> TestNode {
        node_with(port, DiscoveryConfig::default())
    }

    fn node_with(port: u16, config: DiscoveryConfig) -> TestNode {
        let identity =
            Arc::new(NodeIdentity::generate(Arc::new(Secp256k1Backend::new())).unwrap());
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let record = NodeRecord::new(&identity, 1, Some(addr)).unwrap();
        let (service, events) = Service::new(identity, record, config).unwrap();
        TestNode {
            service,
            events,
            addr,
        }
    }

    /// Deliver packets between the nodes until nothing is left in flight.
    fn run(nodes: &mut [&mut TestNode], now: Instant) -> Vec<PacketFlag> {
        let mut flags = Vec::new();
        loop {
            let mut in_flight = Vec::new();
            for (i, node) in nodes.iter_mut().enumerate() {
                for packet in node.service.drain_outbound() {
                    in_flight.push((i, packet));
                }
            }
            if in_flight.is_empty() {
                return flags;
            }
            for (from, packet) in in_flight {
                flags.push(packet.flag);
                let src = nodes[from].addr;
                if let Some(to) = nodes.iter_mut().find(|n| n.addr == packet.dest) {
                    to.service.handle_datagram(src, &packet.bytes, now);
                }
            }
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DiscoveryEvent>) -> Vec<DiscoveryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_find_node_establishes_session() {
        let mut a = node(9100);
        let mut b = node(9101);
        let now = Instant::now();
        let b_record = b.service.local_record().clone();
        let b_id = *b.service.local_id();

        a.service.add_enr(b_record.clone(), now).unwrap();
        let (tx, mut rx) = oneshot::channel();
        a.service.find_node(b_id, Some(tx), now);

        let flags = run(&mut [&mut a, &mut b], now);
        assert_eq!(
            flags[..3],
            [PacketFlag::Message, PacketFlag::WhoAreYou, PacketFlag::Handshake]
        );

        let result = rx.try_recv().unwrap();
        assert_eq!(result, vec![b_record]);

        let entry = a.service.table().get(&b_id).unwrap();
        assert!(entry.is_connected());
        // b learned a's record from the handshake
        assert!(b
            .service
            .table()
            .get(a.service.local_id())
            .is_some_and(|e| e.is_connected()));
        assert_eq!(a.service.lookup_count(), 0);
        assert_eq!(a.service.active_request_count(), 0);
    }

    #[test]
    fn test_lookup_walks_the_network() {
        let mut a = node(9110);
        let mut b = node(9111);
        let mut c = node(9112);
        let now = Instant::now();

        // b knows c, a only knows b
        let c_record = c.service.local_record().clone();
        b.service.add_enr(c_record.clone(), now).unwrap();
        a.service
            .add_enr(b.service.local_record().clone(), now)
            .unwrap();

        let (tx, mut rx) = oneshot::channel();
        let target = *c.service.local_id();
        a.service.find_node(target, Some(tx), now);
        run(&mut [&mut a, &mut b, &mut c], now);

        let result = rx.try_recv().unwrap();
        assert!(result.contains(&c_record));
        assert_eq!(result[0], c_record);
        assert!(drain(&mut a.events)
            .iter()
            .any(|e| matches!(e, DiscoveryEvent::Discovered(r) if r == &c_record)));
    }

    #[test]
    fn test_ping_and_talk() {
        let mut a = node(9120);
        let mut b = node(9121);
        let now = Instant::now();
        let b_contact = Contact::Record(b.service.local_record().clone());

        let (tx, mut rx) = oneshot::channel();
        a.service.ping(b_contact.clone(), tx, now);
        run(&mut [&mut a, &mut b], now);
        let pong = rx.try_recv().unwrap().unwrap();
        assert_eq!(pong.observed_addr, a.addr);
        assert_eq!(pong.enr_seq, 1);

        let (tx, mut rx) = oneshot::channel();
        a.service
            .talk_request(b_contact, b"echo".to_vec(), b"hello".to_vec(), tx, now);
        run(&mut [&mut a, &mut b], now);

        let request = drain(&mut b.events)
            .into_iter()
            .find_map(|e| match e {
                DiscoveryEvent::TalkRequestReceived(request) => Some(request),
                _ => None,
            })
            .unwrap();
        assert_eq!(request.protocol, b"echo");
        assert_eq!(request.payload, b"hello");

        b.service
            .send_talk_response(request.node_address, request.id, b"world".to_vec())
            .unwrap();
        run(&mut [&mut a, &mut b], now);
        assert_eq!(rx.try_recv().unwrap().unwrap(), b"world");
    }

    #[test]
    fn test_wrong_response_type_fails_request() {
        let mut a = node(9125);
        let mut b = node(9126);
        let now = Instant::now();
        let b_contact = Contact::Record(b.service.local_record().clone());

        let (tx, mut rx) = oneshot::channel();
        a.service
            .talk_request(b_contact, b"echo".to_vec(), b"hello".to_vec(), tx, now);
        run(&mut [&mut a, &mut b], now);

        let request = drain(&mut b.events)
            .into_iter()
            .find_map(|e| match e {
                DiscoveryEvent::TalkRequestReceived(request) => Some(request),
                _ => None,
            })
            .unwrap();

        // a PONG carrying the TALKREQ id
        b.service.respond(
            request.node_address,
            Response {
                id: request.id,
                body: ResponseBody::Pong {
                    enr_seq: 1,
                    ip: a.addr.ip(),
                    port: a.addr.port(),
                },
            },
        );
        run(&mut [&mut a, &mut b], now);

        assert_eq!(rx.try_recv().unwrap(), Err(RequestError::ResponseMismatch));
        assert_eq!(a.service.active_request_count(), 0);
    }

    #[test]
    fn test_raw_contact_fetches_record() {
        let mut a = node(9130);
        let mut b = node(9131);
        let now = Instant::now();
        let b_record = b.service.local_record().clone();
        let raw = Contact::raw(*b_record.public_key(), b.addr);

        let (tx, _rx) = oneshot::channel();
        a.service.ping(raw, tx, now);
        run(&mut [&mut a, &mut b], now);

        let entry = a.service.table().get(b_record.node_id()).unwrap();
        assert_eq!(entry.record, b_record);
        assert!(entry.is_connected());
    }

    #[test]
    fn test_findnode_response_split() {
        let mut a = node(9140);
        let mut b = node(9141);
        let now = Instant::now();

        // a full bucket at one distance needs several NODES packets
        let distance = 256;
        let mut added = 0;
        while added < MAX_NODES_RESPONSE {
            let identity = NodeIdentity::generate(Arc::new(Secp256k1Backend::new())).unwrap();
            let port = 10_000 + added as u16;
            let record =
                NodeRecord::new(&identity, 1, Some(SocketAddr::from(([10, 0, 0, 1], port))))
                    .unwrap();
            if log2_distance(b.service.local_id(), record.node_id()) == Some(distance) {
                b.service.add_enr(record, now).unwrap();
                added += 1;
            }
        }

        let (tx, mut rx) = oneshot::channel();
        let contact = Contact::Record(b.service.local_record().clone());
        a.service.find_node_at(contact, vec![distance], tx, now);
        run(&mut [&mut a, &mut b], now);

        let records = rx.try_recv().unwrap().unwrap();
        assert_eq!(records.len(), MAX_NODES_RESPONSE);
        assert_eq!(a.service.active_request_count(), 0);
        assert!(records
            .iter()
            .all(|r| log2_distance(b.service.local_id(), r.node_id()) == Some(distance)));
    }

    #[test]
    fn test_unreachable_peer_times_out() {
        let mut a = node(9150);
        let b = node(9151);
        let now = Instant::now();
        a.service
            .add_enr(b.service.local_record().clone(), now)
            .unwrap();

        let (tx, mut rx) = oneshot::channel();
        a.service.ping(Contact::Record(b.service.local_record().clone()), tx, now);
        assert_eq!(a.service.drain_outbound().len(), 1);

        let deadline = a.service.next_deadline().unwrap();
        a.service.on_timeout(deadline + Duration::from_secs(60));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(RequestError::SessionEstablishTimeout)
        ));
        assert_eq!(a.service.active_request_count(), 0);
    }

    #[test]
    fn test_address_votes_update_record() {
        let mut config = DiscoveryConfig::default();
        config.addr_votes_to_update_enr = 2;
        let mut a = node_with(9160, config);
        let mut b = node(9161);
        let mut c = node(9162);
        let now = Instant::now();

        for peer in [&b, &c] {
            let (tx, _rx) = oneshot::channel();
            a.service
                .ping(Contact::Record(peer.service.local_record().clone()), tx, now);
        }
        // the record advertises a different port than the one packets come from
        a.addr = SocketAddr::from(([127, 0, 0, 1], 9260));
        run(&mut [&mut a, &mut b, &mut c], now);

        assert!(drain(&mut a.events)
            .iter()
            .any(|e| *e == DiscoveryEvent::AddressUpdated(a.addr)));
        assert_eq!(a.service.local_record().udp_socket(), Some(a.addr));
        assert_eq!(a.service.local_record().seq(), 2);
    }

    #[test]
    fn test_stop_drops_callbacks() {
        let mut a = node(9170);
        let b = node(9171);
        let now = Instant::now();
        a.service
            .add_enr(b.service.local_record().clone(), now)
            .unwrap();

        let (tx, mut rx) = oneshot::channel();
        a.service
            .find_node(*b.service.local_id(), Some(tx), now);
        a.service.stop();

        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert_eq!(a.service.lookup_count(), 0);
        assert!(a.service.table().is_empty());
    }
}
