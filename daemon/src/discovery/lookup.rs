//! Iterative FINDNODE lookup.
//!
//! A lookup keeps every peer it has heard of ordered by XOR distance to the
//! target. Each step contacts the closest peers not yet asked, up to the
//! allowed number of requests in flight. Records returned by a peer are
//! untrusted: they become candidates, and only peers that answer
//! themselves count towards the result.
//!
//! The lookup does not send anything. The owner calls [`Lookup::next_step`]
//! until it stops yielding peers, performs the requests, and reports each
//! outcome through [`Lookup::on_success`] / [`Lookup::on_failure`].

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use super::identity::{log2_distance, xor_distance, NodeId};
use super::record::NodeRecord;

/// Lookups are numbered sequentially, wrapping around.
pub type LookupId = u32;

#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Requests in flight while making progress.
    pub parallelism: usize,
    /// Peers that must answer for the lookup to finish.
    pub num_results: usize,
    /// Distances asked per FINDNODE.
    pub request_limit: usize,
    /// FINDNODE requests sent to a single peer.
    pub peer_iterations: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupPeerState {
    NotContacted,
    Waiting,
    /// Answered, will be asked for the next window of distances.
    PendingIteration,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    Iterating { no_progress: usize },
    /// No closer peer for `parallelism` answers in a row; in-flight limit is
    /// raised to `num_results`.
    Stalled,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupStep {
    /// Send FINDNODE with `distances` to this peer.
    Contact {
        record: NodeRecord,
        distances: Vec<u64>,
    },
    Waiting,
    Finished,
}

#[derive(Debug)]
struct LookupPeer {
    record: NodeRecord,
    iteration: usize,
    peers_returned: usize,
    state: LookupPeerState,
}

#[derive(Debug)]
pub struct Lookup {
    target: NodeId,
    config: LookupConfig,
    peers: BTreeMap<[u8; 32], LookupPeer>,
    state: LookupState,
    num_waiting: usize,
    deadline: Instant,
}

/// Log2 distances to ask `peer` for on its `iteration`-th request.
///
/// Starts at the target's distance from the peer and alternates around it:
/// `d, d+1, d-1, d+2, d-2, ...` within `1..=256`. Distance 0 (the peer's own
/// record) is only asked for when the peer is the target.
pub fn find_node_distances(
    target: &NodeId,
    peer: &NodeId,
    request_limit: usize,
    iteration: usize,
) -> Vec<u64> {
    let base = log2_distance(target, peer).unwrap_or(0);
    let mut distances = Vec::with_capacity(257);
    distances.push(base);
    for step in 1..=256u64 {
        if base + step <= 256 {
            distances.push(base + step);
        }
        if step < base {
            distances.push(base - step);
        }
    }

    distances
        .into_iter()
        .skip(iteration * request_limit)
        .take(request_limit)
        .collect()
}

impl Lookup {
    pub fn new(
        target: NodeId,
        seeds: Vec<NodeRecord>,
        config: LookupConfig,
        now: Instant,
    ) -> Self {
        let peers = seeds
            .into_iter()
            .map(|record| {
                let key = xor_distance(&target, record.node_id());
                (key, LookupPeer::new(record))
            })
            .collect();

        Self {
            target,
            deadline: now + config.timeout,
            config,
            peers,
            state: LookupState::Iterating { no_progress: 0 },
            num_waiting: 0,
        }
    }

    pub fn target(&self) -> &NodeId {
        &self.target
    }

    pub fn state(&self) -> LookupState {
        self.state
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_finished(&self) -> bool {
        self.state == LookupState::Finished
    }

    pub fn peer_state(&self, node_id: &NodeId) -> Option<LookupPeerState> {
        self.peers
            .get(&xor_distance(&self.target, node_id))
            .map(|p| p.state)
    }

    fn at_capacity(&self) -> bool {
        match self.state {
            LookupState::Iterating { .. } => self.num_waiting >= self.config.parallelism,
            LookupState::Stalled => self.num_waiting >= self.config.num_results,
            LookupState::Finished => true,
        }
    }

    /// Next action. Call repeatedly until it returns something other than
    /// [`LookupStep::Contact`].
    pub fn next_step(&mut self, now: Instant) -> LookupStep {
        if self.state == LookupState::Finished {
            return LookupStep::Finished;
        }
        if now >= self.deadline {
            self.state = LookupState::Finished;
            return LookupStep::Finished;
        }

        let at_capacity = self.at_capacity();
        // counts answered peers from the closest outwards, unknown past a waiting one
        let mut result_counter = Some(0usize);

        for peer in self.peers.values_mut() {
            match peer.state {
                LookupPeerState::Waiting => {
                    if at_capacity {
                        return LookupStep::Waiting;
                    }
                    result_counter = None;
                }
                LookupPeerState::Succeeded => {
                    if let Some(count) = result_counter.as_mut() {
                        *count += 1;
                        if *count >= self.config.num_results {
                            self.state = LookupState::Finished;
                            return LookupStep::Finished;
                        }
                    }
                }
                LookupPeerState::NotContacted | LookupPeerState::PendingIteration => {
                    if at_capacity {
                        return LookupStep::Waiting;
                    }
                    peer.state = LookupPeerState::Waiting;
                    self.num_waiting += 1;
                    let distances = find_node_distances(
                        &self.target,
                        peer.record.node_id(),
                        self.config.request_limit,
                        peer.iteration,
                    );
                    return LookupStep::Contact {
                        record: peer.record.clone(),
                        distances,
                    };
                }
                LookupPeerState::Failed => {}
            }
        }

        if self.num_waiting > 0 {
            LookupStep::Waiting
        } else {
            self.state = LookupState::Finished;
            LookupStep::Finished
        }
    }

    /// A peer answered with `records`.
    pub fn on_success(&mut self, node_id: &NodeId, records: Vec<NodeRecord>) {
        let key = xor_distance(&self.target, node_id);
        let Some(peer) = self.peers.get_mut(&key) else {
            return;
        };
        if peer.state != LookupPeerState::Waiting {
            return;
        }

        self.num_waiting -= 1;
        peer.iteration += 1;
        peer.peers_returned += records.len();
        peer.state = if peer.iteration >= self.config.peer_iterations
            || peer.peers_returned >= self.config.num_results
        {
            LookupPeerState::Succeeded
        } else {
            LookupPeerState::PendingIteration
        };

        let mut progress = false;
        for record in records {
            let key = xor_distance(&self.target, record.node_id());
            if self.peers.contains_key(&key) {
                continue;
            }
            // progress means a new peer among the closest results
            if self.peers.range(..key).count() < self.config.num_results {
                progress = true;
            }
            self.peers.insert(key, LookupPeer::new(record));
        }

        self.state = match self.state {
            LookupState::Iterating { no_progress } => {
                let no_progress = if progress { 0 } else { no_progress + 1 };
                if no_progress >= self.config.parallelism {
                    LookupState::Stalled
                } else {
                    LookupState::Iterating { no_progress }
                }
            }
            LookupState::Stalled if progress => LookupState::Iterating { no_progress: 0 },
            other => other,
        };
    }

    /// A request to the peer failed or timed out. The peer is not asked again.
    pub fn on_failure(&mut self, node_id: &NodeId) {
        let key = xor_distance(&self.target, node_id);
        if let Some(peer) = self.peers.get_mut(&key) {
            if peer.state == LookupPeerState::Waiting {
                self.num_waiting -= 1;
                peer.state = LookupPeerState::Failed;
            }
        }
    }

    /// Closest peers that answered, ordered by distance to the target.
    pub fn result(&self) -> Vec<NodeRecord> {
        self.peers
            .values()
            .filter(|p| {
                matches!(
                    p.state,
                    LookupPeerState::Succeeded | LookupPeerState::PendingIteration
                )
            })
            .take(self.config.num_results)
            .map(|p| p.record.clone())
            .collect()
    }
}

impl LookupPeer {
    fn new(record: NodeRecord) -> Self {
        Self {
            record,
            iteration: 0,
            peers_returned: 0,
            state: LookupPeerState::NotContacted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::crypto::Secp256k1Backend;
    use super::super::identity::{compare_distance, NodeIdentity};
    use super::*;
    use std::sync::Arc;

    fn record() -> NodeRecord {
        let identity = NodeIdentity::generate(Arc::new(Secp256k1Backend::new())).unwrap();
        NodeRecord::new(&identity, 1, Some("127.0.0.1:9000".parse().unwrap())).unwrap()
    }

    fn config() -> LookupConfig {
        LookupConfig {
            parallelism: 3,
            num_results: 4,
            request_limit: 3,
            peer_iterations: 1,
            timeout: Duration::from_secs(60),
        }
    }

    fn contacts(lookup: &mut Lookup, now: Instant) -> Vec<NodeRecord> {
        let mut contacted = Vec::new();
        while let LookupStep::Contact { record, .. } = lookup.next_step(now) {
            contacted.push(record);
        }
        contacted
    }

    #[test]
    fn test_distances_alternate_around_target() {
        let zero = NodeId::new([0u8; 32]);
        let mut bytes = [0u8; 32];
        bytes[31] = 0x10;
        let peer = NodeId::new(bytes);

        assert_eq!(find_node_distances(&zero, &peer, 3, 0), vec![5, 6, 4]);
        assert_eq!(find_node_distances(&zero, &peer, 3, 1), vec![7, 3, 8]);
        // the peer is the target
        assert_eq!(find_node_distances(&peer, &peer, 3, 0), vec![0, 1, 2]);
        // capped at 256
        let mut top = [0u8; 32];
        top[0] = 0x80;
        assert_eq!(find_node_distances(&zero, &NodeId::new(top), 3, 0), vec![256, 255, 254]);
    }

    #[test]
    fn test_distances_never_reach_zero() {
        let zero = NodeId::new([0u8; 32]);
        let mut bytes = [0u8; 32];
        bytes[31] = 0x01;
        let peer = NodeId::new(bytes);

        // every distance from 1 to 256 exactly once, then nothing
        let all: Vec<u64> = (0..86)
            .flat_map(|iteration| find_node_distances(&zero, &peer, 3, iteration))
            .collect();
        assert_eq!(all.len(), 256);
        assert!(!all.contains(&0));
        assert_eq!(all[..3], [1, 2, 3]);
        assert!(find_node_distances(&zero, &peer, 3, 86).is_empty());

        bytes[31] = 0x10;
        let peer = NodeId::new(bytes);
        let all: Vec<u64> = (0..86)
            .flat_map(|iteration| find_node_distances(&zero, &peer, 3, iteration))
            .collect();
        assert_eq!(all.len(), 256);
        assert!(!all.contains(&0));
    }

    #[test]
    fn test_parallelism_bounds_in_flight_requests() {
        let now = Instant::now();
        let seeds: Vec<NodeRecord> = (0..5).map(|_| record()).collect();
        let mut lookup = Lookup::new(NodeId::random(), seeds, config(), now);

        let first = contacts(&mut lookup, now);
        assert_eq!(first.len(), 3);
        assert_eq!(lookup.next_step(now), LookupStep::Waiting);

        lookup.on_failure(first[0].node_id());
        assert_eq!(
            lookup.peer_state(first[0].node_id()),
            Some(LookupPeerState::Failed)
        );
        assert_eq!(contacts(&mut lookup, now).len(), 1);
    }

    #[test]
    fn test_finishes_with_closest_succeeded_peers() {
        let now = Instant::now();
        let target = NodeId::random();
        let seeds: Vec<NodeRecord> = (0..2).map(|_| record()).collect();
        let learned: Vec<NodeRecord> = (0..4).map(|_| record()).collect();
        let mut lookup = Lookup::new(target, seeds.clone(), config(), now);

        for peer in contacts(&mut lookup, now) {
            lookup.on_success(peer.node_id(), learned.clone());
        }
        // every learned peer is contacted and answers with nothing new
        loop {
            let round = contacts(&mut lookup, now);
            if round.is_empty() {
                break;
            }
            for peer in round {
                lookup.on_success(peer.node_id(), Vec::new());
            }
        }

        assert_eq!(lookup.next_step(now), LookupStep::Finished);
        let result = lookup.result();
        assert_eq!(result.len(), 4);
        for window in result.windows(2) {
            assert_eq!(
                compare_distance(&target, window[0].node_id(), window[1].node_id()),
                std::cmp::Ordering::Less
            );
        }
    }

    #[test]
    fn test_stalls_then_raises_capacity() {
        let now = Instant::now();
        let mut config = config();
        config.parallelism = 1;
        config.num_results = 3;
        let seeds: Vec<NodeRecord> = (0..4).map(|_| record()).collect();
        let mut lookup = Lookup::new(NodeId::random(), seeds, config, now);

        let first = contacts(&mut lookup, now);
        assert_eq!(first.len(), 1);
        lookup.on_success(first[0].node_id(), Vec::new());
        assert_eq!(lookup.state(), LookupState::Stalled);

        // stalled: up to num_results in flight
        assert_eq!(contacts(&mut lookup, now).len(), 3);
    }

    #[test]
    fn test_peer_iterations() {
        let now = Instant::now();
        let mut config = config();
        config.peer_iterations = 2;
        let seed = record();
        let mut lookup = Lookup::new(NodeId::random(), vec![seed.clone()], config, now);

        assert!(matches!(lookup.next_step(now), LookupStep::Contact { .. }));
        lookup.on_success(seed.node_id(), Vec::new());
        assert_eq!(
            lookup.peer_state(seed.node_id()),
            Some(LookupPeerState::PendingIteration)
        );

        match lookup.next_step(now) {
            LookupStep::Contact { record, distances } => {
                assert_eq!(record, seed);
                let expected = find_node_distances(lookup.target(), seed.node_id(), 3, 1);
                assert_eq!(distances, expected);
            }
            other => panic!("unexpected step {:?}", other),
        }
        lookup.on_success(seed.node_id(), Vec::new());
        assert_eq!(
            lookup.peer_state(seed.node_id()),
            Some(LookupPeerState::Succeeded)
        );
        assert_eq!(lookup.next_step(now), LookupStep::Finished);
    }

    #[test]
    fn test_timeout_and_empty_lookup() {
        let now = Instant::now();
        let mut empty = Lookup::new(NodeId::random(), Vec::new(), config(), now);
        assert_eq!(empty.next_step(now), LookupStep::Finished);
        assert!(empty.result().is_empty());

        let mut lookup = Lookup::new(NodeId::random(), vec![record()], config(), now);
        assert!(matches!(lookup.next_step(now), LookupStep::Contact { .. }));
        assert_eq!(lookup.next_step(now), LookupStep::Waiting);
        assert_eq!(
            lookup.next_step(now + Duration::from_secs(60)),
            LookupStep::Finished
        );
        assert!(lookup.is_finished());
    }
}
