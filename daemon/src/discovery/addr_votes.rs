//! External address detection from PONG votes.

use std::collections::HashMap;
use std::net::SocketAddr;

use indexmap::IndexMap;
use tokio::time::Instant;

use super::identity::NodeId;

pub const MAX_VOTES: usize = 200;

/// One vote per peer; the latest vote of a peer replaces its previous one.
#[derive(Debug)]
pub struct AddrVotes {
    threshold: usize,
    votes: IndexMap<NodeId, (SocketAddr, Instant)>,
    tallies: HashMap<SocketAddr, usize>,
}

impl AddrVotes {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            votes: IndexMap::new(),
            tallies: HashMap::new(),
        }
    }

    /// Record a vote. Returns true once `addr` reaches the threshold, in
    /// which case all votes are discarded.
    pub fn add_vote(&mut self, voter: NodeId, addr: SocketAddr, now: Instant) -> bool {
        if let Some((previous, _)) = self.votes.shift_remove(&voter) {
            self.decrement(previous);
        } else if self.votes.len() >= MAX_VOTES {
            let oldest = self
                .votes
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(id, _)| *id);
            if let Some((old_addr, _)) = oldest.and_then(|id| self.votes.shift_remove(&id)) {
                self.decrement(old_addr);
            }
        }

        self.votes.insert(voter, (addr, now));
        let tally = self.tallies.entry(addr).or_insert(0);
        *tally += 1;

        if *tally >= self.threshold {
            self.clear();
            return true;
        }
        false
    }

    fn decrement(&mut self, addr: SocketAddr) {
        if let Some(tally) = self.tallies.get_mut(&addr) {
            *tally -= 1;
            if *tally == 0 {
                self.tallies.remove(&addr);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn clear(&mut self) {
        self.votes.clear();
        self.tallies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_reached() {
        let mut votes = AddrVotes::new(3);
        let addr: SocketAddr = "1.2.3.4:9000".parse().unwrap();
        let now = Instant::now();

        assert!(!votes.add_vote(NodeId::random(), addr, now));
        assert!(!votes.add_vote(NodeId::random(), addr, now));
        assert!(votes.add_vote(NodeId::random(), addr, now));
        assert!(votes.is_empty());
    }

    #[test]
    fn test_revote_replaces() {
        let mut votes = AddrVotes::new(2);
        let first: SocketAddr = "1.2.3.4:9000".parse().unwrap();
        let second: SocketAddr = "5.6.7.8:9000".parse().unwrap();
        let voter = NodeId::random();
        let now = Instant::now();

        assert!(!votes.add_vote(voter, first, now));
        // same voter twice does not count twice
        assert!(!votes.add_vote(voter, first, now));
        assert!(!votes.add_vote(voter, second, now));
        assert_eq!(votes.len(), 1);
        assert!(votes.add_vote(NodeId::random(), second, now));
    }

    #[test]
    fn test_oldest_vote_evicted() {
        let mut votes = AddrVotes::new(MAX_VOTES + 10);
        let now = Instant::now();
        for i in 0..MAX_VOTES + 5 {
            let addr = SocketAddr::from(([10, 0, (i / 256) as u8, (i % 256) as u8], 9000));
            votes.add_vote(NodeId::random(), addr, now + std::time::Duration::from_millis(i as u64));
        }
        assert_eq!(votes.len(), MAX_VOTES);
    }
}
