//! Kademlia-style routing table for node discovery.
//!
//! The routing table organizes known records into k-buckets based on the
//! log2 distance between their node id and the local node id. Inside a
//! bucket, disconnected entries always precede connected ones. Disconnected
//! entries keep their insertion order, connected ones are ordered from
//! least to most recently seen.
//!
//! A full bucket can hold one pending connected entry. The caller is told
//! to ping the first (oldest disconnected) entry, which is recorded as the
//! eviction candidate; if that same entry is still not connected when the
//! pending timeout expires, it is evicted in favour of the pending entry.

use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::identity::{compare_distance, log2_distance, NodeId};
use super::record::NodeRecord;
use super::timer::{TimerHandle, TimerQueue};

/// Number of k-buckets (one for each log2 distance 1..=256).
pub const NUM_BUCKETS: usize = 256;

/// Default number of nodes per bucket (Kademlia k parameter).
pub const DEFAULT_BUCKET_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub record: NodeRecord,
    pub status: EntryStatus,
}

impl BucketEntry {
    pub fn node_id(&self) -> &NodeId {
        self.record.node_id()
    }

    pub fn is_connected(&self) -> bool {
        self.status == EntryStatus::Connected
    }
}

/// Outcome of a table mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    /// New entry stored in its bucket.
    Inserted,
    /// Bucket full: stored as the pending entry, `disconnected` should be pinged.
    Pending { disconnected: NodeId },
    /// Existing connected entry refreshed and moved to the back.
    UpdatedAndPromoted,
    /// Existing disconnected entry refreshed in place.
    Updated,
    /// Entry became connected and moved behind the other connected entries.
    StatusUpdatedAndPromoted,
    /// Entry became disconnected and moved back into the disconnected group.
    StatusUpdated,
    /// The bucket's pending entry was updated.
    UpdatedPending,
    /// Nothing changed (record not newer).
    NotModified,
    FailedBucketFull,
    /// The local node is never stored.
    FailedInvalidSelfUpdate,
    FailedKeyNonExistent,
}

/// Signals for the owner of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEvent {
    /// `candidate` must answer before the pending timeout or be replaced.
    PendingEviction {
        candidate: NodeRecord,
        pending: NodeId,
    },
    /// A pending entry entered its bucket.
    AppliedEviction {
        inserted: NodeRecord,
        evicted: Option<NodeRecord>,
    },
}

#[derive(Debug)]
struct PendingEntry {
    entry: BucketEntry,
    // entry that is replaced unless it reconnects in time
    candidate: NodeId,
    timer: TimerHandle,
}

/// A single k-bucket containing nodes at one log2 distance.
#[derive(Debug)]
struct KBucket {
    nodes: Vec<BucketEntry>,
    pending: Option<PendingEntry>,
    capacity: usize,
}

impl KBucket {
    fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            pending: None,
            capacity,
        }
    }

    fn is_full(&self) -> bool {
        self.nodes.len() >= self.capacity
    }

    fn position(&self, node_id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|e| e.node_id() == node_id)
    }

    fn first_connected(&self) -> usize {
        self.nodes
            .iter()
            .position(BucketEntry::is_connected)
            .unwrap_or(self.nodes.len())
    }

    /// Append at the back of the entry's status group.
    fn place(&mut self, entry: BucketEntry) {
        match entry.status {
            EntryStatus::Connected => self.nodes.push(entry),
            EntryStatus::Disconnected => {
                let index = self.first_connected();
                self.nodes.insert(index, entry);
            }
        }
    }

    fn is_pending(&self, node_id: &NodeId) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.entry.node_id() == node_id)
    }
}

/// Kademlia-style routing table for node discovery.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<KBucket>,
    bucket_size: usize,
    pending_timeout: Duration,
    // bucket index per pending entry
    timers: TimerQueue<usize>,
    events: mpsc::UnboundedSender<TableEvent>,
}

impl RoutingTable {
    pub fn new(
        local_id: NodeId,
        bucket_size: usize,
        pending_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TableEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let buckets = (0..NUM_BUCKETS).map(|_| KBucket::new(bucket_size)).collect();

        let table = Self {
            local_id,
            buckets,
            bucket_size,
            pending_timeout,
            timers: TimerQueue::new(),
            events,
        };
        (table, receiver)
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        log2_distance(&self.local_id, node_id).map(|d| d as usize - 1)
    }

    fn emit(&self, event: TableEvent) {
        // receiver dropped means the owner is shutting down
        let _ = self.events.send(event);
    }

    /// Insert a new record or update the existing entry.
    pub fn insert_or_update(
        &mut self,
        record: NodeRecord,
        status: EntryStatus,
        now: Instant,
    ) -> InsertResult {
        let Some(index) = self.bucket_index(record.node_id()) else {
            return InsertResult::FailedInvalidSelfUpdate;
        };

        let node_id = *record.node_id();
        let bucket = &self.buckets[index];
        if bucket.position(&node_id).is_some() || bucket.is_pending(&node_id) {
            return self.modify(&node_id, Some(record), status);
        }

        let bucket = &mut self.buckets[index];
        if !bucket.is_full() {
            bucket.place(BucketEntry { record, status });
            return InsertResult::Inserted;
        }

        if status == EntryStatus::Disconnected || bucket.pending.is_some() {
            return InsertResult::FailedBucketFull;
        }

        let candidate = match bucket.nodes.first() {
            Some(first) if !first.is_connected() => first.record.clone(),
            _ => return InsertResult::FailedBucketFull,
        };

        let disconnected = *candidate.node_id();
        let timer = self.timers.insert(now + self.pending_timeout, index);
        self.buckets[index].pending = Some(PendingEntry {
            entry: BucketEntry { record, status },
            candidate: disconnected,
            timer,
        });

        self.emit(TableEvent::PendingEviction {
            candidate,
            pending: node_id,
        });
        InsertResult::Pending { disconnected }
    }

    /// Update the record and status of an existing entry.
    pub fn update(&mut self, record: NodeRecord, status: EntryStatus) -> InsertResult {
        let node_id = *record.node_id();
        self.modify(&node_id, Some(record), status)
    }

    /// Change the status of an existing entry, keeping its record.
    pub fn update_status(&mut self, node_id: &NodeId, status: EntryStatus) -> InsertResult {
        self.modify(node_id, None, status)
    }

    fn modify(
        &mut self,
        node_id: &NodeId,
        record: Option<NodeRecord>,
        status: EntryStatus,
    ) -> InsertResult {
        let Some(index) = self.bucket_index(node_id) else {
            return InsertResult::FailedInvalidSelfUpdate;
        };
        let bucket = &mut self.buckets[index];

        if let Some(pending) = bucket
            .pending
            .as_mut()
            .filter(|p| p.entry.node_id() == node_id)
        {
            if let Some(record) = record.filter(|r| r.seq() >= pending.entry.record.seq()) {
                pending.entry.record = record;
            }
            pending.entry.status = status;
            return InsertResult::UpdatedPending;
        }

        let Some(position) = bucket.position(node_id) else {
            return InsertResult::FailedKeyNonExistent;
        };

        let previous = bucket.nodes[position].status;
        if previous == EntryStatus::Disconnected && status == EntryStatus::Disconnected {
            let entry = &mut bucket.nodes[position];
            if let Some(record) = record.filter(|r| r.seq() >= entry.record.seq()) {
                entry.record = record;
            }
            return InsertResult::Updated;
        }

        let mut entry = bucket.nodes.remove(position);
        if let Some(record) = record.filter(|r| r.seq() >= entry.record.seq()) {
            entry.record = record;
        }
        entry.status = status;
        bucket.place(entry);

        match (previous, status) {
            (EntryStatus::Disconnected, EntryStatus::Connected) => {
                InsertResult::StatusUpdatedAndPromoted
            }
            (EntryStatus::Connected, EntryStatus::Disconnected) => InsertResult::StatusUpdated,
            (EntryStatus::Connected, EntryStatus::Connected) => InsertResult::UpdatedAndPromoted,
            (EntryStatus::Disconnected, EntryStatus::Disconnected) => InsertResult::Updated,
        }
    }

    /// Replace the stored record if `record` is newer, keeping position and status.
    pub fn update_record(&mut self, record: NodeRecord) -> InsertResult {
        let Some(index) = self.bucket_index(record.node_id()) else {
            return InsertResult::FailedInvalidSelfUpdate;
        };
        let bucket = &mut self.buckets[index];

        if let Some(pending) = bucket
            .pending
            .as_mut()
            .filter(|p| p.entry.node_id() == record.node_id())
        {
            if record.seq() <= pending.entry.record.seq() {
                return InsertResult::NotModified;
            }
            pending.entry.record = record;
            return InsertResult::UpdatedPending;
        }

        match bucket.nodes.iter_mut().find(|e| e.node_id() == record.node_id()) {
            Some(entry) if record.seq() > entry.record.seq() => {
                entry.record = record;
                InsertResult::Updated
            }
            Some(_) => InsertResult::NotModified,
            None => InsertResult::FailedKeyNonExistent,
        }
    }

    /// Resolve pending entries whose timeout has expired.
    ///
    /// The eviction candidate is re-read at this point: if it became
    /// connected in the meantime the pending entry is dropped.
    pub fn apply_pending(&mut self, now: Instant) {
        while let Some((_, index)) = self.timers.pop_expired(now) {
            let bucket = &mut self.buckets[index];
            let Some(pending) = bucket.pending.take() else {
                continue;
            };

            let evicted = match bucket.position(&pending.candidate) {
                Some(position) if !bucket.nodes[position].is_connected() => {
                    Some(bucket.nodes.remove(position).record)
                }
                None if !bucket.is_full() => None,
                _ => {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!(
                            "Dropping pending entry {}: candidate {} in bucket {} is still connected",
                            pending.entry.node_id(),
                            pending.candidate,
                            index + 1
                        );
                    }
                    continue;
                }
            };
            let inserted = pending.entry.record.clone();
            bucket.place(pending.entry);

            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "Applied pending entry {} in bucket {}, evicted {:?}",
                    inserted.node_id(),
                    index + 1,
                    evicted.as_ref().map(|r| *r.node_id())
                );
            }
            self.emit(TableEvent::AppliedEviction { inserted, evicted });
        }
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&BucketEntry> {
        let index = self.bucket_index(node_id)?;
        self.buckets[index]
            .nodes
            .iter()
            .find(|e| e.node_id() == node_id)
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.get(node_id).is_some()
    }

    /// Entries of the bucket at `distance` (1..=256), in bucket order.
    pub fn values(&self, distance: u64) -> &[BucketEntry] {
        match distance {
            1..=256 => self.buckets[distance as usize - 1].nodes.as_slice(),
            _ => &[],
        }
    }

    /// Get the closest nodes to a target.
    ///
    /// Returns up to `count` records sorted by XOR distance to the target.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<NodeRecord> {
        let mut candidates: Vec<&BucketEntry> = self.iter().collect();
        candidates.sort_by(|a, b| compare_distance(target, a.node_id(), b.node_id()));
        candidates
            .into_iter()
            .take(count)
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BucketEntry> {
        self.buckets.iter().flat_map(|b| b.nodes.iter())
    }

    pub fn entries(&self) -> Vec<BucketEntry> {
        self.iter().cloned().collect()
    }

    pub fn connected(&self) -> Vec<NodeRecord> {
        self.iter()
            .filter(|e| e.is_connected())
            .map(|e| e.record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.nodes.is_empty())
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.nodes.clear();
            bucket.pending = None;
        }
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::super::crypto::Secp256k1Backend;
    use super::super::identity::NodeIdentity;
    use super::*;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn create_record() -> NodeRecord {
        let identity = NodeIdentity::generate(Arc::new(Secp256k1Backend::new())).unwrap();
        NodeRecord::new(&identity, 1, Some("127.0.0.1:9000".parse().unwrap())).unwrap()
    }

    /// Records that all land in the bucket at distance 256 from `local_id`.
    fn far_records(local_id: &NodeId, count: usize) -> Vec<NodeRecord> {
        let mut records = Vec::with_capacity(count);
        while records.len() < count {
            let record = create_record();
            if log2_distance(local_id, record.node_id()) == Some(256) {
                records.push(record);
            }
        }
        records
    }

    fn table(bucket_size: usize) -> (RoutingTable, mpsc::UnboundedReceiver<TableEvent>) {
        RoutingTable::new(NodeId::new([0u8; 32]), bucket_size, TIMEOUT)
    }

    fn ids(entries: &[BucketEntry]) -> Vec<NodeId> {
        entries.iter().map(|e| *e.node_id()).collect()
    }

    #[test]
    fn test_insert_and_update() {
        let (mut table, _events) = table(DEFAULT_BUCKET_SIZE);
        let now = Instant::now();
        let record = create_record();

        assert_eq!(
            table.insert_or_update(record.clone(), EntryStatus::Disconnected, now),
            InsertResult::Inserted
        );
        assert_eq!(table.len(), 1);
        assert!(table.contains(record.node_id()));

        assert_eq!(
            table.insert_or_update(record.clone(), EntryStatus::Disconnected, now),
            InsertResult::Updated
        );
        assert_eq!(
            table.update_status(record.node_id(), EntryStatus::Connected),
            InsertResult::StatusUpdatedAndPromoted
        );
        assert_eq!(
            table.insert_or_update(record.clone(), EntryStatus::Connected, now),
            InsertResult::UpdatedAndPromoted
        );
        assert_eq!(
            table.update_status(record.node_id(), EntryStatus::Disconnected),
            InsertResult::StatusUpdated
        );
        assert_eq!(table.update_record(record), InsertResult::NotModified);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_self_and_unknown_rejected() {
        let identity = NodeIdentity::generate(Arc::new(Secp256k1Backend::new())).unwrap();
        let record = NodeRecord::new(&identity, 1, None).unwrap();
        let (mut table, _events) = RoutingTable::new(*identity.node_id(), 16, TIMEOUT);

        assert_eq!(
            table.insert_or_update(record, EntryStatus::Connected, Instant::now()),
            InsertResult::FailedInvalidSelfUpdate
        );
        assert!(table.is_empty());
        assert_eq!(
            table.update_status(create_record().node_id(), EntryStatus::Connected),
            InsertResult::FailedKeyNonExistent
        );
    }

    #[test]
    fn test_disconnected_precede_connected() {
        let (mut table, _events) = table(4);
        let now = Instant::now();
        let records = far_records(table.local_id(), 4);

        table.insert_or_update(records[0].clone(), EntryStatus::Connected, now);
        table.insert_or_update(records[1].clone(), EntryStatus::Disconnected, now);
        table.insert_or_update(records[2].clone(), EntryStatus::Connected, now);
        table.insert_or_update(records[3].clone(), EntryStatus::Disconnected, now);

        let expected: Vec<NodeId> = [1, 3, 0, 2].iter().map(|&i| *records[i].node_id()).collect();
        assert_eq!(ids(table.values(256)), expected);

        // promoting the first disconnected entry moves it behind the connected ones
        table.update_status(records[1].node_id(), EntryStatus::Connected);
        let expected: Vec<NodeId> = [3, 0, 2, 1].iter().map(|&i| *records[i].node_id()).collect();
        assert_eq!(ids(table.values(256)), expected);
    }

    #[test]
    fn test_bucket_full_and_pending_eviction() {
        let (mut table, mut events) = table(2);
        let now = Instant::now();
        let records = far_records(table.local_id(), 4);

        table.insert_or_update(records[0].clone(), EntryStatus::Disconnected, now);
        table.insert_or_update(records[1].clone(), EntryStatus::Connected, now);

        assert_eq!(
            table.insert_or_update(records[2].clone(), EntryStatus::Connected, now),
            InsertResult::Pending {
                disconnected: *records[0].node_id()
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            TableEvent::PendingEviction {
                candidate: records[0].clone(),
                pending: *records[2].node_id(),
            }
        );

        // only one pending slot
        assert_eq!(
            table.insert_or_update(records[3].clone(), EntryStatus::Connected, now),
            InsertResult::FailedBucketFull
        );

        // nothing happens before the timeout
        table.apply_pending(now + TIMEOUT / 2);
        assert!(events.try_recv().is_err());

        table.apply_pending(now + TIMEOUT);
        assert_eq!(
            events.try_recv().unwrap(),
            TableEvent::AppliedEviction {
                inserted: records[2].clone(),
                evicted: Some(records[0].clone()),
            }
        );
        assert_eq!(
            ids(table.values(256)),
            vec![*records[1].node_id(), *records[2].node_id()]
        );

        // every entry is connected now, the bucket is full for good
        assert_eq!(
            table.insert_or_update(records[3].clone(), EntryStatus::Connected, now),
            InsertResult::FailedBucketFull
        );
    }

    #[test]
    fn test_pending_dropped_when_head_reconnects() {
        let (mut table, mut events) = table(1);
        let now = Instant::now();
        let records = far_records(table.local_id(), 2);

        table.insert_or_update(records[0].clone(), EntryStatus::Disconnected, now);
        table.insert_or_update(records[1].clone(), EntryStatus::Connected, now);
        let _ = events.try_recv();

        // the ping answered before the timer fired
        table.update_status(records[0].node_id(), EntryStatus::Connected);
        table.apply_pending(now + TIMEOUT);

        assert!(events.try_recv().is_err());
        assert_eq!(ids(table.values(256)), vec![*records[0].node_id()]);
        assert!(table.next_deadline().is_none());
    }

    #[test]
    fn test_failed_ping_evicts_the_recorded_candidate() {
        let (mut table, mut events) = table(3);
        let now = Instant::now();
        let records = far_records(table.local_id(), 4);
        let (d0, d1, c, pending) = (&records[0], &records[1], &records[2], &records[3]);

        table.insert_or_update(d0.clone(), EntryStatus::Disconnected, now);
        table.insert_or_update(d1.clone(), EntryStatus::Disconnected, now);
        table.insert_or_update(c.clone(), EntryStatus::Connected, now);
        assert_eq!(
            table.insert_or_update(pending.clone(), EntryStatus::Connected, now),
            InsertResult::Pending {
                disconnected: *d0.node_id()
            }
        );
        let _ = events.try_recv();

        // the ping to d0 failed
        assert_eq!(
            table.update_status(d0.node_id(), EntryStatus::Disconnected),
            InsertResult::Updated
        );
        assert_eq!(
            ids(table.values(256)),
            vec![*d0.node_id(), *d1.node_id(), *c.node_id()]
        );

        table.apply_pending(now + TIMEOUT);
        assert_eq!(
            events.try_recv().unwrap(),
            TableEvent::AppliedEviction {
                inserted: pending.clone(),
                evicted: Some(d0.clone()),
            }
        );
        assert_eq!(
            ids(table.values(256)),
            vec![*d1.node_id(), *c.node_id(), *pending.node_id()]
        );
    }

    #[test]
    fn test_pending_dropped_when_candidate_reconnects_behind_head() {
        let (mut table, mut events) = table(2);
        let now = Instant::now();
        let records = far_records(table.local_id(), 3);

        table.insert_or_update(records[0].clone(), EntryStatus::Disconnected, now);
        table.insert_or_update(records[1].clone(), EntryStatus::Disconnected, now);
        table.insert_or_update(records[2].clone(), EntryStatus::Connected, now);
        let _ = events.try_recv();

        // the candidate answered and moved behind the other entry
        table.update_status(records[0].node_id(), EntryStatus::Connected);
        assert_eq!(
            ids(table.values(256)),
            vec![*records[1].node_id(), *records[0].node_id()]
        );

        // records[1] is now the head but was never pinged, so nothing is evicted
        table.apply_pending(now + TIMEOUT);
        assert!(events.try_recv().is_err());
        assert!(!table.contains(records[2].node_id()));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_closest_nodes() {
        let (mut table, _events) = table(DEFAULT_BUCKET_SIZE);
        let now = Instant::now();
        for _ in 0..10 {
            table.insert_or_update(create_record(), EntryStatus::Connected, now);
        }

        let target = NodeId::new([0xFFu8; 32]);
        let closest = table.closest(&target, 5);
        assert_eq!(closest.len(), 5);

        for window in closest.windows(2) {
            assert_ne!(
                compare_distance(&target, window[0].node_id(), window[1].node_id()),
                std::cmp::Ordering::Greater
            );
        }
    }
}
