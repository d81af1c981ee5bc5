//! Segment Key Tracker
//!
//! Partition completion and key deduplication for one scan session. A partition moves one way
//! only, from desired to finished. While it is in progress the tracker remembers the
//! fingerprints of the keys already delivered for it, so a restart on another server can
//! replay them without a duplicate reaching the consumer.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use xxhash_rust::xxh3::xxh3_128;

use crate::dispatch::protocol::EntryStatus;

#[derive(Debug, Default)]
struct TrackerState {
    desired: BTreeSet<u32>,
    finished: BTreeSet<u32>,
    seen: HashMap<u32, HashSet<u128>>,
}

#[derive(Debug, Default)]
pub struct SegmentKeyTracker {
    state: Mutex<TrackerState>,
}

impl SegmentKeyTracker {
    pub fn new(desired: BTreeSet<u32>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                desired,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds partitions discovered from a server. Finished partitions are never re-added.
    pub fn desire(&self, partitions: &BTreeSet<u32>) {
        let mut state = self.lock();
        for &p in partitions {
            if !state.finished.contains(&p) {
                state.desired.insert(p);
            }
        }
    }

    /// Records a delivered key and says whether the consumer should see it.
    ///
    /// Keys of finished or unrequested partitions, keys already delivered for their partition
    /// and removed entries are all suppressed.
    pub fn track(&self, key: &str, status: EntryStatus, partition: u32) -> bool {
        let mut state = self.lock();
        if !state.desired.contains(&partition) {
            return false;
        }
        let first_time = state
            .seen
            .entry(partition)
            .or_default()
            .insert(xxh3_128(key.as_bytes()));
        first_time && status == EntryStatus::Present
    }

    /// Marks partitions complete and frees their seen-key sets.
    ///
    /// Returns the partitions that were newly finished by this call.
    pub fn mark_finished(&self, partitions: &BTreeSet<u32>) -> BTreeSet<u32> {
        let mut state = self.lock();
        let mut newly = BTreeSet::new();
        for &p in partitions {
            if state.desired.remove(&p) {
                state.finished.insert(p);
                state.seen.remove(&p);
                newly.insert(p);
            }
        }
        newly
    }

    /// Partitions not yet confirmed finished.
    pub fn missed_partitions(&self) -> BTreeSet<u32> {
        self.lock().desired.clone()
    }

    pub fn finished_partitions(&self) -> BTreeSet<u32> {
        self.lock().finished.clone()
    }

    pub fn finished_count(&self) -> usize {
        self.lock().finished.len()
    }

    pub fn is_complete(&self) -> bool {
        self.lock().desired.is_empty()
    }

    /// Partitions currently holding a seen-key set.
    pub fn tracked_partitions(&self) -> BTreeSet<u32> {
        self.lock().seen.keys().copied().collect()
    }
}
