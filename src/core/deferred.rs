//! Time-bucketed deferred-event index.
//!
//! Maps a trigger time (coarse milliseconds) to the set of ids due at that
//! time, without scanning all pending entries on every tick. Timers register
//! wait deadlines here; the UDP service registers channels that asked to be
//! serviced at a future tick.
//!
//! Invariants:
//! - an id appears in at most one bucket at a time; re-adding moves it
//! - entries are single-shot: draining and removal are the only exits
//! - `drain(now)` returns exactly the set of ids with time <= now
//!
//! Payload handles are held by the caller keyed by id (the index stores ids
//! only), so one implementation serves both timers and channel scheduling.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use crate::core::keyed_queue::KeyedQueue;

pub struct DeferredIndex<K> {
    /// time -> ids due at that time, in registration order.
    buckets: BTreeMap<u64, KeyedQueue<K, ()>>,
    /// id -> the bucket it currently sits in. Makes `remove` a direct hit.
    slots: HashMap<K, u64>,
}

impl<K> Default for DeferredIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> DeferredIndex<K> {
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
            slots: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K: Eq + Hash + Copy> DeferredIndex<K> {
    pub fn contains(&self, id: &K) -> bool {
        self.slots.contains_key(id)
    }

    /// Earliest pending trigger time, if any.
    pub fn next_time(&self) -> Option<u64> {
        self.buckets.keys().next().copied()
    }

    /// Register `id` to trigger at or after `time`. An id already pending
    /// elsewhere is moved to the new bucket.
    pub fn add(&mut self, time: u64, id: K) {
        if let Some(prev) = self.slots.insert(id, time) {
            if prev != time {
                self.remove_from_bucket(prev, &id);
            }
        }
        self.buckets.entry(time).or_default().push(id, ());
    }

    /// Cancel before expiry. Returns false if the id was not pending.
    pub fn remove(&mut self, id: &K) -> bool {
        let Some(time) = self.slots.remove(id) else {
            return false;
        };
        self.remove_from_bucket(time, id);
        true
    }

    /// Collect and remove every id whose trigger time is <= `now`, earliest
    /// bucket first. Later buckets are left intact for a later drain.
    pub fn drain(&mut self, now: u64) -> Vec<K> {
        let mut due = Vec::new();
        while let Some(time) = self.next_time() {
            if time > now {
                break;
            }
            if let Some(mut bucket) = self.buckets.remove(&time) {
                for (id, ()) in bucket.drain() {
                    self.slots.remove(&id);
                    due.push(id);
                }
            }
        }
        due
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.slots.clear();
    }

    fn remove_from_bucket(&mut self, time: u64, id: &K) {
        if let Some(bucket) = self.buckets.get_mut(&time) {
            bucket.remove(id);
            if bucket.is_empty() {
                self.buckets.remove(&time);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_returns_exactly_the_due_set() {
        let mut index = DeferredIndex::new();
        index.add(10, 1u32);
        index.add(20, 2);
        index.add(20, 3);
        index.add(30, 4);

        let mut due = index.drain(20);
        due.sort_unstable();
        assert_eq!(due, vec![1, 2, 3]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.next_time(), Some(30));

        assert_eq!(index.drain(29), Vec::<u32>::new());
        assert_eq!(index.drain(30), vec![4]);
        assert!(index.is_empty());
    }

    #[test]
    fn test_removed_id_never_fires() {
        let mut index = DeferredIndex::new();
        index.add(10, 1u32);
        index.add(10, 2);
        assert!(index.remove(&1));
        assert!(!index.remove(&1));
        assert_eq!(index.drain(100), vec![2]);
        assert_eq!(index.drain(1000), Vec::<u32>::new());
    }

    #[test]
    fn test_re_add_moves_the_id() {
        let mut index = DeferredIndex::new();
        index.add(10, 1u32);
        index.add(50, 1);
        assert_eq!(index.len(), 1);
        assert_eq!(index.drain(10), Vec::<u32>::new());
        assert_eq!(index.drain(50), vec![1]);
    }

    #[test]
    fn test_re_add_same_time_is_stable() {
        let mut index = DeferredIndex::new();
        index.add(10, 1u32);
        index.add(10, 1);
        assert_eq!(index.len(), 1);
        assert_eq!(index.drain(10), vec![1]);
    }

    #[test]
    fn test_empty_bucket_is_dropped() {
        let mut index = DeferredIndex::new();
        index.add(10, 1u32);
        index.remove(&1);
        assert_eq!(index.next_time(), None);
        assert!(index.is_empty());
    }
}
