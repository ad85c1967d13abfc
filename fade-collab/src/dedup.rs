//! Bounded memory of processed message ids.
//!
//! An id counts as seen if it was first recorded less than `window` ago.
//! When more than `capacity` ids are held, the oldest half is dropped at
//! once, so duplicate suppression is approximate for ids older than the
//! surviving half.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::clock::millis;

pub struct MessageDeduplicator {
    /// id → first-seen timestamp
    entries: HashMap<String, u64>,
    /// Insertion order. May hold stale pairs for ids re-recorded after expiry.
    order: VecDeque<(String, u64)>,
    window_ms: u64,
    capacity: usize,
}

impl MessageDeduplicator {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            window_ms: millis(window),
            capacity,
        }
    }

    /// Returns `true` if `id` was already recorded within the window;
    /// otherwise records it and returns `false`.
    pub fn check_and_record(&mut self, id: &str, now_ms: u64) -> bool {
        if let Some(&first_seen) = self.entries.get(id) {
            if now_ms.saturating_sub(first_seen) < self.window_ms {
                return true;
            }
        }

        self.entries.insert(id.to_owned(), now_ms);
        self.order.push_back((id.to_owned(), now_ms));

        if self.entries.len() > self.capacity {
            self.evict_oldest_half();
        }
        false
    }

    fn evict_oldest_half(&mut self) {
        let target = self.entries.len() / 2;
        let mut evicted = 0;
        while evicted < target {
            let Some((id, recorded_at)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&id) == Some(&recorded_at) {
                self.entries.remove(&id);
                evicted += 1;
            }
        }
        log::warn!(
            "Dedup memory over capacity ({}), evicted {} oldest ids",
            self.capacity,
            evicted
        );
    }

    /// Forget ids whose window has passed.
    pub fn prune_expired(&mut self, now_ms: u64) -> usize {
        let mut pruned = 0;
        while let Some((_, recorded_at)) = self.order.front() {
            if now_ms.saturating_sub(*recorded_at) < self.window_ms {
                break;
            }
            if let Some((id, recorded_at)) = self.order.pop_front() {
                if self.entries.get(&id) == Some(&recorded_at) {
                    self.entries.remove(&id);
                    pruned += 1;
                }
            }
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup() -> MessageDeduplicator {
        MessageDeduplicator::new(Duration::from_secs(60), 1000)
    }

    #[test]
    fn test_second_sighting_is_duplicate() {
        let mut d = dedup();
        assert!(!d.check_and_record("m1", 0));
        assert!(d.check_and_record("m1", 10));
        assert!(!d.check_and_record("m2", 10));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_window_expiry() {
        let mut d = dedup();
        assert!(!d.check_and_record("m1", 0));
        assert!(d.check_and_record("m1", 59_999));
        assert!(!d.check_and_record("m1", 60_000));
    }

    #[test]
    fn test_overflow_evicts_oldest_half() {
        let mut d = dedup();
        for i in 0..1001 {
            assert!(!d.check_and_record(&format!("m{i}"), i));
        }
        assert_eq!(d.len(), 501);
        assert!(d.check_and_record("m1000", 2000));
        assert!(d.check_and_record("m500", 2000));
        assert!(!d.check_and_record("m0", 2000));
    }

    #[test]
    fn test_prune_expired() {
        let mut d = dedup();
        d.check_and_record("old", 0);
        d.check_and_record("new", 50_000);
        assert_eq!(d.prune_expired(70_000), 1);
        assert_eq!(d.len(), 1);
        assert!(d.check_and_record("new", 70_000));
    }

    #[test]
    fn test_clear() {
        let mut d = dedup();
        d.check_and_record("a", 0);
        d.clear();
        assert!(d.is_empty());
        assert!(!d.check_and_record("a", 1));
    }
}
