//! Per-topic, per-partition map of the last successfully processed Kafka offset.
//!
//! The tracker is seeded with the *last processed* offset, not the *next to fetch* one: callers
//! must pass `committed_offset - 1` at construction so that `record_offset`'s strict
//! less-than rejection still accepts the first genuinely new message.

use crate::error::OffsetError;
use std::collections::HashMap;
use std::sync::RwLock;

/// Sentinel passed through unchanged by `record_offset`: "oldest offset currently retained".
pub const OLDEST_AVAILABLE: i64 = -2;
/// Sentinel passed through unchanged by `record_offset`: "newest offset currently available".
pub const NEWEST_AVAILABLE: i64 = -1;

#[derive(Debug, Default)]
pub struct OffsetTracker {
    offsets: RwLock<HashMap<String, HashMap<i32, i64>>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `(topic, partition)` once. A second registration of the same pair is an error.
    pub fn track_partition(&self, topic: &str, partition: i32) -> Result<(), OffsetError> {
        let mut guard = self.offsets.write().expect("offset tracker lock poisoned");
        let partitions = guard.entry(topic.to_string()).or_default();
        if partitions.contains_key(&partition) {
            return Err(OffsetError::AlreadyTracked {
                topic: topic.to_string(),
                partition,
            });
        }
        // Absence of a recorded offset is distinguished from "zero offset recorded" by simply
        // not inserting until the first `record_offset` call; tracking alone does not seed a
        // value here; seeding happens via the first `record_offset`.
        partitions.insert(partition, i64::MIN);
        Ok(())
    }

    /// Records `offset` as the last-processed offset for `(topic, partition)`.
    ///
    /// Rejects an offset strictly less than the cached one. Sentinel values
    /// ([`OLDEST_AVAILABLE`] / [`NEWEST_AVAILABLE`]) are tolerated but treated as a non-advance:
    /// the cached value is left untouched.
    pub fn record_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<(), OffsetError> {
        if offset == OLDEST_AVAILABLE {
            tracing::warn!(topic, partition, "ignoring oldest-available sentinel offset");
            return Ok(());
        }

        let mut guard = self.offsets.write().expect("offset tracker lock poisoned");
        let partitions = guard.entry(topic.to_string()).or_default();
        let cached = partitions.entry(partition).or_insert(i64::MIN);

        if offset != NEWEST_AVAILABLE && *cached != i64::MIN && offset < *cached {
            return Err(OffsetError::NegativeLag {
                topic: topic.to_string(),
                partition,
                observed: offset,
                cached: *cached,
            });
        }

        if offset != NEWEST_AVAILABLE {
            *cached = offset;
        }
        Ok(())
    }

    /// Seeds the last-processed offset for `(topic, partition)` at construction time, bypassing
    /// the sentinel interpretation `record_offset` applies. Used only during `Consumer::new` so
    /// that a freshly committed offset of `0` (seeded as `-1`) is not mistaken for the
    /// [`NEWEST_AVAILABLE`] sentinel.
    pub fn seed_offset(&self, topic: &str, partition: i32, offset: i64) {
        let mut guard = self.offsets.write().expect("offset tracker lock poisoned");
        let partitions = guard.entry(topic.to_string()).or_default();
        partitions.insert(partition, offset);
    }

    pub fn get_offset(&self, topic: &str, partition: i32) -> Result<i64, OffsetError> {
        let guard = self.offsets.read().expect("offset tracker lock poisoned");
        guard
            .get(topic)
            .and_then(|partitions| partitions.get(&partition))
            .copied()
            .filter(|offset| *offset != i64::MIN)
            .ok_or_else(|| OffsetError::NotTracked {
                topic: topic.to_string(),
                partition,
            })
    }

    /// Topics with at least one partition that has a recorded (non-sentinel) offset.
    pub fn topics(&self) -> Vec<String> {
        let guard = self.offsets.read().expect("offset tracker lock poisoned");
        guard
            .iter()
            .filter(|(_, partitions)| partitions.values().any(|offset| *offset != i64::MIN))
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Partitions of `topic` that have a recorded (non-sentinel) offset.
    pub fn partitions_for_topic(&self, topic: &str) -> Vec<i32> {
        let guard = self.offsets.read().expect("offset tracker lock poisoned");
        guard
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .filter(|(_, offset)| **offset != i64::MIN)
                    .map(|(partition, _)| *partition)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_partition_rejects_duplicate_registration() {
        let tracker = OffsetTracker::new();
        tracker.track_partition("t", 0).unwrap();
        assert!(tracker.track_partition("t", 0).is_err());
    }

    #[test]
    fn record_offset_advances_monotonically() {
        let tracker = OffsetTracker::new();
        tracker.track_partition("t", 0).unwrap();
        tracker.record_offset("t", 0, 10).unwrap();
        tracker.record_offset("t", 0, 12).unwrap();
        assert_eq!(tracker.get_offset("t", 0).unwrap(), 12);
    }

    #[test]
    fn record_offset_rejects_negative_lag() {
        let tracker = OffsetTracker::new();
        tracker.track_partition("t", 0).unwrap();
        tracker.record_offset("t", 0, 10).unwrap();
        let err = tracker.record_offset("t", 0, 5).unwrap_err();
        assert!(matches!(err, OffsetError::NegativeLag { .. }));
        assert_eq!(tracker.get_offset("t", 0).unwrap(), 10);
    }

    #[test]
    fn oldest_available_sentinel_is_a_non_advance() {
        let tracker = OffsetTracker::new();
        tracker.track_partition("t", 0).unwrap();
        tracker.record_offset("t", 0, 10).unwrap();
        tracker.record_offset("t", 0, OLDEST_AVAILABLE).unwrap();
        assert_eq!(tracker.get_offset("t", 0).unwrap(), 10);
    }

    #[test]
    fn topics_and_partitions_skip_unrecorded_entries() {
        let tracker = OffsetTracker::new();
        tracker.track_partition("t", 0).unwrap();
        tracker.track_partition("t", 1).unwrap();
        tracker.record_offset("t", 0, 5).unwrap();
        assert_eq!(tracker.topics(), vec!["t".to_string()]);
        assert_eq!(tracker.partitions_for_topic("t"), vec![0]);
    }

    #[test]
    fn seed_with_last_processed_accepts_first_new_message() {
        // Resolution of the seed-semantics open question: seeding with `committed - 1` means
        // the strict less-than check in record_offset still accepts `committed`.
        let tracker = OffsetTracker::new();
        tracker.track_partition("t", 0).unwrap();
        let committed_next_offset = 42;
        tracker.seed_offset("t", 0, committed_next_offset - 1);
        tracker.record_offset("t", 0, committed_next_offset).unwrap();
        assert_eq!(tracker.get_offset("t", 0).unwrap(), committed_next_offset);
    }

    #[test]
    fn seed_offset_of_zero_does_not_collide_with_sentinel() {
        let tracker = OffsetTracker::new();
        tracker.track_partition("t", 0).unwrap();
        // A brand new partition committed at offset 0 seeds as -1, which numerically matches
        // NEWEST_AVAILABLE; seed_offset must still record it so get_offset succeeds.
        tracker.seed_offset("t", 0, -1);
        assert_eq!(tracker.get_offset("t", 0).unwrap(), -1);
        tracker.record_offset("t", 0, 0).unwrap();
        assert_eq!(tracker.get_offset("t", 0).unwrap(), 0);
    }
}
