//! Thread-safe predicate enforcing the per-run hour ceiling and record cap.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct LimitChecker {
    limit_timestamp: DateTime<Utc>,
    max_records: u64,
    consumed_count: AtomicU64,
}

impl LimitChecker {
    pub fn new(limit_timestamp: DateTime<Utc>, max_records: u64) -> Self {
        Self {
            limit_timestamp,
            max_records,
            consumed_count: AtomicU64::new(0),
        }
    }

    /// True iff the record cap has not been hit and `timestamp` is strictly before the ceiling.
    pub fn check_message(&self, timestamp: DateTime<Utc>) -> bool {
        self.can_consume_more() && timestamp < self.limit_timestamp
    }

    pub fn message_processed(&self) {
        self.consumed_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn can_consume_more(&self) -> bool {
        self.consumed_count.load(Ordering::SeqCst) < self.max_records
    }

    pub fn limit_timestamp(&self) -> DateTime<Utc> {
        self.limit_timestamp
    }

    pub fn consumed_count(&self) -> u64 {
        self.consumed_count.load(Ordering::SeqCst)
    }
}
