//! Size histogram of received records.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Upper bounds of the size buckets, in bytes. Sizes at or above the last
/// bound land in an overflow bucket.
pub const SIZE_BUCKETS: [u64; 15] = [
    100,
    250,
    1_000,
    2_500,
    10_000,
    25_000,
    100_000,
    250_000,
    1_000_000,
    2_500_000,
    10_000_000,
    25_000_000,
    100_000_000,
    250_000_000,
    1_000_000_000,
];

/// Running counters of record sizes seen by a receiver.
#[derive(Debug)]
pub struct TransferMetrics {
    started: DateTime<Utc>,
    buckets: [AtomicU64; SIZE_BUCKETS.len() + 1],
    sum: AtomicU64,
    count: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub started: DateTime<Utc>,
    /// Count per bucket; the last entry is the overflow bucket.
    pub buckets: Vec<u64>,
    pub sum: u64,
    pub count: u64,
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferMetrics {
    pub fn new() -> Self {
        Self {
            started: Utc::now(),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Counts one record of `size` bytes.
    pub fn observe(&self, size: u64) {
        let index = SIZE_BUCKETS
            .iter()
            .position(|&bound| size < bound)
            .unwrap_or(SIZE_BUCKETS.len());
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(size, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            started: self.started,
            buckets: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            sum: self.sum.load(Ordering::Relaxed),
            count: self.count(),
        }
    }
}
