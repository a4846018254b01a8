//! Per-partition progress tracking.
//!
//! Offsets are never committed to Kafka; this is purely observational. It
//! records the highest offset received and the highest offset whose row
//! reached ClickHouse, which the health endpoint reports as backlog.

use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Tracks consumed and flushed offsets per partition.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    /// Highest offset received per partition
    consumed: DashMap<i32, AtomicI64>,

    /// Highest offset inserted per partition
    flushed: DashMap<i32, AtomicI64>,
}

fn raise(map: &DashMap<i32, AtomicI64>, partition: i32, offset: i64) {
    map.entry(partition)
        .and_modify(|v| {
            v.fetch_max(offset, Ordering::SeqCst);
        })
        .or_insert_with(|| AtomicI64::new(offset));
}

impl OffsetTracker {
    /// Create a new offset tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a message at `offset` was received.
    pub fn record_consumed(&self, partition: i32, offset: i64) {
        raise(&self.consumed, partition, offset);
    }

    /// Record that rows up to `offset` were inserted.
    pub fn record_flushed(&self, partition: i32, offset: i64) {
        raise(&self.flushed, partition, offset);
    }

    /// Highest received offset for a partition.
    pub fn consumed(&self, partition: i32) -> Option<i64> {
        self.consumed
            .get(&partition)
            .map(|v| v.load(Ordering::SeqCst))
    }

    /// Highest inserted offset for a partition.
    pub fn flushed(&self, partition: i32) -> Option<i64> {
        self.flushed
            .get(&partition)
            .map(|v| v.load(Ordering::SeqCst))
    }

    /// Messages received but not yet inserted (or dropped) for a partition.
    pub fn pending(&self, partition: i32) -> Option<i64> {
        let consumed = self.consumed(partition)?;
        let flushed = self.flushed(partition).unwrap_or(-1);
        Some((consumed - flushed).max(0))
    }

    /// Snapshot of `(partition, consumed, flushed)` sorted by partition.
    pub fn snapshot(&self) -> Vec<(i32, i64, Option<i64>)> {
        let mut rows: Vec<_> = self
            .consumed
            .iter()
            .map(|entry| {
                let partition = *entry.key();
                (
                    partition,
                    entry.value().load(Ordering::SeqCst),
                    self.flushed(partition),
                )
            })
            .collect();
        rows.sort_unstable_by_key(|(partition, _, _)| *partition);
        rows
    }
}
