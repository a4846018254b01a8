//! Batch accumulator and flush triggers.
//!
//! State machine:
//!
//! ```text
//!   Empty --push--> Accumulating --(size | timeout | drain)--> Empty
//! ```
//!
//! The start timestamp is set by the first row after a clear and reset by
//! the next clear. Size and age are independent triggers; whichever fires
//! first wins.

use crate::config::BatchConfig;
use crate::decode::DecodedRow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Why a batch is being flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushReason {
    /// Row count reached the batch size
    Size,
    /// Oldest row exceeded the batch timeout
    Timeout,
    /// Final flush on shutdown
    Drain,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Timeout => "timeout",
            FlushReason::Drain => "drain",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Empty,
    Accumulating { started_at: Instant },
}

/// First and last offset of one partition within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    pub partition: i32,
    pub first_offset: i64,
    pub last_offset: i64,
}

/// Buffers projected rows until a flush trigger fires.
#[derive(Debug)]
pub struct BatchAccumulator {
    rows: Vec<DecodedRow>,
    state: BatchState,
    max_rows: usize,
    max_age: Duration,
}

impl BatchAccumulator {
    pub fn new(max_rows: usize, max_age: Duration) -> Self {
        let max_rows = max_rows.max(1);
        Self {
            rows: Vec::with_capacity(max_rows),
            state: BatchState::Empty,
            max_rows,
            max_age,
        }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.size, config.timeout())
    }

    /// Append a row. Returns `Some(Size)` once the batch is full.
    pub fn push(&mut self, row: DecodedRow) -> Option<FlushReason> {
        if self.state == BatchState::Empty {
            self.state = BatchState::Accumulating {
                started_at: Instant::now(),
            };
        }
        self.rows.push(row);

        (self.rows.len() >= self.max_rows).then_some(FlushReason::Size)
    }

    /// `Some(Timeout)` if the batch is non-empty and at least `max_age` old.
    pub fn due(&self, now: Instant) -> Option<FlushReason> {
        match self.state {
            BatchState::Accumulating { started_at }
                if now.saturating_duration_since(started_at) >= self.max_age =>
            {
                Some(FlushReason::Timeout)
            }
            _ => None,
        }
    }

    /// `Some(Drain)` if anything is left to flush.
    pub fn drain(&self) -> Option<FlushReason> {
        (!self.rows.is_empty()).then_some(FlushReason::Drain)
    }

    pub fn rows(&self) -> &[DecodedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Age of the oldest row, zero when empty.
    pub fn age(&self, now: Instant) -> Duration {
        match self.state {
            BatchState::Accumulating { started_at } => now.saturating_duration_since(started_at),
            BatchState::Empty => Duration::ZERO,
        }
    }

    /// Time until the timeout trigger fires, `None` when empty.
    pub fn time_left(&self, now: Instant) -> Option<Duration> {
        match self.state {
            BatchState::Accumulating { .. } => Some(self.max_age.saturating_sub(self.age(now))),
            BatchState::Empty => None,
        }
    }

    /// Offset span per partition, for logging what a flush covered.
    pub fn partition_ranges(&self) -> Vec<PartitionRange> {
        let mut ranges: BTreeMap<i32, (i64, i64)> = BTreeMap::new();
        for row in &self.rows {
            ranges
                .entry(row.partition)
                .and_modify(|(first, last)| {
                    *first = (*first).min(row.offset);
                    *last = (*last).max(row.offset);
                })
                .or_insert((row.offset, row.offset));
        }
        ranges
            .into_iter()
            .map(|(partition, (first_offset, last_offset))| PartitionRange {
                partition,
                first_offset,
                last_offset,
            })
            .collect()
    }

    /// Drop all rows and return to `Empty`, keeping the allocation.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.state = BatchState::Empty;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(partition: i32, offset: i64) -> DecodedRow {
        DecodedRow::new(partition, offset, vec![json!(offset)])
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_fires_at_threshold() {
        let mut batch = BatchAccumulator::new(100, Duration::from_secs(1));

        for offset in 0..99 {
            assert_eq!(batch.push(row(0, offset)), None);
        }
        assert_eq!(batch.push(row(0, 99)), Some(FlushReason::Size));
        assert_eq!(batch.len(), 100);

        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.state(), BatchState::Empty);
        assert!(batch.rows.capacity() >= 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_trigger_measures_from_first_row() {
        let mut batch = BatchAccumulator::new(100, Duration::from_secs(1));
        assert_eq!(batch.due(Instant::now()), None);

        tokio::time::advance(Duration::from_secs(5)).await;
        batch.push(row(0, 0));
        let started = Instant::now();
        assert!(matches!(batch.state(), BatchState::Accumulating { .. }));

        tokio::time::advance(Duration::from_millis(600)).await;
        batch.push(row(0, 1));
        assert_eq!(batch.due(Instant::now()), None);

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(batch.due(Instant::now()), Some(FlushReason::Timeout));
        assert_eq!(batch.age(Instant::now()), Instant::now() - started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_resets_start_timestamp() {
        let mut batch = BatchAccumulator::new(10, Duration::from_secs(1));
        batch.push(row(0, 0));
        tokio::time::advance(Duration::from_secs(2)).await;
        batch.clear();

        batch.push(row(0, 1));
        assert_eq!(batch.due(Instant::now()), None);
        assert_eq!(batch.age(Instant::now()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_left_counts_down_to_zero() {
        let mut batch = BatchAccumulator::new(10, Duration::from_secs(1));
        assert_eq!(batch.time_left(Instant::now()), None);

        batch.push(row(0, 0));
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(batch.time_left(Instant::now()), Some(Duration::from_millis(700)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(batch.time_left(Instant::now()), Some(Duration::ZERO));
    }

    #[test]
    fn test_drain_only_when_non_empty() {
        let mut batch = BatchAccumulator::new(10, Duration::from_secs(1));
        assert_eq!(batch.drain(), None);
        batch.push(row(0, 0));
        assert_eq!(batch.drain(), Some(FlushReason::Drain));
    }

    #[test]
    fn test_partition_ranges() {
        let mut batch = BatchAccumulator::new(10, Duration::from_secs(1));
        batch.push(row(1, 40));
        batch.push(row(0, 7));
        batch.push(row(1, 41));
        batch.push(row(0, 9));

        assert_eq!(
            batch.partition_ranges(),
            vec![
                PartitionRange { partition: 0, first_offset: 7, last_offset: 9 },
                PartitionRange { partition: 1, first_offset: 40, last_offset: 41 },
            ]
        );
    }

    #[test]
    fn test_zero_size_is_treated_as_one() {
        let mut batch = BatchAccumulator::new(0, Duration::from_secs(1));
        assert_eq!(batch.max_rows(), 1);
        assert_eq!(batch.push(row(0, 0)), Some(FlushReason::Size));
    }
}
