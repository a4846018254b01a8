//! Ingestion metrics: lock-free counters shared between the loop and the
//! health server.

mod prometheus;

pub use prometheus::FlushDurationHistogram;

use crate::buffer::FlushReason;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Histogram bucket boundaries in milliseconds for flush duration.
/// Converts to seconds: [0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
const FLUSH_DURATION_BUCKETS_MS: [u64; 7] = [100, 250, 500, 1000, 2500, 5000, 10000];

/// Counters, gauges and the flush-duration histogram.
#[derive(Debug, Default)]
pub struct IngestionMetrics {
    // === COUNTERS ===
    /// Messages received from Kafka, decodable or not
    messages_total: AtomicU64,

    /// Messages dropped because they were not a JSON object
    decode_errors_total: AtomicU64,

    /// Flushes by trigger
    flushes_size: AtomicU64,
    flushes_timeout: AtomicU64,
    flushes_drain: AtomicU64,

    /// Rows that reached ClickHouse
    rows_flushed_total: AtomicU64,

    /// Failed insert attempts, retries included
    insert_failures_total: AtomicU64,

    /// Rows discarded after their batch failed for good
    rows_dropped_total: AtomicU64,

    /// Failed poll calls
    poll_errors_total: AtomicU64,

    // === GAUGES ===
    /// Rows waiting in the current batch
    rows_buffered: AtomicU64,

    /// Received but not yet flushed messages, summed over partitions
    pending_messages: AtomicU64,

    // === HISTOGRAM: flush_duration_seconds ===
    flush_duration_sum_ms: AtomicU64,
    flush_duration_count: AtomicU64,
    /// Buckets: [0.1s, 0.25s, 0.5s, 1.0s, 2.5s, 5.0s, 10.0s, +Inf]
    flush_duration_buckets: [AtomicU64; 8],
}

/// Point-in-time copy of every counter, for JSON endpoints and summaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_total: u64,
    pub decode_errors_total: u64,
    pub flushes_size: u64,
    pub flushes_timeout: u64,
    pub flushes_drain: u64,
    pub rows_flushed_total: u64,
    pub insert_failures_total: u64,
    pub rows_dropped_total: u64,
    pub poll_errors_total: u64,
    pub rows_buffered: u64,
    pub pending_messages: u64,
}

impl MetricsSnapshot {
    /// Successful flushes across all triggers.
    pub fn flushes_total(&self) -> u64 {
        self.flushes_size + self.flushes_timeout + self.flushes_drain
    }
}

impl IngestionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // === COUNTER RECORDING ===

    pub fn record_messages(&self, count: u64) {
        self.messages_total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_error(&self) {
        self.poll_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert_failure(&self) {
        self.insert_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rows_dropped(&self, rows: usize) {
        self.rows_dropped_total
            .fetch_add(rows as u64, Ordering::Relaxed);
    }

    /// Record a successful flush with duration histogram.
    pub fn record_flush(&self, reason: FlushReason, rows: usize, duration: Duration) {
        let counter = match reason {
            FlushReason::Size => &self.flushes_size,
            FlushReason::Timeout => &self.flushes_timeout,
            FlushReason::Drain => &self.flushes_drain,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.rows_flushed_total
            .fetch_add(rows as u64, Ordering::Relaxed);

        let duration_ms = duration.as_millis() as u64;
        self.flush_duration_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.flush_duration_count.fetch_add(1, Ordering::Relaxed);

        // Buckets are cumulative (le = less than or equal)
        for (i, &bucket_ms) in FLUSH_DURATION_BUCKETS_MS.iter().enumerate() {
            if duration_ms <= bucket_ms {
                self.flush_duration_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.flush_duration_buckets[7].fetch_add(1, Ordering::Relaxed);
    }

    // === GAUGE UPDATES ===

    pub fn set_rows_buffered(&self, rows: usize) {
        self.rows_buffered.store(rows as u64, Ordering::Relaxed);
    }

    pub fn set_pending_messages(&self, pending: u64) {
        self.pending_messages.store(pending, Ordering::Relaxed);
    }

    // === GETTERS ===

    pub fn messages_total(&self) -> u64 {
        self.messages_total.load(Ordering::Relaxed)
    }

    pub fn flushes(&self, reason: FlushReason) -> u64 {
        match reason {
            FlushReason::Size => self.flushes_size.load(Ordering::Relaxed),
            FlushReason::Timeout => self.flushes_timeout.load(Ordering::Relaxed),
            FlushReason::Drain => self.flushes_drain.load(Ordering::Relaxed),
        }
    }

    pub fn rows_flushed_total(&self) -> u64 {
        self.rows_flushed_total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_total: self.messages_total(),
            decode_errors_total: self.decode_errors_total.load(Ordering::Relaxed),
            flushes_size: self.flushes(FlushReason::Size),
            flushes_timeout: self.flushes(FlushReason::Timeout),
            flushes_drain: self.flushes(FlushReason::Drain),
            rows_flushed_total: self.rows_flushed_total(),
            insert_failures_total: self.insert_failures_total.load(Ordering::Relaxed),
            rows_dropped_total: self.rows_dropped_total.load(Ordering::Relaxed),
            poll_errors_total: self.poll_errors_total.load(Ordering::Relaxed),
            rows_buffered: self.rows_buffered.load(Ordering::Relaxed),
            pending_messages: self.pending_messages.load(Ordering::Relaxed),
        }
    }

    /// Histogram data for Prometheus export.
    pub fn flush_duration_histogram(&self) -> FlushDurationHistogram {
        let bucket = |i: usize| self.flush_duration_buckets[i].load(Ordering::Relaxed);
        FlushDurationHistogram {
            sum_seconds: self.flush_duration_sum_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            count: self.flush_duration_count.load(Ordering::Relaxed),
            buckets: [
                (0.1, bucket(0)),
                (0.25, bucket(1)),
                (0.5, bucket(2)),
                (1.0, bucket(3)),
                (2.5, bucket(4)),
                (5.0, bucket(5)),
                (10.0, bucket(6)),
            ],
            inf_bucket: bucket(7),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = IngestionMetrics::new();

        metrics.record_messages(12);
        metrics.record_decode_error();
        metrics.record_poll_error();
        metrics.record_insert_failure();
        metrics.record_insert_failure();
        metrics.record_rows_dropped(40);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_total, 12);
        assert_eq!(snapshot.decode_errors_total, 1);
        assert_eq!(snapshot.poll_errors_total, 1);
        assert_eq!(snapshot.insert_failures_total, 2);
        assert_eq!(snapshot.rows_dropped_total, 40);
        assert_eq!(snapshot.flushes_total(), 0);
    }

    #[test]
    fn test_flushes_by_reason() {
        let metrics = IngestionMetrics::new();

        metrics.record_flush(FlushReason::Size, 100, Duration::from_millis(50));
        metrics.record_flush(FlushReason::Size, 100, Duration::from_millis(50));
        metrics.record_flush(FlushReason::Timeout, 3, Duration::from_millis(20));
        metrics.record_flush(FlushReason::Drain, 1, Duration::from_millis(10));

        assert_eq!(metrics.flushes(FlushReason::Size), 2);
        assert_eq!(metrics.flushes(FlushReason::Timeout), 1);
        assert_eq!(metrics.flushes(FlushReason::Drain), 1);
        assert_eq!(metrics.rows_flushed_total(), 204);
        assert_eq!(metrics.snapshot().flushes_total(), 4);
    }

    #[test]
    fn test_histogram_buckets() {
        let metrics = IngestionMetrics::new();

        metrics.record_flush(FlushReason::Size, 10, Duration::from_millis(50)); // <= 0.1s
        metrics.record_flush(FlushReason::Size, 10, Duration::from_millis(300)); // <= 0.5s
        metrics.record_flush(FlushReason::Size, 10, Duration::from_millis(8000)); // <= 10.0s
        metrics.record_flush(FlushReason::Size, 10, Duration::from_millis(15000)); // +Inf only

        let hist = metrics.flush_duration_histogram();
        assert_eq!(hist.count, 4);
        assert_eq!(hist.buckets[0].1, 1);
        assert_eq!(hist.buckets[1].1, 1);
        assert_eq!(hist.buckets[2].1, 2);
        assert_eq!(hist.buckets[6].1, 3);
        assert_eq!(hist.inf_bucket, 4);
        assert!((hist.sum_seconds - 23.35).abs() < 0.001);
    }

    #[test]
    fn test_gauges() {
        let metrics = IngestionMetrics::new();

        metrics.set_rows_buffered(42);
        metrics.set_pending_messages(7);
        metrics.set_rows_buffered(0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.rows_buffered, 0);
        assert_eq!(snapshot.pending_messages, 7);
    }
}
