//! Prometheus text exposition.

use super::IngestionMetrics;
use std::fmt::Write;

/// Flush duration histogram data for export.
#[derive(Debug, Clone)]
pub struct FlushDurationHistogram {
    /// Sum of all observations in seconds
    pub sum_seconds: f64,
    /// Total count of observations
    pub count: u64,
    /// Bucket counts: (le_boundary_seconds, count)
    pub buckets: [(f64, u64); 7],
    /// +Inf bucket count
    pub inf_bucket: u64,
}

fn header(out: &mut String, prefix: &str, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {}_{} {}", prefix, name, help);
    let _ = writeln!(out, "# TYPE {}_{} {}", prefix, name, kind);
}

fn single(out: &mut String, prefix: &str, name: &str, kind: &str, help: &str, value: u64) {
    header(out, prefix, name, kind, help);
    let _ = writeln!(out, "{}_{} {}", prefix, name, value);
    out.push('\n');
}

impl IngestionMetrics {
    /// Export all metrics in Prometheus text format.
    ///
    /// # Example
    /// ```
    /// use k2ch_core::metrics::IngestionMetrics;
    ///
    /// let metrics = IngestionMetrics::new();
    /// metrics.record_messages(1);
    /// let text = metrics.export_prometheus_text();
    /// assert!(text.contains("k2ch_messages_total 1"));
    /// ```
    pub fn export_prometheus_text(&self) -> String {
        self.export_prometheus_text_with_prefix("k2ch")
    }

    /// Export with a custom metric name prefix.
    pub fn export_prometheus_text_with_prefix(&self, prefix: &str) -> String {
        let s = self.snapshot();
        let mut out = String::with_capacity(4096);

        // === COUNTERS ===

        let counters = [
            ("messages_total", "Messages received from Kafka", s.messages_total),
            (
                "decode_errors_total",
                "Messages dropped because they could not be decoded",
                s.decode_errors_total,
            ),
        ];
        for (name, help, value) in counters {
            single(&mut out, prefix, name, "counter", help, value);
        }

        header(
            &mut out,
            prefix,
            "flushes_total",
            "counter",
            "Successful batch flushes by trigger",
        );
        for (reason, value) in [
            ("size", s.flushes_size),
            ("timeout", s.flushes_timeout),
            ("drain", s.flushes_drain),
        ] {
            let _ = writeln!(
                out,
                "{}_flushes_total{{reason=\"{}\"}} {}",
                prefix, reason, value
            );
        }
        out.push('\n');

        let counters = [
            ("rows_flushed_total", "Rows inserted into ClickHouse", s.rows_flushed_total),
            ("insert_failures_total", "Failed insert attempts", s.insert_failures_total),
            ("rows_dropped_total", "Rows discarded after a failed flush", s.rows_dropped_total),
            ("poll_errors_total", "Failed Kafka poll calls", s.poll_errors_total),
        ];
        for (name, help, value) in counters {
            single(&mut out, prefix, name, "counter", help, value);
        }

        // === GAUGES ===

        let gauges = [
            ("rows_buffered", "Rows waiting in the current batch", s.rows_buffered),
            ("pending_messages", "Messages received but not yet flushed", s.pending_messages),
        ];
        for (name, help, value) in gauges {
            single(&mut out, prefix, name, "gauge", help, value);
        }

        // === HISTOGRAM: flush_duration_seconds ===

        let hist = self.flush_duration_histogram();
        header(
            &mut out,
            prefix,
            "flush_duration_seconds",
            "histogram",
            "Duration of batch inserts",
        );
        for (le, count) in &hist.buckets {
            let _ = writeln!(
                out,
                "{}_flush_duration_seconds_bucket{{le=\"{}\"}} {}",
                prefix, le, count
            );
        }
        let _ = writeln!(
            out,
            "{}_flush_duration_seconds_bucket{{le=\"+Inf\"}} {}",
            prefix, hist.inf_bucket
        );
        let _ = writeln!(out, "{}_flush_duration_seconds_sum {}", prefix, hist.sum_seconds);
        let _ = writeln!(out, "{}_flush_duration_seconds_count {}", prefix, hist.count);

        out
    }
}
