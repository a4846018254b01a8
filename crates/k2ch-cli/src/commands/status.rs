//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    running: bool,
    uptime_seconds: u64,
    components: BTreeMap<String, ComponentStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    reason: Option<String>,
}

/// Show status and health.
pub async fn run(url: &str) -> Result<()> {
    let base = url.trim_end_matches('/');
    println!("Checking health at {}...\n", base);

    let client = reqwest::Client::new();
    let health_url = format!("{}/health", base);

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the k2ch ingestion service running?");
            println!("Start it with: k2ch ingest --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = format!("{}/metrics", base);
    println!("\n--- Metrics ---");

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

fn status_tag(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        status_tag(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    println!(
        "Pipeline: {} (up {}s)",
        if health.running { "running" } else { "not running" },
        health.uptime_seconds
    );
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            let tag = status_tag(&status.status);
            match &status.reason {
                Some(reason) => println!("  {} {}: {} ({})", tag, name, status.status, reason),
                None => println!("  {} {}: {}", tag, name, status.status),
            }
        }
    }
}

/// Unlabelled `name value` samples from Prometheus text.
fn parse_samples(text: &str) -> BTreeMap<&str, u64> {
    text.lines()
        .filter(|line| !line.starts_with('#') && !line.is_empty())
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let value = parts.next()?.parse::<u64>().ok()?;
            Some((name, value))
        })
        .collect()
}

fn print_metrics(metrics_text: &str) {
    let values = parse_samples(metrics_text);
    if values.is_empty() {
        println!("No metrics available yet.");
        return;
    }

    let rows = [
        ("Messages Received", "k2ch_messages_total"),
        ("Decode Errors", "k2ch_decode_errors_total"),
        ("Rows Flushed", "k2ch_rows_flushed_total"),
        ("Rows Dropped", "k2ch_rows_dropped_total"),
        ("Insert Failures", "k2ch_insert_failures_total"),
        ("Poll Errors", "k2ch_poll_errors_total"),
        ("Rows Buffered", "k2ch_rows_buffered"),
        ("Pending Messages", "k2ch_pending_messages"),
    ];
    for (label, name) in rows {
        if let Some(v) = values.get(name) {
            println!("{:<18} {}", format!("{}:", label), format_number(*v));
        }
    }

    let flushes: Vec<String> = ["size", "timeout", "drain"]
        .iter()
        .filter_map(|reason| {
            let key = format!("k2ch_flushes_total{{reason=\"{}\"}}", reason);
            values.get(key.as_str()).map(|v| format!("{}={}", reason, v))
        })
        .collect();
    if !flushes.is_empty() {
        println!("{:<18} {}", "Flushes:", flushes.join(" "));
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_samples_skips_comments_and_floats() {
        let text = "# HELP k2ch_messages_total x\n\
                    # TYPE k2ch_messages_total counter\n\
                    k2ch_messages_total 42\n\
                    k2ch_flushes_total{reason=\"size\"} 3\n\
                    k2ch_flush_duration_seconds_sum 0.25\n";

        let samples = parse_samples(text);
        assert_eq!(samples.get("k2ch_messages_total"), Some(&42));
        assert_eq!(samples.get("k2ch_flushes_total{reason=\"size\"}"), Some(&3));
        assert!(!samples.contains_key("k2ch_flush_duration_seconds_sum"));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_500), "1.50K");
        assert_eq!(format_number(2_000_000), "2.00M");
    }

    #[test]
    fn test_component_reason_is_optional() {
        let body = r#"{
            "status": "degraded",
            "running": true,
            "uptime_seconds": 12,
            "components": {
                "kafka": {"status": "healthy"},
                "clickhouse": {"status": "degraded", "reason": "Insert failed"}
            },
            "metrics": {}
        }"#;

        let health: HealthResponse = serde_json::from_str(body).unwrap();
        assert!(health.components["kafka"].reason.is_none());
        assert_eq!(
            health.components["clickhouse"].reason.as_deref(),
            Some("Insert failed")
        );
    }
}
