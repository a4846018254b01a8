//! Ingest command implementation.

use crate::server::{start_server, ServerState};
use crate::ExitCode;
use anyhow::Result;
use k2ch_core::engine::IngestionEngine;
use k2ch_core::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Command-line overrides applied on top of file and environment settings.
#[derive(Debug, Default)]
pub struct Overrides {
    pub bootstrap_servers: Option<String>,
    pub topic: Option<String>,
    pub batch_size: Option<usize>,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(servers) = self.bootstrap_servers {
            config.kafka.bootstrap_servers = servers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(topic) = self.topic {
            config.kafka.topic = topic;
        }
        if let Some(size) = self.batch_size {
            config.batch.size = size;
        }
    }
}

/// Run the ingestion pipeline until a signal or a fatal error.
pub async fn run(mut config: Config, overrides: Overrides) -> Result<ExitCode> {
    overrides.apply(&mut config);
    config.validate()?;

    info!(
        connection = %config.connection_name,
        brokers = %config.kafka.bootstrap_servers.join(","),
        topic = %config.kafka.topic,
        clickhouse = %config.clickhouse.url(),
        database = %config.clickhouse.database,
        batch_size = config.batch.size,
        batch_timeout_s = config.batch.timeout_seconds,
        "Starting ingestion pipeline"
    );

    let health_port = config.monitoring.health_port;

    let mut engine = IngestionEngine::new(config).await?;
    let shutdown_tx = engine.shutdown_signal();

    if health_port > 0 {
        let server_state = Arc::new(ServerState {
            health: engine.health(),
            metrics: engine.metrics(),
        });
        tokio::spawn(start_server(
            server_state,
            health_port,
            shutdown_tx.subscribe(),
        ));
    }

    // Spawn a task to handle shutdown signals (SIGINT and SIGTERM)
    let interrupted = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&interrupted);
    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_flag.store(true, Ordering::SeqCst);
        let _ = shutdown_signal.send(());
    });

    let summary = engine.run().await?;

    info!(
        messages = summary.messages_seen,
        rows_flushed = summary.rows_flushed,
        rows_dropped = summary.rows_dropped,
        elapsed_s = summary.elapsed.as_secs(),
        "Ingestion pipeline stopped"
    );

    if interrupted.load(Ordering::SeqCst) {
        Ok(ExitCode::SignalInterrupt)
    } else {
        Ok(ExitCode::Success)
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, only Ctrl+C stops ingestion");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
