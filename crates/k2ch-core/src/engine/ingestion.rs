//! Main ingestion engine orchestration.
//!
//! Startup is gated: connect, infer the schema from a sample, provision the
//! destination table. Only then does the steady-state loop run:
//!
//! - poll Kafka with a short bounded timeout
//! - decode and project every message, dropping undecodable ones
//! - push rows into the batch, flushing inline when it fills up
//! - flush when the oldest buffered row is older than the batch timeout
//!
//! The loop is sequential. Shutdown is checked between iterations, never
//! during an insert, and always ends with a drain of the pending batch.

use crate::buffer::{BatchAccumulator, FlushReason};
use crate::config::{Config, InsertFailurePolicy};
use crate::decode::decode_row;
use crate::health::{HealthCheck, BUFFER, CLICKHOUSE, KAFKA};
use crate::kafka::{KafkaSource, MessageSource, OffsetTracker, PollBatch};
use crate::metrics::IngestionMetrics;
use crate::retry::RetryConfig;
use crate::schema::{Schema, SchemaInferrer};
use crate::store::{ClickHouseClient, StoreClient, TableProvisioner, TableRef};
use crate::{Disposition, Error, Result, SchemaError, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Totals reported when the loop exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub messages_seen: u64,
    pub decode_errors: u64,
    pub flushes: u64,
    pub rows_flushed: u64,
    pub rows_dropped: u64,
    pub elapsed: Duration,
}

/// Main ingestion engine.
pub struct IngestionEngine {
    config: Config,
    source: Box<dyn MessageSource>,
    store: Arc<dyn StoreClient>,
    schema: Arc<Schema>,
    table: TableRef,
    batch: BatchAccumulator,
    offsets: Arc<OffsetTracker>,
    metrics: Arc<IngestionMetrics>,
    health: Arc<HealthCheck>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_retry: RetryConfig,
    insert_retry: Option<RetryConfig>,
    progress_every: u64,
    messages_seen: u64,
}

impl IngestionEngine {
    /// Connect to ClickHouse and Kafka, then bootstrap.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let store = ClickHouseClient::connect(&config.clickhouse).await?;
        let source = KafkaSource::connect(&config)?;

        Self::bootstrap(config, Box::new(source), Arc::new(store)).await
    }

    /// Infer the schema and provision the table using the given adapters.
    ///
    /// Every error returned here is fatal: the loop never starts without a
    /// schema and a destination table.
    pub async fn bootstrap(
        config: Config,
        mut source: Box<dyn MessageSource>,
        store: Arc<dyn StoreClient>,
    ) -> Result<Self> {
        let health = Arc::new(HealthCheck::for_pipeline());
        health.mark_healthy(KAFKA);
        health.mark_healthy(CLICKHOUSE);

        info!(
            connection = %config.connection_name,
            topic = %source.topic(),
            partitions = source.partitions().len(),
            "Sampling topic for schema inference"
        );
        let schema = SchemaInferrer::new(&config)
            .infer(source.as_mut(), store.as_ref())
            .await?;

        let table = TableRef::for_topic(config.clickhouse.database.clone(), source.topic());
        let provisioner = TableProvisioner::new(&config.clickhouse);
        let timeout = config.clickhouse.request_timeout();
        tokio::time::timeout(timeout, provisioner.provision(store.as_ref(), &table, &schema))
            .await
            .map_err(|_| SchemaError::ProvisionFailed {
                table: table.to_string(),
                message: format!("timed out after {}ms", timeout.as_millis()),
            })??;

        let insert_retry = match config.clickhouse.insert_failure_policy {
            InsertFailurePolicy::Drop => None,
            InsertFailurePolicy::Retry => Some(RetryConfig::for_insert(
                config.clickhouse.insert_max_retries,
            )),
        };
        let progress_every = (config.batch.size as u64 / 2).max(10);
        // Subscribed here so a signal sent before `run` is not lost.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        health.mark_healthy(BUFFER);

        Ok(Self {
            batch: BatchAccumulator::from_config(&config.batch),
            config,
            source,
            store,
            schema: Arc::new(schema),
            table,
            offsets: Arc::new(OffsetTracker::new()),
            metrics: Arc::new(IngestionMetrics::new()),
            health,
            shutdown_tx,
            shutdown_rx,
            poll_retry: RetryConfig::for_poll(),
            insert_retry,
            progress_every,
            messages_seen: 0,
        })
    }

    /// Run the main ingestion loop until shutdown or a fatal error.
    ///
    /// A fatal error still drains the pending batch before it is returned.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let mut poll_failures: u32 = 0;
        let mut outcome = Ok(());

        self.health.pipeline_started();
        info!(
            table = %self.table,
            columns = self.schema.len(),
            batch_size = self.batch.max_rows(),
            batch_timeout_ms = self.config.batch.timeout().as_millis() as u64,
            insert_failure_policy = ?self.config.clickhouse.insert_failure_policy,
            "Ingestion loop started"
        );

        loop {
            match self.shutdown_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => {
                    info!("Shutdown signal received");
                    break;
                }
            }

            match self.source.poll(self.config.kafka.poll_timeout()).await {
                Ok(batch) => {
                    if poll_failures > 0 {
                        info!(failures = poll_failures, "Kafka poll recovered");
                        self.health.mark_healthy(KAFKA);
                    }
                    poll_failures = 0;
                    self.process(batch).await;
                }
                Err(e) if e.disposition() == Disposition::Abort => {
                    error!(error = %e, "Unrecoverable consumer error, stopping ingestion");
                    self.health.mark_unhealthy(KAFKA, &e.to_string());
                    outcome = Err(e);
                    break;
                }
                Err(e) => {
                    self.metrics.record_poll_error();
                    self.health
                        .mark_degraded(KAFKA, &format!("Poll failed: {}", e));

                    // A pending batch must not wait out a long backoff.
                    if let Some(reason) = self.batch.due(Instant::now()) {
                        self.flush(reason).await;
                    }
                    let mut delay = self.poll_retry.calculate_delay(poll_failures);
                    if let Some(left) = self.batch.time_left(Instant::now()) {
                        delay = delay.min(left);
                    }
                    poll_failures = poll_failures.saturating_add(1);
                    warn!(
                        error = %e,
                        failures = poll_failures,
                        backoff_ms = delay.as_millis() as u64,
                        "Kafka poll failed"
                    );

                    tokio::select! {
                        _ = self.shutdown_rx.recv() => {
                            info!("Shutdown signal received during poll backoff");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            if let Some(reason) = self.batch.due(Instant::now()) {
                self.flush(reason).await;
            }
        }

        if let Some(reason) = self.batch.drain() {
            info!(rows = self.batch.len(), "Draining pending batch");
            self.flush(reason).await;
        }
        self.health.pipeline_stopped();

        let summary = self.summary(started.elapsed());
        info!(
            messages = summary.messages_seen,
            decode_errors = summary.decode_errors,
            flushes = summary.flushes,
            rows_flushed = summary.rows_flushed,
            rows_dropped = summary.rows_dropped,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Ingestion loop stopped"
        );

        outcome.map(|()| summary)
    }

    async fn process(&mut self, batch: PollBatch) {
        let received = batch.len();
        if received == 0 {
            return;
        }
        self.metrics.record_messages(received as u64);

        for msg in batch {
            self.messages_seen += 1;
            self.offsets.record_consumed(msg.partition, msg.offset);

            match decode_row(msg.partition, msg.offset, msg.payload_bytes(), &self.schema) {
                Ok(row) => {
                    if let Some(reason) = self.batch.push(row) {
                        self.flush(reason).await;
                    }
                }
                Err(e) => {
                    self.metrics.record_decode_error();
                    warn!(
                        partition = msg.partition,
                        offset = msg.offset,
                        error = %e,
                        payload = %msg.payload_preview(),
                        "Dropping undecodable message"
                    );
                }
            }

            if self.messages_seen % self.progress_every == 0 {
                info!(
                    messages = self.messages_seen,
                    buffered = self.batch.len(),
                    rows_flushed = self.metrics.rows_flushed_total(),
                    "Ingestion progress"
                );
            }
        }

        self.metrics.set_rows_buffered(self.batch.len());
        self.update_pending();
    }

    /// Insert the current batch and clear it, whatever the outcome.
    async fn flush(&mut self, reason: FlushReason) {
        if self.batch.is_empty() {
            return;
        }

        let rows = self.batch.len();
        let ranges = self.batch.partition_ranges();
        let started = Instant::now();

        match self.insert_with_policy().await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.metrics.record_flush(reason, rows, elapsed);
                for range in &ranges {
                    self.offsets
                        .record_flushed(range.partition, range.last_offset);
                }
                self.health.mark_healthy(CLICKHOUSE);
                info!(
                    reason = %reason,
                    rows,
                    table = %self.table,
                    duration_ms = elapsed.as_millis() as u64,
                    "Batch flushed"
                );
            }
            Err(e) => {
                self.metrics.record_rows_dropped(rows);
                self.health
                    .mark_degraded(CLICKHOUSE, &format!("Insert failed: {}", e));
                error!(
                    reason = %reason,
                    rows,
                    table = %self.table,
                    offsets = ?ranges,
                    error = %e,
                    "Batch insert failed, batch dropped"
                );
            }
        }

        self.batch.clear();
        self.metrics.set_rows_buffered(0);
        self.update_pending();
    }

    async fn insert_with_policy(&self) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            let err = match self.insert_once().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            self.metrics.record_insert_failure();

            match &self.insert_retry {
                Some(retry) if attempt < retry.max_retries => {
                    let delay = retry.calculate_delay(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = retry.max_retries,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Insert failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(err),
            }
        }
    }

    async fn insert_once(&self) -> Result<()> {
        let rows = self.batch.rows();
        let timeout = self.config.clickhouse.request_timeout();

        match tokio::time::timeout(
            timeout,
            self.store.insert_rows(&self.table, &self.schema, rows),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Store(StoreError::InsertFailed {
                table: self.table.to_string(),
                rows: rows.len(),
                message: format!("timed out after {}ms", timeout.as_millis()),
            })),
        }
    }

    fn update_pending(&self) {
        let pending: i64 = self
            .offsets
            .snapshot()
            .into_iter()
            .filter_map(|(partition, _, _)| self.offsets.pending(partition))
            .sum();
        self.metrics.set_pending_messages(pending.max(0) as u64);
        debug!(pending, "Pending messages updated");
    }

    fn summary(&self, elapsed: Duration) -> RunSummary {
        let snapshot = self.metrics.snapshot();
        RunSummary {
            messages_seen: snapshot.messages_total,
            decode_errors: snapshot.decode_errors_total,
            flushes: snapshot.flushes_total(),
            rows_flushed: snapshot.rows_flushed_total,
            rows_dropped: snapshot.rows_dropped_total,
            elapsed,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn offsets(&self) -> Arc<OffsetTracker> {
        Arc::clone(&self.offsets)
    }

    pub fn metrics(&self) -> Arc<IngestionMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn health(&self) -> Arc<HealthCheck> {
        Arc::clone(&self.health)
    }

    /// Sender that stops the loop at the next iteration boundary.
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}
