//! In-memory adapters for driving the pipeline without Kafka or ClickHouse.
//!
//! [`MemoryTopic`] is a partitioned append-only log; [`MemorySource`] reads
//! it the way the Kafka adapter reads a real topic (bounded polls, rewind to
//! the beginning). [`MemoryStore`] records DDL and inserts and infers types
//! locally in place of `DESC format(...)`.

use crate::decode::DecodedRow;
use crate::kafka::{MessageSource, PollBatch, RawMessage};
use crate::schema::{infer_columns, ColumnSpec, Schema};
use crate::store::{StoreClient, TableRef};
use crate::{Error, KafkaError, Result, StoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Topic and source
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TopicState {
    name: String,
    partitions: Vec<Vec<RawMessage>>,
}

/// Shared handle to an in-memory topic. Clones see the same log.
#[derive(Debug, Clone)]
pub struct MemoryTopic {
    state: Arc<Mutex<TopicState>>,
}

impl MemoryTopic {
    pub fn new(name: impl Into<String>, partitions: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(TopicState {
                name: name.into(),
                partitions: vec![Vec::new(); partitions],
            })),
        }
    }

    /// Append a message and return its offset.
    ///
    /// Panics if the partition does not exist.
    pub fn produce(&self, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        let mut state = self.state.lock();
        let topic = state.name.clone();
        let log = &mut state.partitions[partition as usize];
        let offset = log.len() as i64;
        log.push(RawMessage::new(topic, partition, offset, payload));
        offset
    }

    /// Append a message without a payload.
    pub fn produce_tombstone(&self, partition: i32) -> i64 {
        let mut state = self.state.lock();
        let topic = state.name.clone();
        let log = &mut state.partitions[partition as usize];
        let offset = log.len() as i64;
        log.push(RawMessage {
            payload: None,
            ..RawMessage::new(topic, partition, offset, Vec::new())
        });
        offset
    }

    /// A fresh reader positioned at the beginning of every partition.
    pub fn source(&self) -> MemorySource {
        let state = self.state.lock();
        MemorySource {
            topic: self.clone(),
            name: state.name.clone(),
            partitions: (0..state.partitions.len() as i32).collect(),
            positions: vec![0; state.partitions.len()],
            max_poll_records: 500,
            rewinds: 0,
            failures: SourceFailures::default(),
        }
    }
}

#[derive(Debug, Default)]
struct FailureScript {
    next: VecDeque<KafkaError>,
    when_idle: VecDeque<KafkaError>,
}

/// Scripted poll failures, shared with a [`MemorySource`].
#[derive(Debug, Clone, Default)]
pub struct SourceFailures {
    script: Arc<Mutex<FailureScript>>,
}

impl SourceFailures {
    /// Fail the next poll, before any data is returned.
    pub fn fail_next(&self, err: KafkaError) {
        self.script.lock().next.push_back(err);
    }

    /// Fail the first poll that finds nothing left to read.
    pub fn fail_after_data(&self, err: KafkaError) {
        self.script.lock().when_idle.push_back(err);
    }
}

/// Reader over a [`MemoryTopic`].
#[derive(Debug)]
pub struct MemorySource {
    topic: MemoryTopic,
    name: String,
    partitions: Vec<i32>,
    positions: Vec<usize>,
    max_poll_records: usize,
    rewinds: usize,
    failures: SourceFailures,
}

impl MemorySource {
    pub fn with_max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max.max(1);
        self
    }

    pub fn failure_handle(&self) -> SourceFailures {
        self.failures.clone()
    }

    /// How many times `rewind` was called.
    pub fn rewinds(&self) -> usize {
        self.rewinds
    }

    /// Next offset to read in a partition.
    pub fn position(&self, partition: i32) -> usize {
        self.positions[partition as usize]
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    fn topic(&self) -> &str {
        &self.name
    }

    fn partitions(&self) -> &[i32] {
        &self.partitions
    }

    async fn poll(&mut self, timeout: Duration) -> Result<PollBatch> {
        if let Some(err) = self.failures.script.lock().next.pop_front() {
            return Err(Error::Kafka(err));
        }

        let mut batch = PollBatch::new();
        {
            let state = self.topic.state.lock();
            for (index, log) in state.partitions.iter().enumerate() {
                while batch.len() < self.max_poll_records && self.positions[index] < log.len() {
                    batch.push(log[self.positions[index]].clone());
                    self.positions[index] += 1;
                }
            }
        }

        if batch.is_empty() {
            if let Some(err) = self.failures.script.lock().when_idle.pop_front() {
                return Err(Error::Kafka(err));
            }
            // A real consumer blocks for the whole timeout when idle.
            tokio::time::sleep(timeout).await;
        }

        Ok(batch)
    }

    fn rewind(&mut self) -> Result<()> {
        self.positions.iter_mut().for_each(|p| *p = 0);
        self.rewinds += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// One recorded insert statement.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInsert {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub offsets: Vec<(i32, i64)>,
}

impl RecordedInsert {
    /// Values of one column across all rows.
    pub fn column(&self, name: &str) -> Vec<Value> {
        match self.columns.iter().position(|c| c == name) {
            Some(index) => self.rows.iter().map(|row| row[index].clone()).collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    executed: Vec<String>,
    tables: BTreeSet<String>,
    inserts: Vec<RecordedInsert>,
    describe_calls: usize,
    insert_attempts: usize,
    fail_describes: usize,
    fail_executes: usize,
    fail_inserts: usize,
    insert_delay: Option<Duration>,
    unreachable: bool,
}

/// Recording [`StoreClient`]. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `ping`, `execute` and `describe_json` fail at the transport level.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn fail_next_describes(&self, count: usize) {
        self.state.lock().fail_describes = count;
    }

    pub fn fail_next_executes(&self, count: usize) {
        self.state.lock().fail_executes = count;
    }

    pub fn fail_next_inserts(&self, count: usize) {
        self.state.lock().fail_inserts = count;
    }

    /// Make every insert take this long before completing.
    pub fn set_insert_delay(&self, delay: Duration) {
        self.state.lock().insert_delay = Some(delay);
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// Tables created so far, as `db.table`.
    pub fn tables(&self) -> Vec<String> {
        self.state.lock().tables.iter().cloned().collect()
    }

    /// Successful inserts in order.
    pub fn inserts(&self) -> Vec<RecordedInsert> {
        self.state.lock().inserts.clone()
    }

    pub fn insert_attempts(&self) -> usize {
        self.state.lock().insert_attempts
    }

    pub fn describe_calls(&self) -> usize {
        self.state.lock().describe_calls
    }
}

fn unreachable_error() -> Error {
    Error::Store(StoreError::Request("connection refused".into()))
}

/// `db.table` from a `CREATE TABLE IF NOT EXISTS` statement.
fn created_table(sql: &str) -> Option<String> {
    let rest = sql.strip_prefix("CREATE TABLE IF NOT EXISTS ")?;
    let name = rest.split_whitespace().next()?;
    Some(name.replace('`', ""))
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn ping(&self) -> Result<()> {
        if self.state.lock().unreachable {
            return Err(unreachable_error());
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(unreachable_error());
        }
        state.executed.push(sql.to_string());
        if state.fail_executes > 0 {
            state.fail_executes -= 1;
            return Err(Error::Store(StoreError::QueryFailed {
                status: 500,
                message: "Code: 241. DB::Exception: Memory limit exceeded".into(),
            }));
        }
        if let Some(table) = created_table(sql) {
            state.tables.insert(table);
        }
        Ok(())
    }

    async fn describe_json(&self, sample: &str) -> Result<Vec<ColumnSpec>> {
        {
            let mut state = self.state.lock();
            state.describe_calls += 1;
            if state.unreachable {
                return Err(unreachable_error());
            }
            if state.fail_describes > 0 {
                state.fail_describes -= 1;
                return Err(Error::Store(StoreError::QueryFailed {
                    status: 500,
                    message: "Cannot extract table structure".into(),
                }));
            }
        }

        match serde_json::from_str::<Value>(sample)? {
            Value::Object(object) => Ok(infer_columns(&object)),
            _ => Err(Error::Store(StoreError::QueryFailed {
                status: 400,
                message: "sample is not an object".into(),
            })),
        }
    }

    async fn insert_rows(
        &self,
        table: &TableRef,
        schema: &Schema,
        rows: &[DecodedRow],
    ) -> Result<()> {
        let delay = self.state.lock().insert_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.insert_attempts += 1;

        if state.fail_inserts > 0 {
            state.fail_inserts -= 1;
            return Err(Error::Store(StoreError::InsertFailed {
                table: table.to_string(),
                rows: rows.len(),
                message: "HTTP 503".into(),
            }));
        }

        if let Some(row) = rows.iter().find(|r| r.values.len() != schema.len()) {
            return Err(Error::Store(StoreError::InsertFailed {
                table: table.to_string(),
                rows: rows.len(),
                message: format!(
                    "row at {}:{} has {} values for {} columns",
                    row.partition,
                    row.offset,
                    row.values.len(),
                    schema.len()
                ),
            }));
        }

        state.inserts.push(RecordedInsert {
            table: table.to_string(),
            columns: schema.names().map(str::to_string).collect(),
            rows: rows.iter().map(|r| r.values.clone()).collect(),
            offsets: rows.iter().map(|r| (r.partition, r.offset)).collect(),
        });
        Ok(())
    }
}
