//! K2CH Core - Kafka to ClickHouse ingestion engine
//!
//! This library ingests JSON events from a Kafka topic and writes them to a
//! ClickHouse table in batches:
//!
//! - Table schema inferred from a sample message, never from a contract
//! - Destination table provisioned idempotently on every start
//! - Size- and time-triggered batch flushes with a drain on shutdown
//! - Malformed messages skipped, failed batches dropped or retried by policy
//!
//! Delivery is at-least-once: offsets are never committed and every start
//! replays the topic from the earliest available offset.

pub mod buffer;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod health;
pub mod kafka;
pub mod metrics;
pub mod retry;
pub mod schema;
pub mod store;
pub mod test_utils;

// Re-export commonly used types
pub use config::Config;
pub use engine::{IngestionEngine, RunSummary};
pub use error::{DecodeError, Disposition, KafkaError, SchemaError, StoreError};
pub use error::{Error, Result};
