//! Error types for k2ch core library.
//!
//! Uses hierarchical domain-specific errors following the thiserror pattern.
//! Every error maps to a [`Disposition`], which is the single place that
//! decides whether the ingestion loop keeps going, drops data, or stops.

use thiserror::Error;

/// Result type alias for k2ch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for k2ch.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka-related error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Schema inference error
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// ClickHouse-related error
    #[error("ClickHouse error: {0}")]
    Store(#[from] StoreError),

    /// Message decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Kafka-specific errors.
#[derive(Error, Debug)]
pub enum KafkaError {
    /// Failed to connect to broker
    #[error("Connection failed to {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Topic has no partitions (or does not exist)
    #[error("No partitions found for topic {0}")]
    NoPartitions(String),

    /// Partition assignment error
    #[error("Partition assignment error: {0}")]
    PartitionAssignment(String),

    /// Poll failed, the consumer is still usable
    #[error("Poll failed: {0}")]
    Poll(String),

    /// librdkafka reported a fatal error, the consumer is unusable
    #[error("Fatal consumer error: {0}")]
    Fatal(String),
}

/// Schema inference errors.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The sample stream ended without a single usable message
    #[error("No valid message found for schema inference")]
    NoValidSample,

    /// Inference produced no columns
    #[error("Inferred schema is empty")]
    Empty,

    /// Two columns share a name
    #[error("Duplicate column name: {0}")]
    DuplicateColumn(String),

    /// The ORDER BY column is absent from the inferred schema
    #[error("Ordering column `{0}` is not present in the inferred schema")]
    MissingOrderColumn(String),

    /// The destination table could not be created
    #[error("Failed to provision table {table}: {message}")]
    ProvisionFailed { table: String, message: String },
}

/// ClickHouse errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection failed at startup
    #[error("Connection failed to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Server rejected the statement
    #[error("Query failed (HTTP {status}): {message}")]
    QueryFailed { status: u16, message: String },

    /// Transport-level failure
    #[error("Request failed: {0}")]
    Request(String),

    /// Operation exceeded the configured timeout
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Insert failed for a batch
    #[error("Insert of {rows} rows into {table} failed: {message}")]
    InsertFailed {
        table: String,
        rows: usize,
        message: String,
    },

    /// Response could not be parsed
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Per-message decode errors.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Payload is not UTF-8
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Payload is not JSON
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// Payload is JSON but not an object
    #[error("Expected a JSON object, found {0}")]
    NotAnObject(&'static str),
}

/// What the ingestion loop does with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Log and move on to the next poll cycle
    Continue,
    /// Log and skip the offending message
    DropMessage,
    /// Log and discard the current batch
    DropBatch,
    /// Stop the pipeline
    Abort,
}

impl Error {
    /// Policy table mapping each error kind to the loop's reaction.
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::Decode(_) => Disposition::DropMessage,
            Error::Store(StoreError::InsertFailed { .. }) => Disposition::DropBatch,
            Error::Store(StoreError::ConnectionFailed { .. }) => Disposition::Abort,
            Error::Store(_) => Disposition::Continue,
            Error::Kafka(KafkaError::Poll(_)) => Disposition::Continue,
            Error::Kafka(_) => Disposition::Abort,
            Error::Config(_) | Error::Schema(_) => Disposition::Abort,
            Error::Io(_) | Error::Serialization(_) => Disposition::Continue,
        }
    }

    /// Whether this error should stop the pipeline.
    pub fn is_fatal(&self) -> bool {
        self.disposition() == Disposition::Abort
    }
}

// Conversion implementations for external error types

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
