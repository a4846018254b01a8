//! Configuration structures for k2ch.
//!
//! Configuration is loaded from an optional TOML file and then overridden by
//! environment variables, which is how the service is normally deployed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Logical name of this pipeline, used in logs
    #[serde(default = "default_connection_name")]
    pub connection_name: String,

    /// Kafka configuration
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// ClickHouse configuration
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    /// Batching configuration
    #[serde(default)]
    pub batch: BatchConfig,

    /// Schema inference configuration
    #[serde(default)]
    pub schema: SchemaConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection_name: default_connection_name(),
            kafka: KafkaConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            batch: BatchConfig::default(),
            schema: SchemaConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// Kafka consumer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,

    /// Topic to consume from
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Group id handed to librdkafka. Partitions are assigned manually and
    /// offsets are never committed, so this only labels the client.
    pub consumer_group: Option<String>,

    /// Upper bound on a single poll call in milliseconds
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Maximum messages returned by one poll call
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,

    /// Security configuration
    #[serde(default)]
    pub security: KafkaSecurityConfig,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            topic: default_topic(),
            consumer_group: None,
            poll_timeout_ms: default_poll_timeout_ms(),
            max_poll_records: default_max_poll_records(),
            security: KafkaSecurityConfig::default(),
        }
    }
}

impl KafkaConfig {
    /// Poll timeout as a duration.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Kafka security configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaSecurityConfig {
    /// Security protocol (PLAINTEXT, SSL, SASL_SSL, SASL_PLAINTEXT)
    pub protocol: Option<String>,

    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512)
    pub sasl_mechanism: Option<String>,

    /// SASL username
    pub sasl_username: Option<String>,

    /// SASL password
    pub sasl_password: Option<String>,

    /// SSL CA certificate location
    pub ssl_ca_location: Option<PathBuf>,

    /// Verify the broker hostname against its certificate
    #[serde(default)]
    pub ssl_check_hostname: bool,
}

impl Default for KafkaSecurityConfig {
    fn default() -> Self {
        Self {
            protocol: Some("SASL_SSL".to_string()),
            sasl_mechanism: Some("PLAIN".to_string()),
            sasl_username: Some("admin".to_string()),
            sasl_password: None,
            ssl_ca_location: Some(PathBuf::from("/opt/kafka-consumer/config/ca-cert.pem")),
            ssl_check_hostname: false,
        }
    }
}

/// ClickHouse connection and table configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClickHouseConfig {
    /// Host name, or a full `http(s)://host:port` URL
    #[serde(default = "default_clickhouse_host")]
    pub host: String,

    /// HTTP interface port
    #[serde(default = "default_clickhouse_port")]
    pub port: u16,

    /// Use HTTPS
    #[serde(default)]
    pub secure: bool,

    /// Database holding the destination table
    #[serde(default = "default_database")]
    pub database: String,

    /// Username
    #[serde(default = "default_clickhouse_user")]
    pub user: String,

    /// Password
    #[serde(default)]
    pub password: String,

    /// Timeout applied to every statement (DDL, DESC, INSERT)
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// What to do when a batch insert fails
    #[serde(default)]
    pub insert_failure_policy: InsertFailurePolicy,

    /// Retries per batch when the policy is `retry`
    #[serde(default = "default_insert_max_retries")]
    pub insert_max_retries: u32,

    /// Table engine used when provisioning
    #[serde(default = "default_table_engine")]
    pub table_engine: String,

    /// ORDER BY column used when provisioning
    #[serde(default = "default_order_by")]
    pub order_by: String,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            host: default_clickhouse_host(),
            port: default_clickhouse_port(),
            secure: false,
            database: default_database(),
            user: default_clickhouse_user(),
            password: String::new(),
            request_timeout_seconds: default_request_timeout_seconds(),
            insert_failure_policy: InsertFailurePolicy::default(),
            insert_max_retries: default_insert_max_retries(),
            table_engine: default_table_engine(),
            order_by: default_order_by(),
        }
    }
}

impl ClickHouseConfig {
    /// Base URL of the HTTP interface.
    pub fn url(&self) -> String {
        if self.host.contains("://") {
            return self.host.trim_end_matches('/').to_string();
        }
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Statement timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Policy for a batch whose insert failed.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InsertFailurePolicy {
    /// Log the failure and discard the batch
    #[default]
    Drop,
    /// Retry with exponential backoff, then discard
    Retry,
}

impl FromStr for InsertFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "retry" => Ok(Self::Retry),
            other => Err(format!("unknown insert failure policy `{}`", other)),
        }
    }
}

/// Batching configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    /// Rows per batch before a size-triggered flush
    #[serde(default = "default_batch_size")]
    pub size: usize,

    /// Seconds a batch may wait before a time-triggered flush
    #[serde(default = "default_batch_timeout_seconds")]
    pub timeout_seconds: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            timeout_seconds: default_batch_timeout_seconds(),
        }
    }
}

impl BatchConfig {
    /// Batch timeout as a duration, saturating for values too large to hold.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Schema inference configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaConfig {
    /// Where column types come from
    #[serde(default)]
    pub inference: InferenceMode,

    /// The sample stream counts as exhausted after this long without messages
    #[serde(default = "default_sample_idle_ms")]
    pub sample_idle_ms: u64,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            inference: InferenceMode::default(),
            sample_idle_ms: default_sample_idle_ms(),
        }
    }
}

impl SchemaConfig {
    /// Sample idle timeout as a duration.
    pub fn sample_idle(&self) -> Duration {
        Duration::from_millis(self.sample_idle_ms)
    }
}

/// Schema inference backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InferenceMode {
    /// Ask ClickHouse to describe the sample
    #[default]
    Store,
    /// Map JSON value kinds to ClickHouse types in-process
    Local,
}

impl FromStr for InferenceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "store" | "clickhouse" => Ok(Self::Store),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown schema inference mode `{}`", other)),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    /// Health and metrics HTTP port, 0 disables the server
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_port: default_health_port(),
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log level.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level (default)
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (default)
    #[default]
    Json,
    /// Plain text format
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "plain" => Ok(Self::Text),
            other => Err(format!("unknown log format `{}`", other)),
        }
    }
}

// Default value functions
fn default_connection_name() -> String {
    "unknown".to_string()
}
fn default_bootstrap_servers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}
fn default_topic() -> String {
    "user_events".to_string()
}
fn default_poll_timeout_ms() -> u64 {
    100
}
fn default_max_poll_records() -> usize {
    500
}
fn default_clickhouse_host() -> String {
    "localhost".to_string()
}
fn default_clickhouse_port() -> u16 {
    8123
}
fn default_database() -> String {
    "default".to_string()
}
fn default_clickhouse_user() -> String {
    "default".to_string()
}
fn default_request_timeout_seconds() -> u64 {
    30
}
fn default_insert_max_retries() -> u32 {
    3
}
fn default_table_engine() -> String {
    "MergeTree".to_string()
}
fn default_order_by() -> String {
    "timestamp".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_timeout_seconds() -> f64 {
    1.0
}
fn default_sample_idle_ms() -> u64 {
    5000
}
fn default_health_port() -> u16 {
    8080
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| crate::Error::Config(format!("{}={:?}: {}", name, value, e)))
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the optional file, then apply process environment overrides.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> crate::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CONNECTION_NAME") {
            self.connection_name = v;
        }

        if let Some(v) = lookup("KAFKA_BROKER") {
            self.kafka.bootstrap_servers = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("KAFKA_TOPIC") {
            self.kafka.topic = v;
        }
        if let Some(v) = lookup("KAFKA_USERNAME") {
            self.kafka.security.sasl_username = Some(v);
        }
        if let Some(v) = lookup("KAFKA_PASSWORD") {
            self.kafka.security.sasl_password = Some(v);
        }
        if let Some(v) = lookup("CA_CERT_FILE") {
            self.kafka.security.ssl_ca_location = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KAFKA_SECURITY_PROTOCOL") {
            self.kafka.security.protocol = Some(v);
        }
        if let Some(v) = lookup("KAFKA_SASL_MECHANISM") {
            self.kafka.security.sasl_mechanism = Some(v);
        }
        if let Some(v) = lookup("POLL_TIMEOUT_MS") {
            self.kafka.poll_timeout_ms = parse_var("POLL_TIMEOUT_MS", &v)?;
        }

        if let Some(v) = lookup("CLICKHOUSE_HOST") {
            self.clickhouse.host = v;
        }
        if let Some(v) = lookup("CLICKHOUSE_PORT") {
            self.clickhouse.port = parse_var("CLICKHOUSE_PORT", &v)?;
        }
        if let Some(v) = lookup("CLICKHOUSE_DB") {
            self.clickhouse.database = v;
        }
        if let Some(v) = lookup("CLICKHOUSE_USER") {
            self.clickhouse.user = v;
        }
        if let Some(v) = lookup("CLICKHOUSE_PASS") {
            self.clickhouse.password = v;
        }
        if let Some(v) = lookup("STORE_TIMEOUT_SECS") {
            self.clickhouse.request_timeout_seconds = parse_var("STORE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("INSERT_FAILURE_POLICY") {
            self.clickhouse.insert_failure_policy = parse_var("INSERT_FAILURE_POLICY", &v)?;
        }
        if let Some(v) = lookup("INSERT_MAX_RETRIES") {
            self.clickhouse.insert_max_retries = parse_var("INSERT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("TABLE_ENGINE") {
            self.clickhouse.table_engine = v;
        }
        if let Some(v) = lookup("ORDER_BY_COLUMN") {
            self.clickhouse.order_by = v;
        }

        if let Some(v) = lookup("BATCH_SIZE") {
            self.batch.size = parse_var("BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("BATCH_TIMEOUT") {
            self.batch.timeout_seconds = parse_var("BATCH_TIMEOUT", &v)?;
        }

        if let Some(v) = lookup("SCHEMA_INFERENCE") {
            self.schema.inference = parse_var("SCHEMA_INFERENCE", &v)?;
        }
        if let Some(v) = lookup("SCHEMA_SAMPLE_IDLE_MS") {
            self.schema.sample_idle_ms = parse_var("SCHEMA_SAMPLE_IDLE_MS", &v)?;
        }

        if let Some(v) = lookup("LOG_FORMAT") {
            self.monitoring.log_format = parse_var("LOG_FORMAT", &v)?;
        }
        if let Some(v) = lookup("HEALTH_PORT") {
            self.monitoring.health_port = parse_var("HEALTH_PORT", &v)?;
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        let password_missing = self
            .kafka
            .security
            .sasl_password
            .as_deref()
            .map_or(true, str::is_empty);
        if password_missing {
            return Err(crate::Error::Config(
                "KAFKA_PASSWORD environment variable is required".into(),
            ));
        }

        if self.kafka.bootstrap_servers.is_empty() {
            return Err(crate::Error::Config(
                "At least one bootstrap server required".into(),
            ));
        }

        if self.kafka.topic.is_empty() {
            return Err(crate::Error::Config("Kafka topic is required".into()));
        }

        if self.clickhouse.database.is_empty() {
            return Err(crate::Error::Config("ClickHouse database is required".into()));
        }

        if self.batch.size == 0 {
            return Err(crate::Error::Config("Batch size must be at least 1".into()));
        }

        if !(self.batch.timeout_seconds.is_finite() && self.batch.timeout_seconds > 0.0) {
            return Err(crate::Error::Config(
                "Batch timeout must be a positive number of seconds".into(),
            ));
        }
        if let Err(e) = Duration::try_from_secs_f64(self.batch.timeout_seconds) {
            return Err(crate::Error::Config(format!(
                "Batch timeout {}s is out of range: {}",
                self.batch.timeout_seconds, e
            )));
        }

        if self.kafka.poll_timeout_ms == 0 {
            return Err(crate::Error::Config("Poll timeout must be positive".into()));
        }

        if self.kafka.poll_timeout() > self.batch.timeout() {
            tracing::warn!(
                poll_timeout_ms = self.kafka.poll_timeout_ms,
                batch_timeout_s = self.batch.timeout_seconds,
                "Poll timeout exceeds batch timeout, time-triggered flushes will run late"
            );
        }

        Ok(())
    }

    /// Group id used for the librdkafka client.
    pub fn consumer_group(&self) -> String {
        self.kafka
            .consumer_group
            .clone()
            .unwrap_or_else(|| format!("k2ch-{}", self.connection_name))
    }
}
