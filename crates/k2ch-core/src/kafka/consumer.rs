//! Kafka consumer with manual partition assignment.
//!
//! The pipeline owns the whole topic: every partition is discovered from
//! broker metadata and assigned explicitly, so there is no consumer-group
//! rebalancing and no offset commits. Consumption always starts from the
//! earliest available offset (at-least-once, replay on restart).

use crate::config::{Config, KafkaConfig};
use crate::kafka::{MessageSource, PollBatch, RawMessage};
use crate::{Error, KafkaError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError as RdKafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long partition discovery may take before startup fails.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Kafka-backed [`MessageSource`].
pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
    partitions: Vec<i32>,
    max_poll_records: usize,
}

impl KafkaSource {
    /// Connect, discover partitions and assign all of them from the beginning.
    ///
    /// Every failure here is fatal: a missing broker or an empty topic is a
    /// configuration problem, not something a retry fixes.
    pub fn connect(config: &Config) -> Result<Self> {
        let kafka = &config.kafka;
        let client_config = Self::client_config(kafka, &config.consumer_group());

        let consumer: StreamConsumer = client_config.create().map_err(|e| {
            Error::Kafka(KafkaError::ConnectionFailed {
                broker: kafka.bootstrap_servers.join(","),
                message: e.to_string(),
            })
        })?;

        let partitions = Self::discover_partitions(&consumer, kafka)?;

        let source = Self {
            consumer,
            topic: kafka.topic.clone(),
            partitions,
            max_poll_records: kafka.max_poll_records.max(1),
        };
        source.assign_from_beginning()?;

        info!(
            topic = %source.topic,
            partitions = ?source.partitions,
            servers = %kafka.bootstrap_servers.join(","),
            "Kafka partitions assigned"
        );

        Ok(source)
    }

    fn client_config(kafka: &KafkaConfig, group_id: &str) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", kafka.bootstrap_servers.join(","))
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false");

        let security = &kafka.security;
        if let Some(ref protocol) = security.protocol {
            client_config.set("security.protocol", protocol);
        }
        if let Some(ref mechanism) = security.sasl_mechanism {
            client_config.set("sasl.mechanism", mechanism);
        }
        if let Some(ref username) = security.sasl_username {
            client_config.set("sasl.username", username);
        }
        if let Some(ref password) = security.sasl_password {
            client_config.set("sasl.password", password);
        }
        if let Some(ref path) = security.ssl_ca_location {
            client_config.set("ssl.ca.location", path.to_string_lossy().as_ref());
        }
        if !security.ssl_check_hostname {
            client_config.set("ssl.endpoint.identification.algorithm", "none");
        }

        client_config
    }

    fn discover_partitions(consumer: &StreamConsumer, kafka: &KafkaConfig) -> Result<Vec<i32>> {
        let metadata = consumer
            .fetch_metadata(Some(&kafka.topic), METADATA_TIMEOUT)
            .map_err(|e| {
                Error::Kafka(KafkaError::ConnectionFailed {
                    broker: kafka.bootstrap_servers.join(","),
                    message: e.to_string(),
                })
            })?;

        let mut partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|t| t.name() == kafka.topic)
            .flat_map(|t| t.partitions().iter().map(|p| p.id()))
            .collect();
        partitions.sort_unstable();
        partitions.dedup();

        if partitions.is_empty() {
            return Err(Error::Kafka(KafkaError::NoPartitions(kafka.topic.clone())));
        }

        Ok(partitions)
    }

    fn assign_from_beginning(&self) -> Result<()> {
        let mut tpl = TopicPartitionList::with_capacity(self.partitions.len());
        for &partition in &self.partitions {
            tpl.add_partition_offset(&self.topic, partition, Offset::Beginning)
                .map_err(|e| Error::Kafka(KafkaError::PartitionAssignment(e.to_string())))?;
        }

        self.consumer
            .assign(&tpl)
            .map_err(|e| Error::Kafka(KafkaError::PartitionAssignment(e.to_string())))
    }

    /// Convert a borrowed message to an owned RawMessage.
    fn convert_message(msg: &BorrowedMessage) -> RawMessage {
        RawMessage {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            timestamp: msg.timestamp().to_millis(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|v| v.to_vec()),
        }
    }

    fn classify(err: RdKafkaError) -> KafkaError {
        match err.rdkafka_error_code() {
            Some(RDKafkaErrorCode::Fatal) => KafkaError::Fatal(err.to_string()),
            _ => KafkaError::Poll(err.to_string()),
        }
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partitions(&self) -> &[i32] {
        &self.partitions
    }

    async fn poll(&mut self, timeout: Duration) -> Result<PollBatch> {
        let mut batch = PollBatch::new();
        let deadline = tokio::time::Instant::now() + timeout;
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        while batch.len() < self.max_poll_records {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(Ok(msg))) => batch.push(Self::convert_message(&msg)),
                Ok(Some(Err(e))) => {
                    let err = Self::classify(e);
                    if batch.is_empty() {
                        return Err(Error::Kafka(err));
                    }
                    // Already-consumed messages must not be lost to a late error.
                    warn!(error = %err, received = batch.len(), "Poll interrupted by error");
                    break;
                }
                Ok(None) | Err(_) => break,
            }
        }

        if !batch.is_empty() {
            debug!(messages = batch.len(), "Poll returned messages");
        }

        Ok(batch)
    }

    fn rewind(&mut self) -> Result<()> {
        self.assign_from_beginning()?;
        info!(topic = %self.topic, "Rewound all partitions to the earliest offset");
        Ok(())
    }
}
