//! Sample-based schema inference.
//!
//! The inferrer peeks at the topic: it polls until one message decodes and
//! yields a usable schema, then rewinds every partition to the earliest
//! offset so steady-state consumption still sees that message.

use super::{infer_columns, Schema};
use crate::config::{Config, InferenceMode};
use crate::decode::decode_object;
use crate::kafka::MessageSource;
use crate::store::StoreClient;
use crate::{Error, Result, SchemaError, StoreError};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Derives the table schema from the first usable message on the topic.
#[derive(Debug, Clone)]
pub struct SchemaInferrer {
    mode: InferenceMode,
    poll_timeout: Duration,
    idle_timeout: Duration,
}

impl SchemaInferrer {
    pub fn new(config: &Config) -> Self {
        Self {
            mode: config.schema.inference,
            poll_timeout: config.kafka.poll_timeout(),
            idle_timeout: config.schema.sample_idle(),
        }
    }

    /// Find a schema, then rewind the source whatever the outcome.
    ///
    /// Returns [`SchemaError::NoValidSample`] when the topic goes quiet for
    /// the idle timeout without producing a usable message.
    pub async fn infer(
        &self,
        source: &mut dyn MessageSource,
        store: &dyn StoreClient,
    ) -> Result<Schema> {
        let result = self.sample(source, store).await;

        match source.rewind() {
            Ok(()) => result,
            Err(rewind_err) => match result {
                // Without a rewind the sampled messages would be skipped.
                Ok(_) => Err(rewind_err),
                Err(e) => {
                    warn!(error = %rewind_err, "Rewind after failed inference also failed");
                    Err(e)
                }
            },
        }
    }

    async fn sample(
        &self,
        source: &mut dyn MessageSource,
        store: &dyn StoreClient,
    ) -> Result<Schema> {
        let mut last_activity = Instant::now();
        let mut examined = 0usize;

        loop {
            let batch = match source.poll(self.poll_timeout).await {
                Ok(batch) => batch,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Poll failed while sampling for schema");
                    tokio::time::sleep(self.poll_timeout).await;
                    if last_activity.elapsed() >= self.idle_timeout {
                        return Err(SchemaError::NoValidSample.into());
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if last_activity.elapsed() >= self.idle_timeout {
                    warn!(examined, "Topic exhausted without a usable schema sample");
                    return Err(SchemaError::NoValidSample.into());
                }
                continue;
            }
            last_activity = Instant::now();

            for msg in batch {
                examined += 1;

                let sample = match decode_object(msg.payload_bytes()) {
                    Ok(sample) => sample,
                    Err(e) => {
                        debug!(
                            partition = msg.partition,
                            offset = msg.offset,
                            error = %e,
                            "Skipping undecodable sample"
                        );
                        continue;
                    }
                };

                match self.schema_from_sample(&sample, store).await {
                    Ok(schema) => {
                        info!(
                            partition = msg.partition,
                            offset = msg.offset,
                            columns = schema.len(),
                            schema = %schema,
                            "Schema inferred"
                        );
                        return Ok(schema);
                    }
                    Err(e) if is_store_unavailable(&e) => return Err(e),
                    Err(e) => {
                        warn!(
                            partition = msg.partition,
                            offset = msg.offset,
                            error = %e,
                            payload = %msg.payload_preview(),
                            "Schema inference failed for sample, trying next message"
                        );
                    }
                }
            }
        }
    }

    async fn schema_from_sample(
        &self,
        sample: &Map<String, Value>,
        store: &dyn StoreClient,
    ) -> Result<Schema> {
        let columns = match self.mode {
            InferenceMode::Local => infer_columns(sample),
            InferenceMode::Store => {
                let text = serde_json::to_string(sample)?;
                store.describe_json(&text).await?
            }
        };
        Schema::new(columns)
    }
}

/// The store could not be reached at all, as opposed to rejecting the sample.
fn is_store_unavailable(err: &Error) -> bool {
    matches!(
        err,
        Error::Store(
            StoreError::ConnectionFailed { .. }
                | StoreError::Request(_)
                | StoreError::Timeout { .. }
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MemoryStore, MemoryTopic};

    fn config(mode: InferenceMode) -> Config {
        let mut config = Config::default();
        config.schema.inference = mode;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_malformed_then_rewinds() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, "not json");
        topic.produce(0, "[1, 2]");
        topic.produce(0, r#"{"id": 1, "timestamp": "2024-01-01T00:00:00Z", "name": "a"}"#);
        let mut source = topic.source();
        let store = MemoryStore::new();

        let schema = SchemaInferrer::new(&config(InferenceMode::Store))
            .infer(&mut source, &store)
            .await
            .unwrap();

        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["id", "timestamp", "name"]);
        assert_eq!(store.describe_calls(), 1);
        assert_eq!(source.rewinds(), 1);
        assert_eq!(source.position(0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_mode_skips_store() {
        let topic = MemoryTopic::new("user_events", 2);
        topic.produce(1, r#"{"id": 7, "timestamp": "2024-01-01T00:00:00Z"}"#);
        let mut source = topic.source();
        let store = MemoryStore::new();

        let schema = SchemaInferrer::new(&config(InferenceMode::Local))
            .infer(&mut source, &store)
            .await
            .unwrap();

        assert_eq!(schema.len(), 2);
        assert_eq!(store.describe_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_valid_sample_is_fatal() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, "{broken");
        topic.produce(0, "{}");
        let mut source = topic.source();
        let store = MemoryStore::new();

        let started = Instant::now();
        let err = SchemaInferrer::new(&config(InferenceMode::Store))
            .infer(&mut source, &store)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Schema(SchemaError::NoValidSample)));
        assert!(err.is_fatal());
        assert!(started.elapsed() >= Config::default().schema.sample_idle());
        assert_eq!(source.rewinds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_rejection_moves_to_next_sample() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, r#"{"a": 1}"#);
        topic.produce(0, r#"{"b": 2}"#);
        let mut source = topic.source();
        let store = MemoryStore::new();
        store.fail_next_describes(1);

        let schema = SchemaInferrer::new(&config(InferenceMode::Store))
            .infer(&mut source, &store)
            .await
            .unwrap();

        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(store.describe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_store_stops_sampling() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, r#"{"a": 1}"#);
        topic.produce(0, r#"{"b": 2}"#);
        let mut source = topic.source();
        let store = MemoryStore::new();
        store.set_unreachable(true);

        let err = SchemaInferrer::new(&config(InferenceMode::Store))
            .infer(&mut source, &store)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Store(StoreError::Request(_))));
        assert_eq!(store.describe_calls(), 1);
        assert_eq!(source.rewinds(), 1);
    }
}
