//! Integration tests for k2ch-core.
//!
//! The `pipeline` tests drive the whole engine against in-memory adapters
//! under paused tokio time. The `kafka_integration` tests require Docker and
//! are marked with #[ignore] to avoid running them in normal test runs.
//!
//! Run the Docker tests with: cargo test --test integration_tests -- --ignored

use k2ch_core::buffer::FlushReason;
use k2ch_core::config::{Config, InferenceMode, InsertFailurePolicy};
use k2ch_core::health::{HealthStatus, CLICKHOUSE};
use k2ch_core::test_utils::{MemoryStore, MemoryTopic};
use k2ch_core::{Error, IngestionEngine, KafkaError, Result, RunSummary, SchemaError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

fn event(id: i64) -> String {
    format!(
        r#"{{"id": {}, "timestamp": "2024-01-01T00:00:{:02}Z", "name": "user-{}"}}"#,
        id,
        id % 60,
        id
    )
}

fn config(batch_size: usize, timeout_seconds: f64) -> Config {
    let mut config = Config::default();
    config.kafka.security.sasl_password = Some("secret".into());
    config.batch.size = batch_size;
    config.batch.timeout_seconds = timeout_seconds;
    config
}

struct Running {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<Result<RunSummary>>,
}

impl Running {
    async fn stop(self) -> Result<RunSummary> {
        let _ = self.shutdown.send(());
        self.handle.await.expect("engine task panicked")
    }
}

async fn start(config: Config, topic: &MemoryTopic, store: &MemoryStore) -> Running {
    let mut engine =
        IngestionEngine::bootstrap(config, Box::new(topic.source()), Arc::new(store.clone()))
            .await
            .expect("bootstrap failed");
    let shutdown = engine.shutdown_signal();
    let handle = tokio::spawn(async move { engine.run().await });
    Running { shutdown, handle }
}

mod pipeline {
    use super::*;

    /// Sample, size flush of two rows, then a timeout flush of the third.
    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_user_events() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, r#"{"id": 1, "timestamp": "2024-01-01T00:00:00Z", "name": "a"}"#);
        topic.produce(0, r#"{"id": 2, "timestamp": "2024-01-01T00:00:01Z", "name": "b"}"#);
        topic.produce(0, r#"{"id": 3, "timestamp": "2024-01-01T00:00:02Z", "name": "c"}"#);
        let store = MemoryStore::new();

        let running = start(config(2, 1.0), &topic, &store).await;

        assert_eq!(store.tables(), vec!["default.user_events".to_string()]);
        let ddl = &store.executed()[0];
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS `default`.`user_events`"));
        assert!(ddl.ends_with("ORDER BY (`timestamp`)"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        let inserts = store.inserts();
        assert_eq!(inserts.len(), 1, "size flush expected before the timeout");
        assert_eq!(inserts[0].table, "default.user_events");
        assert_eq!(inserts[0].columns, vec!["id", "timestamp", "name"]);
        assert_eq!(inserts[0].column("id"), vec![json!(1), json!(2)]);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let inserts = store.inserts();
        assert_eq!(inserts.len(), 2, "timeout flush expected");
        assert_eq!(inserts[1].column("id"), vec![json!(3)]);

        let summary = running.stop().await.unwrap();
        assert_eq!(summary.messages_seen, 3);
        assert_eq!(summary.flushes, 2);
        assert_eq!(summary.rows_flushed, 3);
        assert_eq!(store.inserts().len(), 2, "nothing left to drain");
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_flushes_exactly_once() {
        let topic = MemoryTopic::new("user_events", 1);
        for id in 0..100 {
            topic.produce(0, event(id));
        }
        let store = MemoryStore::new();

        let running = start(config(100, 60.0), &topic, &store).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let inserts = store.inserts();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].rows.len(), 100);
        let offsets: Vec<i64> = inserts[0].offsets.iter().map(|(_, o)| *o).collect();
        assert_eq!(offsets, (0..100).collect::<Vec<_>>());

        let summary = running.stop().await.unwrap();
        assert_eq!(summary.flushes, 1, "batch must be empty after the size flush");
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_trigger_flushes_single_row() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, event(1));
        let store = MemoryStore::new();

        let running = start(config(100, 1.0), &topic, &store).await;

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(store.inserts().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let inserts = store.inserts();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].rows.len(), 1);

        running.stop().await.unwrap();
        assert_eq!(store.inserts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_messages_are_skipped() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, event(1));
        topic.produce(0, "{not json");
        topic.produce(0, "[1, 2, 3]");
        topic.produce(0, vec![0xff, 0x00, 0xfe]);
        topic.produce(0, event(2));
        let store = MemoryStore::new();

        let running = start(config(100, 60.0), &topic, &store).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        let summary = running.stop().await.unwrap();

        let inserts = store.inserts();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].column("id"), vec![json!(1), json!(2)]);
        assert_eq!(inserts[0].offsets, vec![(0, 0), (0, 4)]);
        assert_eq!(summary.messages_seen, 5);
        assert_eq!(summary.decode_errors, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_keys_project_to_null() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, event(1));
        topic.produce(0, r#"{"timestamp": "2024-01-01T00:00:00Z", "extra": 1}"#);
        topic.produce_tombstone(0);
        let store = MemoryStore::new();

        let running = start(config(3, 60.0), &topic, &store).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        running.stop().await.unwrap();

        let inserts = store.inserts();
        assert_eq!(inserts.len(), 1);
        assert_eq!(
            inserts[0].rows[1],
            vec![json!(null), json!("2024-01-01T00:00:00Z"), json!(null)]
        );
        assert_eq!(inserts[0].rows[2], vec![json!(null); 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_partial_batch() {
        let topic = MemoryTopic::new("user_events", 2);
        topic.produce(0, event(1));
        topic.produce(1, event(2));
        topic.produce(0, event(3));
        let store = MemoryStore::new();

        let mut engine =
            IngestionEngine::bootstrap(config(100, 60.0), Box::new(topic.source()), Arc::new(store.clone()))
                .await
                .unwrap();
        let metrics = engine.metrics();
        let shutdown = engine.shutdown_signal();
        let handle = tokio::spawn(async move { engine.run().await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.inserts().is_empty());

        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();

        let inserts = store.inserts();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].rows.len(), 3);
        assert_eq!(metrics.flushes(FlushReason::Drain), 1);
        assert_eq!(metrics.snapshot().rows_buffered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_messages_are_picked_up() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, event(1));
        let store = MemoryStore::new();

        let running = start(config(2, 1.0), &topic, &store).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        topic.produce(0, event(2));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.inserts().len(), 1);

        topic.produce(0, event(3));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        running.stop().await.unwrap();

        let inserts = store.inserts();
        assert_eq!(inserts.len(), 2);
        assert_eq!(inserts[1].column("id"), vec![json!(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_failure_drops_batch_and_continues() {
        let topic = MemoryTopic::new("user_events", 1);
        for id in 1..=4 {
            topic.produce(0, event(id));
        }
        let store = MemoryStore::new();
        store.fail_next_inserts(1);

        let mut engine =
            IngestionEngine::bootstrap(config(2, 60.0), Box::new(topic.source()), Arc::new(store.clone()))
                .await
                .unwrap();
        let health = engine.health();
        let shutdown = engine.shutdown_signal();
        let handle = tokio::spawn(async move { engine.run().await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown.send(()).unwrap();
        let summary = handle.await.unwrap().unwrap();

        let inserts = store.inserts();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].column("id"), vec![json!(3), json!(4)]);
        assert_eq!(store.insert_attempts(), 2);
        assert_eq!(summary.rows_dropped, 2);
        assert_eq!(summary.rows_flushed, 2);
        // A later successful insert clears the degraded mark.
        assert_eq!(health.overall_status(), HealthStatus::Healthy);
        assert!(health.get_component_status(CLICKHOUSE).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_retry_policy_recovers() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, event(1));
        topic.produce(0, event(2));
        let store = MemoryStore::new();
        store.fail_next_inserts(2);

        let mut config = config(2, 60.0);
        config.clickhouse.insert_failure_policy = InsertFailurePolicy::Retry;
        config.clickhouse.insert_max_retries = 3;

        let running = start(config, &topic, &store).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let summary = running.stop().await.unwrap();

        assert_eq!(store.insert_attempts(), 3);
        assert_eq!(store.inserts().len(), 1);
        assert_eq!(summary.rows_dropped, 0);
        assert_eq!(summary.rows_flushed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_retry_policy_gives_up() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, event(1));
        topic.produce(0, event(2));
        let store = MemoryStore::new();
        store.fail_next_inserts(10);

        let mut config = config(2, 60.0);
        config.clickhouse.insert_failure_policy = InsertFailurePolicy::Retry;
        config.clickhouse.insert_max_retries = 2;

        let running = start(config, &topic, &store).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        let summary = running.stop().await.unwrap();

        assert_eq!(store.insert_attempts(), 3);
        assert!(store.inserts().is_empty());
        assert_eq!(summary.rows_dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_insert_is_bounded_by_store_timeout() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, event(1));
        let store = MemoryStore::new();
        store.set_insert_delay(Duration::from_secs(120));

        let mut config = config(1, 60.0);
        config.clickhouse.request_timeout_seconds = 2;

        let running = start(config, &topic, &store).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        let summary = running.stop().await.unwrap();

        assert!(store.inserts().is_empty());
        assert_eq!(summary.rows_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_poll_errors_back_off_and_continue() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, event(1));
        let store = MemoryStore::new();
        let source = topic.source();
        let failures = source.failure_handle();

        let mut engine =
            IngestionEngine::bootstrap(config(2, 60.0), Box::new(source), Arc::new(store.clone()))
                .await
                .unwrap();
        for _ in 0..3 {
            failures.fail_next(KafkaError::Poll("broker transport failure".into()));
        }
        let metrics = engine.metrics();
        let shutdown = engine.shutdown_signal();
        let handle = tokio::spawn(async move { engine.run().await });

        topic.produce(0, event(2));
        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(metrics.snapshot().poll_errors_total, 3);
        assert_eq!(store.inserts().len(), 1);
        assert_eq!(store.inserts()[0].rows.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_is_idempotent_across_restarts() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, event(1));
        let store = MemoryStore::new();

        for _ in 0..2 {
            let running = start(config(10, 1.0), &topic, &store).await;
            tokio::time::sleep(Duration::from_millis(1500)).await;
            running.stop().await.unwrap();
        }

        assert_eq!(store.executed().len(), 2);
        assert_eq!(store.tables(), vec!["default.user_events".to_string()]);
        // Every start replays from the beginning.
        assert_eq!(store.inserts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_fails_without_valid_sample() {
        let topic = MemoryTopic::new("user_events", 1);
        topic.produce(0, "garbage");
        topic.produce(0, "\"just a string\"");
        let store = MemoryStore::new();

        let mut config = config(10, 1.0);
        config.schema.inference = InferenceMode::Local;

        let err = IngestionEngine::bootstrap(config, Box::new(topic.source()), Arc::new(store.clone()))
            .await
            .err()
            .expect("bootstrap must fail");

        assert!(matches!(err, Error::Schema(SchemaError::NoValidSample)));
        assert!(err.is_fatal());
        assert!(store.executed().is_empty());
    }
}

mod kafka_integration {
    use super::*;
    use k2ch_core::kafka::{KafkaSource, MessageSource};
    use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
    use rdkafka::client::DefaultClientContext;
    use rdkafka::config::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use testcontainers::runners::AsyncRunner;
    use testcontainers_modules::kafka::Kafka;

    fn plaintext_config(bootstrap_servers: &str, topic: &str) -> Config {
        let mut config = config(10, 1.0);
        config.kafka.bootstrap_servers = vec![bootstrap_servers.to_string()];
        config.kafka.topic = topic.to_string();
        config.kafka.security.protocol = Some("PLAINTEXT".into());
        config.kafka.security.sasl_mechanism = None;
        config.kafka.security.sasl_username = None;
        config.kafka.security.sasl_password = None;
        config.kafka.security.ssl_ca_location = None;
        config.kafka.security.ssl_check_hostname = true;
        config
    }

    /// Produce, assign all partitions, poll everything, rewind, poll again.
    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_kafka_source_reads_and_rewinds() {
        let kafka = Kafka::default()
            .start()
            .await
            .expect("Failed to start Kafka container");
        let bootstrap_servers = format!(
            "127.0.0.1:{}",
            kafka
                .get_host_port_ipv4(9093)
                .await
                .expect("Failed to get Kafka port")
        );

        let topic_name = "user.events";
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .create()
            .expect("Failed to create admin client");
        admin
            .create_topics(
                &[NewTopic::new(topic_name, 3, TopicReplication::Fixed(1))],
                &AdminOptions::new(),
            )
            .await
            .expect("Failed to create topic");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");
        for i in 0..10 {
            producer
                .send(
                    FutureRecord::to(topic_name)
                        .key(&format!("key-{}", i))
                        .payload(&event(i)),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to produce message");
        }

        let mut source = KafkaSource::connect(&plaintext_config(&bootstrap_servers, topic_name))
            .expect("Failed to connect");
        assert_eq!(source.partitions(), &[0, 1, 2]);

        let mut seen = 0;
        for _ in 0..50 {
            seen += source.poll(Duration::from_millis(200)).await.unwrap().len();
            if seen == 10 {
                break;
            }
        }
        assert_eq!(seen, 10);

        source.rewind().unwrap();
        let mut replayed = 0;
        for _ in 0..50 {
            replayed += source.poll(Duration::from_millis(200)).await.unwrap().len();
            if replayed == 10 {
                break;
            }
        }
        assert_eq!(replayed, 10);
    }

    /// A topic without partitions is a fatal configuration error.
    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_missing_topic_has_no_partitions() {
        let kafka = Kafka::default()
            .start()
            .await
            .expect("Failed to start Kafka container");
        let bootstrap_servers = format!(
            "127.0.0.1:{}",
            kafka
                .get_host_port_ipv4(9093)
                .await
                .expect("Failed to get Kafka port")
        );

        let mut config = plaintext_config(&bootstrap_servers, "does-not-exist");
        config.kafka.consumer_group = Some("k2ch-it".into());

        match KafkaSource::connect(&config) {
            Err(err) => {
                assert!(matches!(err, Error::Kafka(KafkaError::NoPartitions(_))));
                assert!(err.is_fatal());
            }
            Ok(_) => panic!("expected no partitions for a missing topic"),
        }
    }
}
