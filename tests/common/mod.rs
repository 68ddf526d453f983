#![allow(dead_code)]

use pg_outbox::config::{Config, OutboxConfig, PostgresConfig, ProducerConfig, ReplicationConfig};
use pg_outbox::postgres::{ReplicationConnection, ReplicationTransport};
use pg_outbox::producer::OutboxWriter;
use pg_outbox::{Delivery, MessageSink, Result};
use std::env;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

// Concurrent `create table if not exists` can race on pg_type; tests in this
// binary bootstrap the schema one at a time.
static SCHEMA_LOCK: Mutex<()> = Mutex::const_new(());

/// Get test configuration from environment variables
///
/// Slot and publication names are unique per test and process so tests can
/// share one server.
pub fn get_test_config(test_name: &str) -> Config {
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "test".to_string()),
        connect_timeout_secs: 10,
    };

    let outbox = OutboxConfig {
        publication: format!("test_pub_{}_{}", test_name, std::process::id()),
        slot_name: format!("test_slot_{}_{}", test_name, std::process::id()),
        prefix: "outbox".to_string(),
    };

    let replication = ReplicationConfig {
        keepalive_interval_secs: 1,
        create_slot: true,
        report_every: 1,
    };

    let producer = ProducerConfig {
        simulated_users: 10,
        report_every: 1,
        ensure_schema: true,
    };

    Config {
        postgres,
        outbox,
        replication,
        producer,
    }
}

/// Connects a writer and bootstraps the users table and this test's publication.
pub async fn connect_writer(config: &Config) -> OutboxWriter {
    let writer = OutboxWriter::connect(config)
        .await
        .expect("producer connection");
    let _guard = SCHEMA_LOCK.lock().await;
    writer
        .ensure_schema(&config.outbox.publication)
        .await
        .expect("schema");
    writer
}

pub fn unique_id(label: &str) -> String {
    format!("{}-{}", label, std::process::id())
}

/// Forwards every delivery to a test task.
pub struct ChannelSink(pub mpsc::UnboundedSender<Delivery>);

impl MessageSink for ChannelSink {
    fn deliver(&mut self, delivery: Delivery) -> Result<()> {
        // The receiver may already be gone while the session shuts down.
        let _ = self.0.send(delivery);
        Ok(())
    }
}

/// Waits for the delivery with `id`, collecting everything seen before it.
pub async fn wait_for_id(
    rx: &mut mpsc::UnboundedReceiver<Delivery>,
    id: &str,
    within: Duration,
) -> Vec<Delivery> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let delivery = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for message {}", id))
            .expect("session stopped before the message arrived");
        let found = delivery.message.id == id;
        seen.push(delivery);
        if found {
            return seen;
        }
    }
}

pub async fn cleanup(config: &Config) {
    if let Ok(mut connection) = ReplicationConnection::connect(&config.postgres).await {
        let _ = connection.drop_replication_slot(&config.outbox.slot_name).await;
        let _ = connection.close().await;
    }

    if let Ok((client, connection)) = config
        .producer_config()
        .connect(tokio_postgres::NoTls)
        .await
    {
        tokio::spawn(connection);
        let _ = client
            .batch_execute(&format!(
                "drop publication if exists {}",
                config.outbox.publication
            ))
            .await;
    }
}
