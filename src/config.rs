use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Environment variable prefix; nested keys use `__`, e.g. `PG_OUTBOX_POSTGRES__HOST`.
pub const ENV_PREFIX: &str = "PG_OUTBOX";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub outbox: OutboxConfig,
    pub replication: ReplicationConfig,
    pub producer: ProducerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub connect_timeout_secs: u64,
}

/// Names shared by the producer and the consumer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub publication: String,
    pub slot_name: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub keepalive_interval_secs: u64,
    pub create_slot: bool,
    pub report_every: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub simulated_users: u32,
    pub report_every: u64,
    pub ensure_schema: bool,
}

impl Config {
    /// Layers the optional file under the environment and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication.keepalive_interval_secs == 0 {
            return Err(Error::Config(
                "replication.keepalive_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.producer.simulated_users == 0 {
            return Err(Error::Config(
                "producer.simulated_users must be greater than zero".to_string(),
            ));
        }
        for (key, value) in [
            ("outbox.publication", &self.outbox.publication),
            ("outbox.slot_name", &self.outbox.slot_name),
            ("outbox.prefix", &self.outbox.prefix),
        ] {
            if !is_identifier(value) {
                return Err(Error::Config(format!(
                    "{} must be a non-empty identifier of [a-z0-9_], got '{}'",
                    key, value
                )));
            }
        }
        Ok(())
    }

    /// Client configuration for the producer's regular connection.
    pub fn producer_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.postgres.host)
            .port(self.postgres.port)
            .user(&self.postgres.username)
            .password(&self.postgres.password)
            .dbname(&self.postgres.database)
            .connect_timeout(Duration::from_secs(self.postgres.connect_timeout_secs))
            .application_name("pg-outbox-producer");
        pg
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.replication.keepalive_interval_secs)
    }
}

// Slot, publication and prefix names end up inside replication commands.
fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            username: "postgres".to_string(),
            password: "test".to_string(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            publication: "outbox_publication".to_string(),
            slot_name: "outbox_slot".to_string(),
            prefix: "outbox".to_string(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive_interval_secs(),
            create_slot: true,
            report_every: default_report_every(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            simulated_users: 100_000,
            report_every: default_report_every(),
            ensure_schema: true,
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive_interval_secs() -> u64 {
    5
}

fn default_report_every() -> u64 {
    10_000
}
