//! The two process roles and their lifecycle: connect, run until cancelled, close.

use clap::ValueEnum;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::consumer::{LatencyReporter, ReplicationSession, SessionSettings};
use crate::postgres::ReplicationConnection;
use crate::producer::{OutboxWriter, Producer};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Write users and outbox messages in a loop
    Produce,
    /// Stream outbox messages from the replication slot
    Consume,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Produce => write!(f, "produce"),
            Mode::Consume => write!(f, "consume"),
        }
    }
}

/// Runs the selected worker until `cancel` fires or it fails.
///
/// The worker is closed on both paths; a run error wins over a close error.
pub async fn run(mode: Mode, config: &Config, cancel: CancellationToken) -> Result<()> {
    info!(%mode, "Starting worker");
    match mode {
        Mode::Produce => run_producer(config, &cancel).await,
        Mode::Consume => run_consumer(config, &cancel).await,
    }
}

async fn run_producer(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let writer = OutboxWriter::connect(config).await?;
    if config.producer.ensure_schema {
        writer.ensure_schema(&config.outbox.publication).await?;
    }

    let mut producer = Producer::new(writer, config);
    let result = producer.run(cancel).await;
    let closed = producer.close().await;
    result.and(closed)
}

async fn run_consumer(config: &Config, cancel: &CancellationToken) -> Result<()> {
    let connection = ReplicationConnection::connect(&config.postgres).await?;
    let mut session = ReplicationSession::new(
        connection,
        LatencyReporter::new(config.replication.report_every),
        SessionSettings::from_config(config),
    );

    let result = session.run(cancel).await;
    let closed = session.close().await;
    result.and(closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_str() {
        assert_eq!(Mode::from_str("produce", true).unwrap(), Mode::Produce);
        assert_eq!(Mode::from_str("CONSUME", true).unwrap(), Mode::Consume);
        assert!(Mode::from_str("replay", true).is_err());
    }

    #[test]
    fn test_mode_display_matches_value_names() {
        for mode in Mode::value_variants() {
            let name = mode.to_possible_value().unwrap();
            assert_eq!(name.get_name(), mode.to_string());
        }
    }
}
