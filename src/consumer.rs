//! The replication session: handshake, streaming loop and keepalive cadence.
//!
//! One session owns one replication connection. It seeds its position from
//! `IDENTIFY_SYSTEM`, starts pgoutput streaming for the outbox publication and
//! then alternates between reporting its position (once per keepalive
//! interval) and receiving a single frame, waiting at most until the next
//! report is due.
//!
//! ```rust,no_run
//! use pg_outbox::consumer::{LatencyReporter, ReplicationSession, SessionSettings};
//! use pg_outbox::postgres::ReplicationConnection;
//! use pg_outbox::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> pg_outbox::Result<()> {
//! let config = Config::load(None)?;
//! let connection = ReplicationConnection::connect(&config.postgres).await?;
//! let mut session = ReplicationSession::new(
//!     connection,
//!     LatencyReporter::new(config.replication.report_every),
//!     SessionSettings::from_config(&config),
//! );
//! let result = session.run(&CancellationToken::new()).await;
//! session.close().await?;
//! result
//! # }
//! ```

use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::message::Message;
use crate::postgres::decoder::{CommitRecord, LogicalMessageRecord, LogicalRecord, PgOutputDecoder};
use crate::postgres::protocol::{encode_standby_status_update, pg_now, StreamFrame};
use crate::postgres::{Lsn, ReplicationTransport, SystemInfo};
use crate::tracker::{Advance, PositionTracker, RecordPosition};
use crate::{Error, Result};

pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Identifying,
    Streaming,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub slot_name: String,
    pub publication: String,
    pub keepalive_interval: Duration,
    pub create_slot: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            slot_name: config.outbox.slot_name.clone(),
            publication: config.outbox.publication.clone(),
            keepalive_interval: config.keepalive_interval(),
            create_slot: config.replication.create_slot,
        }
    }

    /// pgoutput options: logical messages on, binary fields, committed
    /// transactions only.
    pub fn plugin_arguments(&self) -> Vec<String> {
        vec![
            format!("proto_version '{}'", PROTOCOL_VERSION),
            "messages 'true'".to_string(),
            "binary 'true'".to_string(),
            "streaming 'false'".to_string(),
            format!("publication_names '{}'", self.publication),
        ]
    }
}

/// A message read off the stream, handed to a [`MessageSink`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub prefix: String,
    /// Position of the logical message record itself.
    pub record_lsn: Lsn,
    /// Last committed position when the message arrived.
    pub committed_lsn: Lsn,
    pub latency: Duration,
}

pub trait MessageSink: Send {
    fn deliver(&mut self, delivery: Delivery) -> Result<()>;
}

impl MessageSink for Vec<Delivery> {
    fn deliver(&mut self, delivery: Delivery) -> Result<()> {
        self.push(delivery);
        Ok(())
    }
}

/// Logs every Nth message with its end-to-end latency.
#[derive(Debug)]
pub struct LatencyReporter {
    report_every: u64,
    received: u64,
}

impl LatencyReporter {
    pub fn new(report_every: u64) -> Self {
        Self {
            report_every: report_every.max(1),
            received: 0,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

impl MessageSink for LatencyReporter {
    fn deliver(&mut self, delivery: Delivery) -> Result<()> {
        if self.received % self.report_every == 0 {
            info!(
                last_committed_lsn = %delivery.committed_lsn,
                latency_ms = delivery.latency.as_millis() as u64,
                id = %delivery.message.id,
                payload = %String::from_utf8_lossy(&delivery.message.payload),
                "message-received"
            );
        }
        self.received += 1;
        Ok(())
    }
}

pub struct ReplicationSession<T, S> {
    transport: T,
    sink: S,
    settings: SessionSettings,
    decoder: PgOutputDecoder,
    tracker: PositionTracker,
    state: SessionState,
    delivered: u64,
}

impl<T: ReplicationTransport, S: MessageSink> ReplicationSession<T, S> {
    pub fn new(transport: T, sink: S, settings: SessionSettings) -> Self {
        Self {
            transport,
            sink,
            settings,
            // `streaming 'false'` means message records carry no xid
            decoder: PgOutputDecoder::for_streaming(false),
            tracker: PositionTracker::new(),
            state: SessionState::Disconnected,
            delivered: 0,
        }
    }

    /// Identifies the system, seeds the position and enters streaming mode.
    ///
    /// Any failure here is fatal to the session; reconnecting is up to the caller.
    pub async fn start(&mut self) -> Result<SystemInfo> {
        if self.state != SessionState::Disconnected {
            return Err(Error::replication(format!(
                "cannot start a session in state {:?}",
                self.state
            )));
        }
        self.state = SessionState::Identifying;

        if self.settings.create_slot {
            self.transport
                .create_replication_slot(&self.settings.slot_name)
                .await
                .map_err(|e| Error::replication(format!("create-replication-slot failed: {}", e)))?;
        }

        let sysident = self
            .transport
            .identify_system()
            .await
            .map_err(|e| Error::replication(format!("identify-system failed: {}", e)))?;
        self.tracker.seed(sysident.xlogpos);
        info!(
            lsn = %sysident.xlogpos,
            system_id = %sysident.system_id,
            timeline = sysident.timeline,
            "start-position"
        );

        let plugin_args = self.settings.plugin_arguments();
        self.transport
            .start_replication(&self.settings.slot_name, self.tracker.current(), &plugin_args)
            .await
            .map_err(|e| Error::replication(format!("failed to start replication: {}", e)))?;

        self.state = SessionState::Streaming;
        Ok(sysident)
    }

    /// Streams until `cancel` fires, then closes the connection.
    ///
    /// Starts the session first if it has not been started.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.state == SessionState::Disconnected {
            self.start().await?;
        }
        if self.state != SessionState::Streaming {
            return Err(Error::replication(format!(
                "cannot stream in state {:?}",
                self.state
            )));
        }

        let interval = self.settings.keepalive_interval;
        let mut deadline = Instant::now() + interval;

        while !cancel.is_cancelled() {
            if Instant::now() >= deadline {
                self.send_status_update().await?;
                deadline = Instant::now() + interval;
            }

            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = tokio::time::timeout_at(deadline, self.transport.recv_copy_data()) => {
                    match received {
                        Ok(payload) => payload?,
                        // keepalive due; nothing arrived
                        Err(_) => continue,
                    }
                }
            };

            self.process_frame(payload)?;
        }

        info!(
            lsn = %self.tracker.current(),
            delivered = self.delivered,
            "replication loop stopped"
        );
        self.close().await
    }

    /// Classifies and applies one CopyData payload.
    pub fn process_frame(&mut self, payload: Bytes) -> Result<()> {
        match StreamFrame::parse(payload)? {
            StreamFrame::KeepAlive {
                wal_end,
                reply_requested,
                ..
            } => {
                trace!(%wal_end, reply_requested, "primary keepalive");
            }
            StreamFrame::XLogData {
                wal_start, data, ..
            } => match self.decoder.decode(&data)? {
                LogicalRecord::Begin(begin) => {
                    trace!(xid = begin.xid, final_lsn = %begin.final_lsn, "begin");
                }
                LogicalRecord::Message(record) => self.handle_message(record)?,
                LogicalRecord::Commit(commit) => self.handle_commit(&commit),
                LogicalRecord::Unknown(tag) => {
                    warn!(
                        lsn = %wal_start,
                        record_type = %(tag as char),
                        "unexpected-record"
                    );
                }
            },
        }
        Ok(())
    }

    fn handle_message(&mut self, record: LogicalMessageRecord) -> Result<()> {
        let message = Message::deserialize(&record.content).map_err(|e| {
            Error::decode(format!(
                "logical message at {} is not an outbox message: {}",
                record.lsn, e
            ))
        })?;

        let delivery = Delivery {
            latency: message.latency(),
            committed_lsn: self.tracker.current(),
            record_lsn: record.lsn,
            prefix: record.prefix,
            message,
        };
        self.delivered += 1;
        self.sink.deliver(delivery)
    }

    fn handle_commit(&mut self, commit: &CommitRecord) {
        match self.tracker.advance(RecordPosition::Commit(commit.end_lsn)) {
            Advance::Moved { from, to } => trace!(%from, %to, "commit"),
            Advance::Stale { current, candidate } => {
                warn!(%current, %candidate, "commit position behind tracked position, ignoring");
            }
            Advance::Unchanged | Advance::NotABoundary => {}
        }
    }

    /// Reports the tracked position as written, flushed and applied.
    pub async fn send_status_update(&mut self) -> Result<()> {
        let position = self.tracker.current();
        self.transport
            .send_copy_data(encode_standby_status_update(position, pg_now()))
            .await
            .map_err(|e| Error::replication(format!("failed to send standby update: {}", e)))?;
        debug!(reported_lsn = %position, "status-updated");
        Ok(())
    }

    /// Closes the connection. Safe to call more than once, including after a failure.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.transport.close().await
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn position(&self) -> Lsn {
        self.tracker.current()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}
