use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

use super::decoder::XidField;
use super::transport::ReplicationTransport;
use super::types::{Lsn, SystemInfo};
use crate::message::Message;
use crate::{Error, Result};

/// Mock frame builder for testing the pgoutput decoder and the session
pub struct MockMessageBuilder {
    wal_start: u64,
    timestamp: i64,
    xid_field: XidField,
    xid: u32,
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            wal_start: 1000,
            timestamp: 750_681_000_000_000, // 2023-10-15 10:30:00 UTC since 2000-01-01
            xid_field: XidField::Absent,
            xid: 731,
        }
    }

    pub fn with_wal_start(mut self, wal_start: u64) -> Self {
        self.wal_start = wal_start;
        self
    }

    pub fn with_xid_field(mut self, xid_field: XidField, xid: u32) -> Self {
        self.xid_field = xid_field;
        self.xid = xid;
        self
    }

    /// Wrap a record in an XLogData frame
    pub fn xlogdata(&self, record: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(self.wal_start);
        buf.put_u64(self.wal_start + record.len() as u64);
        buf.put_i64(self.timestamp);
        buf.put_slice(record);
        buf.freeze()
    }

    pub fn begin_record(&self, final_lsn: u64, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(final_lsn);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit_record(&self, commit_lsn: u64, end_lsn: u64) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0); // flags
        buf.put_u64(commit_lsn);
        buf.put_u64(end_lsn);
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    /// Build an 'M' record; `xid` is written only when given
    pub fn message_record(&self, xid: Option<u32>, lsn: u64, prefix: &str, content: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'M');
        if let Some(xid) = xid {
            buf.put_u32(xid);
        }
        buf.put_u8(1); // transactional
        buf.put_u64(lsn);
        buf.put_slice(prefix.as_bytes());
        buf.put_u8(0);
        buf.put_u32(content.len() as u32);
        buf.put_slice(content);
        buf.freeze()
    }

    pub fn begin_message(&self, final_lsn: u64, xid: u32) -> Bytes {
        self.xlogdata(&self.begin_record(final_lsn, xid))
    }

    pub fn commit_message(&self, commit_lsn: u64, end_lsn: u64) -> Bytes {
        self.xlogdata(&self.commit_record(commit_lsn, end_lsn))
    }

    pub fn logical_message(&self, lsn: u64, prefix: &str, message: &Message) -> Bytes {
        let content = message.serialize().unwrap();
        let xid = match self.xid_field {
            XidField::Present => Some(self.xid),
            XidField::Absent => None,
        };
        self.xlogdata(&self.message_record(xid, lsn, prefix, &content))
    }

    pub fn keepalive(&self, wal_end: u64, reply_requested: bool) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(wal_end);
        buf.put_i64(self.timestamp);
        buf.put_u8(u8::from(reply_requested));
        buf.freeze()
    }
}

/// Scripted in-memory replication connection.
///
/// Hands out queued frames in order. Once the queue is drained it fails with
/// `recv_error` if set, otherwise cancels `cancel_when_drained` (if set) and
/// never completes.
pub struct MockTransport {
    pub system_info: SystemInfo,
    pub frames: VecDeque<Bytes>,
    pub sent: Vec<Bytes>,
    pub slots_created: Vec<String>,
    pub started: Option<(String, Lsn, Vec<String>)>,
    pub fail_identify: bool,
    pub fail_start: bool,
    pub recv_error: Option<Error>,
    pub cancel_when_drained: Option<CancellationToken>,
    pub close_calls: usize,
}

impl MockTransport {
    pub fn new(xlogpos: Lsn) -> Self {
        Self {
            system_info: SystemInfo {
                system_id: "7290873460123456789".to_string(),
                timeline: 1,
                xlogpos,
                dbname: Some("postgres".to_string()),
            },
            frames: VecDeque::new(),
            sent: Vec::new(),
            slots_created: Vec::new(),
            started: None,
            fail_identify: false,
            fail_start: false,
            recv_error: None,
            cancel_when_drained: None,
            close_calls: 0,
        }
    }

    pub fn push(&mut self, frame: Bytes) {
        self.frames.push_back(frame);
    }
}

#[async_trait]
impl ReplicationTransport for MockTransport {
    async fn create_replication_slot(&mut self, slot_name: &str) -> Result<()> {
        self.slots_created.push(slot_name.to_string());
        Ok(())
    }

    async fn identify_system(&mut self) -> Result<SystemInfo> {
        if self.fail_identify {
            return Err(Error::Server {
                code: "08P01".to_string(),
                message: "invalid replication command".to_string(),
            });
        }
        Ok(self.system_info.clone())
    }

    async fn start_replication(
        &mut self,
        slot_name: &str,
        start: Lsn,
        plugin_args: &[String],
    ) -> Result<()> {
        if self.fail_start {
            return Err(Error::Server {
                code: "42704".to_string(),
                message: format!("replication slot \"{}\" does not exist", slot_name),
            });
        }
        self.started = Some((slot_name.to_string(), start, plugin_args.to_vec()));
        Ok(())
    }

    async fn recv_copy_data(&mut self) -> Result<Bytes> {
        if let Some(frame) = self.frames.pop_front() {
            return Ok(frame);
        }
        if let Some(err) = self.recv_error.take() {
            return Err(err);
        }
        if let Some(token) = &self.cancel_when_drained {
            token.cancel();
        }
        std::future::pending().await
    }

    async fn send_copy_data(&mut self, payload: Bytes) -> Result<()> {
        self.sent.push(payload);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.close_calls += 1;
        Ok(())
    }
}
