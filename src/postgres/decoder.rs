use bytes::{Buf, Bytes};
use tracing::trace;

use super::types::Lsn;
use crate::{Error, Result};

pub const BEGIN_TAG: u8 = b'B';
pub const MESSAGE_TAG: u8 = b'M';
pub const COMMIT_TAG: u8 = b'C';

/// Whether a logical decoding message carries the Int32 transaction id.
///
/// pgoutput only writes it for streamed (in-progress) transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidField {
    Present,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginRecord {
    pub final_lsn: Lsn,
    pub commit_time_micros: i64,
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub commit_time_micros: i64,
}

/// A logical decoding message as written by `pg_logical_emit_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessageRecord {
    pub transaction_id: Option<u32>,
    pub flags: u8,
    pub lsn: Lsn,
    pub prefix: String,
    /// Declared length; `content` is whatever follows it.
    pub content_length: u32,
    pub content: Bytes,
}

impl LogicalMessageRecord {
    /// Decodes a message record whose leading `'M'` tag was already consumed.
    pub fn decode(mut src: Bytes, xid: XidField) -> Result<Self> {
        let transaction_id = match xid {
            XidField::Present => Some(read_u32(&mut src, "transaction id")?),
            XidField::Absent => None,
        };
        let flags = read_u8(&mut src, "flags")?;
        let lsn = Lsn(read_u64(&mut src, "message LSN")?);
        let prefix = read_cstring(&mut src)?;
        let content_length = read_u32(&mut src, "content length")?;
        let content = src.copy_to_bytes(src.remaining());

        Ok(Self {
            transaction_id,
            flags,
            lsn,
            prefix,
            content_length,
            content,
        })
    }

    pub fn is_transactional(&self) -> bool {
        self.flags & 1 == 1
    }
}

impl BeginRecord {
    pub fn decode(mut src: Bytes) -> Result<Self> {
        if src.remaining() < 20 {
            return Err(Error::decode(format!(
                "BEGIN record too short: {} bytes",
                src.remaining()
            )));
        }
        Ok(Self {
            final_lsn: Lsn(src.get_u64()),
            commit_time_micros: src.get_i64(),
            xid: src.get_u32(),
        })
    }
}

impl CommitRecord {
    pub fn decode(mut src: Bytes) -> Result<Self> {
        if src.remaining() < 25 {
            return Err(Error::decode(format!(
                "COMMIT record too short: {} bytes",
                src.remaining()
            )));
        }
        Ok(Self {
            flags: src.get_u8(),
            commit_lsn: Lsn(src.get_u64()),
            end_lsn: Lsn(src.get_u64()),
            commit_time_micros: src.get_i64(),
        })
    }
}

/// One record of the pgoutput stream, classified by its leading tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalRecord {
    Begin(BeginRecord),
    Message(LogicalMessageRecord),
    Commit(CommitRecord),
    Unknown(u8),
}

impl LogicalRecord {
    pub fn tag(&self) -> u8 {
        match self {
            LogicalRecord::Begin(_) => BEGIN_TAG,
            LogicalRecord::Message(_) => MESSAGE_TAG,
            LogicalRecord::Commit(_) => COMMIT_TAG,
            LogicalRecord::Unknown(tag) => *tag,
        }
    }
}

/// Decodes the WAL data of XLogData frames.
#[derive(Debug, Clone)]
pub struct PgOutputDecoder {
    xid_field: XidField,
}

impl PgOutputDecoder {
    pub fn new(xid_field: XidField) -> Self {
        Self { xid_field }
    }

    /// Layout implied by the `streaming` plugin argument.
    pub fn for_streaming(streaming: bool) -> Self {
        if streaming {
            Self::new(XidField::Present)
        } else {
            Self::new(XidField::Absent)
        }
    }

    pub fn xid_field(&self) -> XidField {
        self.xid_field
    }

    pub fn decode(&self, data: &Bytes) -> Result<LogicalRecord> {
        if data.is_empty() {
            return Err(Error::decode("wal-data is missing"));
        }

        let tag = data[0];
        let body = data.slice(1..);

        let record = match tag {
            BEGIN_TAG => LogicalRecord::Begin(BeginRecord::decode(body)?),
            MESSAGE_TAG => {
                LogicalRecord::Message(LogicalMessageRecord::decode(body, self.xid_field)?)
            }
            COMMIT_TAG => LogicalRecord::Commit(CommitRecord::decode(body)?),
            other => LogicalRecord::Unknown(other),
        };

        trace!(tag = %(tag as char), "decoded record");
        Ok(record)
    }
}

fn read_u8(src: &mut Bytes, field: &str) -> Result<u8> {
    if src.remaining() < 1 {
        return Err(truncated(field, 1, src.remaining()));
    }
    Ok(src.get_u8())
}

fn read_u32(src: &mut Bytes, field: &str) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(truncated(field, 4, src.remaining()));
    }
    Ok(src.get_u32())
}

fn read_u64(src: &mut Bytes, field: &str) -> Result<u64> {
    if src.remaining() < 8 {
        return Err(truncated(field, 8, src.remaining()));
    }
    Ok(src.get_u64())
}

fn read_cstring(src: &mut Bytes) -> Result<String> {
    let end = src
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::decode("prefix is not null-terminated"))?;
    let value = std::str::from_utf8(&src[..end])
        .map_err(|_| Error::decode("prefix is not valid UTF-8"))?
        .to_string();
    src.advance(end + 1);
    Ok(value)
}

fn truncated(field: &str, needed: usize, available: usize) -> Error {
    Error::decode(format!(
        "buffer too short for {}: need {} bytes, have {}",
        field, needed, available
    ))
}
