//! Streaming replication envelope carried inside CopyData.
//!
//! The server wraps every record in either an XLogData (`'w'`) frame or a
//! primary keepalive (`'k'`) frame. The client answers with standby status
//! updates (`'r'`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::types::Lsn;
use crate::{Error, Result};

pub const XLOG_DATA_TAG: u8 = b'w';
pub const PRIMARY_KEEPALIVE_TAG: u8 = b'k';
pub const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';

/// PostgreSQL epoch (2000-01-01) in microseconds since the Unix epoch.
pub const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time_micros: i64,
        data: Bytes,
    },
    KeepAlive {
        wal_end: Lsn,
        server_time_micros: i64,
        reply_requested: bool,
    },
}

impl StreamFrame {
    pub fn parse(payload: Bytes) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::Protocol("empty CopyData payload".to_string()));
        }

        let mut cursor = payload;
        let tag = cursor.get_u8();

        match tag {
            XLOG_DATA_TAG => {
                if cursor.remaining() < 24 {
                    return Err(Error::Protocol(format!(
                        "XLogData header too short: {} bytes",
                        cursor.remaining()
                    )));
                }
                let wal_start = Lsn(cursor.get_u64());
                let wal_end = Lsn(cursor.get_u64());
                let server_time_micros = cursor.get_i64();
                Ok(StreamFrame::XLogData {
                    wal_start,
                    wal_end,
                    server_time_micros,
                    data: cursor,
                })
            }
            PRIMARY_KEEPALIVE_TAG => {
                if cursor.remaining() < 17 {
                    return Err(Error::Protocol(format!(
                        "keepalive too short: {} bytes",
                        cursor.remaining()
                    )));
                }
                let wal_end = Lsn(cursor.get_u64());
                let server_time_micros = cursor.get_i64();
                let reply_requested = cursor.get_u8() != 0;
                Ok(StreamFrame::KeepAlive {
                    wal_end,
                    server_time_micros,
                    reply_requested,
                })
            }
            _ => Err(Error::Protocol(format!(
                "unknown CopyData kind: 0x{:02x} ('{}')",
                tag, tag as char
            ))),
        }
    }
}

/// Standby status update reporting one position for write, flush and apply.
pub fn encode_standby_status_update(position: Lsn, client_time_micros: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(STANDBY_STATUS_UPDATE_TAG);
    buf.put_u64(position.0); // written
    buf.put_u64(position.0); // flushed
    buf.put_u64(position.0); // applied
    buf.put_i64(client_time_micros);
    buf.put_u8(0); // no reply requested
    buf.freeze()
}

pub fn pg_timestamp(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros() - PG_EPOCH_MICROS
}

pub fn pg_now() -> i64 {
    pg_timestamp(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xlogdata() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(0x0123_4567_89AB_CDEF);
        buf.put_u64(0xFEDC_BA98_7654_3210);
        buf.put_i64(-12345);
        buf.put_slice(b"BEGIN");

        match StreamFrame::parse(buf.freeze()).unwrap() {
            StreamFrame::XLogData {
                wal_start,
                wal_end,
                server_time_micros,
                data,
            } => {
                assert_eq!(wal_start, Lsn(0x0123_4567_89AB_CDEF));
                assert_eq!(wal_end, Lsn(0xFEDC_BA98_7654_3210));
                assert_eq!(server_time_micros, -12345);
                assert_eq!(&data[..], b"BEGIN");
            }
            other => panic!("Expected XLogData, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_keepalive() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(100);
        buf.put_i64(200);
        buf.put_u8(1);

        let frame = StreamFrame::parse(buf.freeze()).unwrap();
        assert_eq!(
            frame,
            StreamFrame::KeepAlive {
                wal_end: Lsn(100),
                server_time_micros: 200,
                reply_requested: true,
            }
        );
    }

    #[test]
    fn test_parse_short_frames() {
        let mut xlog = vec![b'w'];
        xlog.extend_from_slice(&[0u8; 23]);
        assert!(StreamFrame::parse(Bytes::from(xlog)).is_err());

        let mut keepalive = vec![b'k'];
        keepalive.extend_from_slice(&[0u8; 16]);
        assert!(StreamFrame::parse(Bytes::from(keepalive)).is_err());

        assert!(StreamFrame::parse(Bytes::new()).is_err());
    }

    #[test]
    fn test_parse_unknown_kind() {
        let err = StreamFrame::parse(Bytes::from_static(b"X123")).unwrap_err();
        assert!(err.to_string().contains("0x58"));
    }

    #[test]
    fn test_encode_standby_status_update() {
        let payload = encode_standby_status_update(Lsn(0x1234_5678_9ABC_DEF0), 987_654_321);

        assert_eq!(payload.len(), 34);
        assert_eq!(payload[0], b'r');
        let lsn = 0x1234_5678_9ABC_DEF0u64.to_be_bytes();
        assert_eq!(&payload[1..9], &lsn);
        assert_eq!(&payload[9..17], &lsn);
        assert_eq!(&payload[17..25], &lsn);
        assert_eq!(&payload[25..33], &987_654_321i64.to_be_bytes());
        assert_eq!(payload[33], 0);
    }

    #[test]
    fn test_pg_timestamp_epoch() {
        let epoch = DateTime::parse_from_rfc3339("2000-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(pg_timestamp(epoch), 0);
    }
}
