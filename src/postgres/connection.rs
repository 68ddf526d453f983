use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::md5_hash;
use postgres_protocol::authentication::sasl::{self, ChannelBinding, ScramSha256};
use postgres_protocol::message::{backend, frontend};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::transport::ReplicationTransport;
use super::types::{Lsn, SystemInfo};
use crate::config::PostgresConfig;
use crate::{Error, Result};

const COPY_BOTH_RESPONSE_TAG: u8 = b'W';
const DUPLICATE_OBJECT: &str = "42710";
const UNDEFINED_OBJECT: &str = "42704";

/// A walsender connection (`replication=database`) speaking the wire
/// protocol directly, since the regular client has no CopyBoth support.
pub struct ReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    username: String,
    password: String,
    replication_started: bool,
    closed: bool,
}

/// One row of a simple-query result, all values in text format.
#[derive(Debug, Clone)]
pub struct QueryRow {
    columns: Arc<Vec<String>>,
    values: Vec<Option<String>>,
}

impl QueryRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.values.get(idx)?.as_deref()
    }
}

enum Backend {
    CopyBothResponse,
    Message(backend::Message),
}

impl ReplicationConnection {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        info!("Creating replication connection to PostgreSQL at {}", addr);

        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let conn = tokio::time::timeout(timeout, Self::establish(&addr, config))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("connecting to {} took longer than {:?}", addr, timeout),
            })??;

        info!("Successfully connected to PostgreSQL in replication mode");
        Ok(conn)
    }

    async fn establish(addr: &str, config: &PostgresConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Connection(format!("failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(1024),
            username: config.username.clone(),
            password: config.password.clone(),
            replication_started: false,
            closed: false,
        };

        frontend::startup_message(
            [
                ("user", config.username.as_str()),
                ("database", config.database.as_str()),
                ("replication", "database"),
                ("application_name", "pg-outbox"),
                ("client_encoding", "UTF8"),
            ],
            &mut conn.write_buf,
        )?;
        conn.flush().await?;

        conn.authenticate().await?;
        conn.wait_until_ready().await?;
        Ok(conn)
    }

    async fn authenticate(&mut self) -> Result<()> {
        loop {
            match self.read_message().await? {
                backend::Message::AuthenticationOk => {
                    debug!("Authenticated as {}", self.username);
                    return Ok(());
                }
                backend::Message::AuthenticationCleartextPassword => {
                    frontend::password_message(self.password.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                backend::Message::AuthenticationMd5Password(body) => {
                    let hash = md5_hash(
                        self.username.as_bytes(),
                        self.password.as_bytes(),
                        body.salt(),
                    );
                    frontend::password_message(hash.as_bytes(), &mut self.write_buf)?;
                    self.flush().await?;
                }
                backend::Message::AuthenticationSasl(body) => {
                    let offers_scram = body
                        .mechanisms()
                        .any(|mechanism| Ok(mechanism == sasl::SCRAM_SHA_256))?;
                    if !offers_scram {
                        return Err(Error::Authentication(
                            "server does not offer SCRAM-SHA-256".to_string(),
                        ));
                    }
                    self.authenticate_scram().await?;
                }
                backend::Message::ErrorResponse(body) => return Err(server_error(&body)),
                _ => {
                    return Err(Error::Authentication(
                        "unsupported authentication method".to_string(),
                    ))
                }
            }
        }
    }

    async fn authenticate_scram(&mut self) -> Result<()> {
        let mut scram = ScramSha256::new(self.password.as_bytes(), ChannelBinding::unsupported());

        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        let server_first = match self.read_message().await? {
            backend::Message::AuthenticationSaslContinue(body) => body,
            backend::Message::ErrorResponse(body) => return Err(server_error(&body)),
            _ => {
                return Err(Error::Authentication(
                    "expected AuthenticationSASLContinue".to_string(),
                ))
            }
        };
        scram
            .update(server_first.data())
            .map_err(|e| Error::Authentication(e.to_string()))?;

        frontend::sasl_response(scram.message(), &mut self.write_buf)?;
        self.flush().await?;

        let server_final = match self.read_message().await? {
            backend::Message::AuthenticationSaslFinal(body) => body,
            backend::Message::ErrorResponse(body) => return Err(server_error(&body)),
            _ => {
                return Err(Error::Authentication(
                    "expected AuthenticationSASLFinal".to_string(),
                ))
            }
        };
        scram
            .finish(server_final.data())
            .map_err(|e| Error::Authentication(e.to_string()))
    }

    async fn wait_until_ready(&mut self) -> Result<()> {
        loop {
            match self.read_message().await? {
                backend::Message::ReadyForQuery(_) => return Ok(()),
                backend::Message::ParameterStatus(_)
                | backend::Message::BackendKeyData(_)
                | backend::Message::NoticeResponse(_) => {}
                backend::Message::ErrorResponse(body) => return Err(server_error(&body)),
                _ => {
                    return Err(Error::Protocol(
                        "unexpected message before ReadyForQuery".to_string(),
                    ))
                }
            }
        }
    }

    /// Runs a replication command through the simple query protocol.
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<QueryRow>> {
        if self.replication_started {
            return Err(Error::replication("connection is already streaming"));
        }
        debug!("Sending {}", sql);
        frontend::query(sql, &mut self.write_buf)?;
        self.flush().await?;

        let mut columns = Arc::new(Vec::new());
        let mut rows = Vec::new();
        let mut failure = None;

        loop {
            match self.read_message().await? {
                backend::Message::RowDescription(body) => {
                    let names = body
                        .fields()
                        .map(|field| Ok(field.name().to_string()))
                        .collect::<Vec<_>>()?;
                    columns = Arc::new(names);
                }
                backend::Message::DataRow(body) => {
                    let buffer = body.buffer();
                    let values = body
                        .ranges()
                        .map(|range| {
                            Ok(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()))
                        })
                        .collect::<Vec<_>>()?;
                    rows.push(QueryRow {
                        columns: Arc::clone(&columns),
                        values,
                    });
                }
                backend::Message::ErrorResponse(body) => failure = Some(server_error(&body)),
                backend::Message::ReadyForQuery(_) => break,
                backend::Message::CommandComplete(_)
                | backend::Message::EmptyQueryResponse
                | backend::Message::NoticeResponse(_)
                | backend::Message::ParameterStatus(_) => {}
                _ => {
                    return Err(Error::Protocol(format!(
                        "unexpected message in response to {}",
                        sql
                    )))
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(rows),
        }
    }

    pub async fn drop_replication_slot(&mut self, slot_name: &str) -> Result<()> {
        info!("Dropping replication slot: {}", slot_name);

        match self
            .simple_query(&format!("DROP_REPLICATION_SLOT {}", slot_name))
            .await
        {
            Ok(_) => {
                info!("Dropped replication slot '{}'", slot_name);
                Ok(())
            }
            Err(e) if e.server_code() == Some(UNDEFINED_OBJECT) => {
                warn!("Replication slot '{}' does not exist", slot_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.stream.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<backend::Message> {
        match self.read_backend().await? {
            Backend::Message(message) => Ok(message),
            Backend::CopyBothResponse => Err(Error::Protocol(
                "unexpected CopyBothResponse".to_string(),
            )),
        }
    }

    // Cancel safe: bytes only leave `read_buf` once a whole frame is present.
    async fn read_backend(&mut self) -> Result<Backend> {
        loop {
            if let Some(message) = self.next_frame()? {
                return Ok(message);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::Connection(
                    "server closed the connection".to_string(),
                ));
            }
        }
    }

    fn next_frame(&mut self) -> Result<Option<Backend>> {
        if self.read_buf.len() < 5 {
            return Ok(None);
        }
        let tag = self.read_buf[0];
        let len = u32::from_be_bytes([
            self.read_buf[1],
            self.read_buf[2],
            self.read_buf[3],
            self.read_buf[4],
        ]) as usize;
        if len < 4 {
            return Err(Error::Protocol(format!(
                "invalid backend message length: {}",
                len
            )));
        }
        let total = len + 1;
        if self.read_buf.len() < total {
            self.read_buf.reserve(total - self.read_buf.len());
            return Ok(None);
        }

        // Older protocol crates reject 'W', so it is split off here.
        if tag == COPY_BOTH_RESPONSE_TAG {
            self.read_buf.advance(total);
            return Ok(Some(Backend::CopyBothResponse));
        }

        match backend::Message::parse(&mut self.read_buf)? {
            Some(message) => Ok(Some(Backend::Message(message))),
            None => Err(Error::Protocol(format!(
                "incomplete backend message with tag '{}'",
                tag as char
            ))),
        }
    }
}

#[async_trait]
impl ReplicationTransport for ReplicationConnection {
    async fn create_replication_slot(&mut self, slot_name: &str) -> Result<()> {
        info!("Creating replication slot: {}", slot_name);

        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput NOEXPORT_SNAPSHOT",
            slot_name
        );

        match self.simple_query(&query).await {
            Ok(rows) => {
                for row in rows {
                    let lsn = row.get("consistent_point").unwrap_or("unknown");
                    info!("Created replication slot '{}' at LSN {}", slot_name, lsn);
                }
                Ok(())
            }
            Err(e) if e.server_code() == Some(DUPLICATE_OBJECT) => {
                info!("Replication slot '{}' already exists", slot_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn identify_system(&mut self) -> Result<SystemInfo> {
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::replication("IDENTIFY_SYSTEM returned no rows"))?;

        let xlogpos = row
            .get("xlogpos")
            .ok_or_else(|| Error::replication("IDENTIFY_SYSTEM returned no xlogpos"))?;
        let timeline = row
            .get("timeline")
            .unwrap_or("1")
            .parse::<i32>()
            .map_err(|e| Error::Protocol(format!("invalid timeline: {}", e)))?;

        let info = SystemInfo {
            system_id: row.get("systemid").unwrap_or("unknown").to_string(),
            timeline,
            xlogpos: Lsn::parse(xlogpos)?,
            dbname: row.get("dbname").map(str::to_string),
        };
        debug!("System info: {:?}", info);
        Ok(info)
    }

    async fn start_replication(
        &mut self,
        slot_name: &str,
        start: Lsn,
        plugin_args: &[String],
    ) -> Result<()> {
        info!("Starting replication from LSN: {}", start);

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} ({})",
            slot_name,
            start,
            plugin_args.join(", ")
        );
        frontend::query(&query, &mut self.write_buf)?;
        self.flush().await?;

        let mut failure = None;
        loop {
            match self.read_backend().await? {
                Backend::CopyBothResponse => break,
                Backend::Message(backend::Message::ErrorResponse(body)) => {
                    failure = Some(server_error(&body))
                }
                Backend::Message(backend::Message::ReadyForQuery(_)) => {
                    return Err(failure.unwrap_or_else(|| {
                        Error::replication("server did not enter CopyBoth mode")
                    }));
                }
                Backend::Message(backend::Message::NoticeResponse(_))
                | Backend::Message(backend::Message::ParameterStatus(_)) => {}
                Backend::Message(_) => {
                    return Err(Error::Protocol(
                        "unexpected message in response to START_REPLICATION".to_string(),
                    ))
                }
            }
        }

        self.replication_started = true;
        info!("Replication stream established");
        Ok(())
    }

    async fn recv_copy_data(&mut self) -> Result<Bytes> {
        if !self.replication_started {
            return Err(Error::replication("Replication not started"));
        }

        loop {
            match self.read_backend().await? {
                Backend::Message(backend::Message::CopyData(body)) => return Ok(body.into_bytes()),
                Backend::Message(backend::Message::NoticeResponse(_))
                | Backend::Message(backend::Message::ParameterStatus(_)) => continue,
                Backend::Message(backend::Message::ErrorResponse(body)) => {
                    return Err(server_error(&body))
                }
                Backend::Message(backend::Message::CopyDone) => {
                    return Err(Error::replication("server ended the replication stream"))
                }
                _ => {
                    return Err(Error::Protocol(
                        "unexpected message during replication".to_string(),
                    ))
                }
            }
        }
    }

    async fn send_copy_data(&mut self, payload: Bytes) -> Result<()> {
        if !self.replication_started {
            return Err(Error::replication("No active replication stream"));
        }
        frontend::CopyData::new(payload)?.write(&mut self.write_buf);
        self.flush().await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("Closing replication connection");

        frontend::terminate(&mut self.write_buf);
        if let Err(e) = self.flush().await {
            debug!("Terminate not delivered: {}", e);
        }
        if let Err(e) = self.stream.shutdown().await {
            debug!("Socket shutdown failed: {}", e);
        }
        Ok(())
    }
}

fn server_error(body: &backend::ErrorResponseBody) -> Error {
    let mut code = String::new();
    let mut message = String::new();
    let mut fields = body.fields();
    loop {
        match fields.next() {
            Ok(Some(field)) => match field.type_() {
                b'C' => code = field.value().to_string(),
                b'M' => message = field.value().to_string(),
                _ => {}
            },
            Ok(None) => break,
            Err(e) => return Error::Protocol(format!("malformed ErrorResponse: {}", e)),
        }
    }
    Error::Server { code, message }
}
