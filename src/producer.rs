//! Transactional writer for the outbox.
//!
//! Every unit of work upserts the business row and emits the outbox message
//! inside one read-committed transaction, so the message becomes visible to
//! the consumer exactly when the row change commits, and never if it rolls
//! back.

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio_postgres::{Client, IsolationLevel, NoTls, Transaction};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::message::Message;
use crate::user::User;
use crate::{Error, Result};

const UPSERT_USER: &str = "insert into users(id, first_name, details, birth_date) \
     values ($1, $2, $3, $4) \
     on conflict (id) do update \
     set first_name = excluded.first_name, \
     details = excluded.details, \
     birth_date = excluded.birth_date";

const EMIT_MESSAGE: &str = "select pg_logical_emit_message(true, $1::text, $2::bytea)";

const CREATE_USERS_TABLE: &str = "create table if not exists users (
    id text primary key,
    first_name text not null,
    details jsonb,
    birth_date timestamptz
)";

pub async fn upsert_user(tx: &Transaction<'_>, user: &User) -> Result<u64> {
    let rows = tx
        .execute(
            UPSERT_USER,
            &[&user.id, &user.first_name, &user.details, &user.birth_date],
        )
        .await?;
    Ok(rows)
}

/// Writes a transactional logical decoding message into the WAL.
pub async fn emit_message(tx: &Transaction<'_>, prefix: &str, content: &[u8]) -> Result<()> {
    tx.execute(EMIT_MESSAGE, &[&prefix, &content]).await?;
    Ok(())
}

/// Where a unit of work is persisted.
///
/// [`OutboxWriter`] implements this against the database; tests script it.
#[async_trait]
pub trait OutboxStore: Send {
    /// Stores `user` and `message` atomically.
    async fn persist(&mut self, user: &User, message: &Message) -> Result<()>;
}

pub struct OutboxWriter {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
    prefix: String,
}

impl OutboxWriter {
    pub async fn connect(config: &Config) -> Result<Self> {
        info!(
            host = %config.postgres.host,
            database = %config.postgres.database,
            "Connecting producer to PostgreSQL"
        );

        let (client, connection) = config.producer_config().connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        Ok(Self {
            client,
            connection_task,
            prefix: config.outbox.prefix.clone(),
        })
    }

    /// Creates the users table and the outbox publication when missing.
    pub async fn ensure_schema(&self, publication: &str) -> Result<()> {
        self.client.batch_execute(CREATE_USERS_TABLE).await?;

        let existing = self
            .client
            .query_opt("select 1 from pg_publication where pubname = $1", &[&publication])
            .await?;
        if existing.is_none() {
            // Publication names are validated identifiers, see Config::validate.
            self.client
                .batch_execute(&format!("create publication {}", publication))
                .await?;
            info!(publication, "Created publication");
        } else {
            debug!(publication, "Publication already exists");
        }
        Ok(())
    }

    /// Upserts `user` and emits `message` atomically.
    ///
    /// Both values are encoded before the transaction opens. Any failure
    /// rolls the transaction back when it is dropped.
    pub async fn persist(&mut self, user: &User, message: &Message) -> Result<()> {
        let content = message.serialize()?;

        let tx = self
            .client
            .build_transaction()
            .isolation_level(IsolationLevel::ReadCommitted)
            .read_only(false)
            .start()
            .await?;

        upsert_user(&tx, user).await?;
        emit_message(&tx, &self.prefix, &content).await?;

        tx.commit().await?;
        Ok(())
    }

    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }

    pub async fn close(self) -> Result<()> {
        drop(self.client);
        self.connection_task
            .await
            .map_err(|e| Error::Connection(format!("connection task failed: {}", e)))
    }
}

#[async_trait]
impl OutboxStore for OutboxWriter {
    async fn persist(&mut self, user: &User, message: &Message) -> Result<()> {
        OutboxWriter::persist(self, user, message).await
    }
}

/// Simulated business workload: random user updates, one outbox message each.
pub struct Producer<W = OutboxWriter> {
    writer: W,
    simulated_users: u32,
    report_every: u64,
}

impl<W: OutboxStore> Producer<W> {
    pub fn new(writer: W, config: &Config) -> Self {
        Self {
            writer,
            simulated_users: config.producer.simulated_users.max(1),
            report_every: config.producer.report_every.max(1),
        }
    }

    /// Runs units of work until `cancel` fires.
    ///
    /// Cancellation is checked between units of work; a transaction that has
    /// started always runs to commit or error.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let mut iteration: u64 = 0;

        while !cancel.is_cancelled() {
            let message = self.execute_command(iteration).await?;

            if iteration % self.report_every == 0 {
                info!(
                    iteration,
                    msg = %String::from_utf8_lossy(&message.payload),
                    "write-finished"
                );
            }
            iteration += 1;
        }

        info!(iterations = iteration, "producer stopped");
        Ok(())
    }

    /// Builds one random user update, persists it and returns the message sent.
    pub async fn execute_command(&mut self, iteration: u64) -> Result<Message> {
        let user = random_user(self.simulated_users);
        let message = Message::new(iteration.to_string(), user.serialize()?);

        self.writer.persist(&user, &message).await?;
        Ok(message)
    }

    pub fn store(&self) -> &W {
        &self.writer
    }
}

impl Producer<OutboxWriter> {
    pub async fn close(self) -> Result<()> {
        self.writer.close().await
    }
}

fn random_user(simulated_users: u32) -> User {
    let mut rng = rand::thread_rng();
    let id = rng.gen_range(0..simulated_users).to_string();
    let now = chrono::Utc::now();

    User {
        first_name: format!("user{}", id),
        details: json!({
            "key": now.timestamp(),
            "random": rng.gen_range(0..i64::MAX),
        }),
        birth_date: now,
        id,
    }
}
