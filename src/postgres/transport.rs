use async_trait::async_trait;
use bytes::Bytes;

use super::types::{Lsn, SystemInfo};
use crate::Result;

/// The replication-connection operations a session drives.
///
/// [`super::ReplicationConnection`] implements this over a socket; tests
/// script it in memory.
#[async_trait]
pub trait ReplicationTransport: Send {
    /// Creates a pgoutput logical slot. An existing slot is not an error.
    async fn create_replication_slot(&mut self, slot_name: &str) -> Result<()>;

    async fn identify_system(&mut self) -> Result<SystemInfo>;

    /// Issues `START_REPLICATION` and returns once the stream is in CopyBoth mode.
    async fn start_replication(
        &mut self,
        slot_name: &str,
        start: Lsn,
        plugin_args: &[String],
    ) -> Result<()>;

    /// Next CopyData payload from the server.
    ///
    /// Must be cancel safe: dropping the future before it completes loses no
    /// bytes, so callers may race it against a timer or cancellation.
    async fn recv_copy_data(&mut self) -> Result<Bytes>;

    async fn send_copy_data(&mut self, payload: Bytes) -> Result<()>;

    /// Releases the connection. Calling it again is a no-op.
    async fn close(&mut self) -> Result<()>;
}
