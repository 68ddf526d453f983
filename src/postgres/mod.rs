pub mod connection;
pub mod decoder;
pub mod protocol;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;


pub use connection::{QueryRow, ReplicationConnection};
pub use decoder::{
    BeginRecord, CommitRecord, LogicalMessageRecord, LogicalRecord, PgOutputDecoder, XidField,
};
pub use protocol::StreamFrame;
pub use transport::ReplicationTransport;
pub use types::{Lsn, SystemInfo};
