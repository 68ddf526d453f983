//! Error types and result handling for pg-outbox.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_outbox::{Error, Result};
//!
//! fn start_session() -> Result<()> {
//!     Err(Error::Replication {
//!         message: "identify-system failed".to_string(),
//!     })
//! }
//!
//! match start_session() {
//!     Ok(()) => println!("Streaming"),
//!     Err(Error::Replication { message }) => eprintln!("Handshake failed: {}", message),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-outbox operations.
///
/// Every variant except [`Error::Timeout`] ends the session or the unit of
/// work that raised it. Receive timeouts inside the streaming loop are not
/// errors and never surface as this type.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error from the file or environment layers, or validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client error on the producer connection.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// JSON encoding or decoding of a message or entity failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Socket error on the replication connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection could not be established or was closed by the peer.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Authentication failure or unsupported authentication method.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// ErrorResponse sent by the server.
    #[error("Server error: {message} (SQLSTATE {code})")]
    Server {
        /// SQLSTATE code
        code: String,
        /// Primary human-readable message
        message: String,
    },

    /// Unexpected backend message or malformed envelope.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Replication handshake failure or session misuse.
    #[error("Replication error: {message}")]
    Replication {
        /// Description of the replication error
        message: String,
    },

    /// A record in the replication stream could not be decoded.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of what was malformed
        message: String,
    },
}

impl Error {
    pub(crate) fn decode(message: impl Into<String>) -> Self {
        Error::Decode {
            message: message.into(),
        }
    }

    pub(crate) fn replication(message: impl Into<String>) -> Self {
        Error::Replication {
            message: message.into(),
        }
    }

    /// Returns `true` if a record failed to decode.
    pub fn is_decode(&self) -> bool {
        matches!(self, Error::Decode { .. })
    }

    /// Returns `true` if the server answered with an ErrorResponse.
    pub fn is_server(&self) -> bool {
        matches!(self, Error::Server { .. })
    }

    /// SQLSTATE of a server error, if this is one.
    pub fn server_code(&self) -> Option<&str> {
        match self {
            Error::Server { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

/// A convenient Result type alias for pg-outbox operations.
///
/// This is equivalent to `std::result::Result<T, pg_outbox::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
