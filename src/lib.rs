pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod producer;
pub mod tracker;
pub mod user;
pub mod worker;

pub mod postgres;

pub use config::Config;
pub use consumer::{Delivery, MessageSink, ReplicationSession, SessionState};
pub use error::{Error, Result};
pub use message::Message;
pub use user::User;
pub use worker::Mode;
