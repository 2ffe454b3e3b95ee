//! Context management
//!
//! The in-memory authoritative view of user, session, and device records
//! with write-through to the persistence port:
//! - Cache on read, write-through on mutate
//! - Transient store failures retried with bounded exponential backoff
//! - TTL-based session expiry driven by a time-sliced background task

pub mod cleanup;
pub mod manager;

pub use cleanup::start_cleanup_task;
pub use manager::ContextManager;

use thiserror::Error;

/// Context operation failures.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("session id collision persisted after regeneration")]
    SessionIdCollision,

    #[error("record codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for ContextError {
    fn from(err: serde_json::Error) -> Self {
        ContextError::Codec(err.to_string())
    }
}
