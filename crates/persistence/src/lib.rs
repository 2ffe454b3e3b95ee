//! Persistence port
//!
//! A deliberately narrow contract: save/load/delete of opaque byte blobs
//! keyed by record kind and id. The core never assumes a richer query
//! model, so any store that can round-trip bytes satisfies it.
//!
//! - `FileStore` - one directory per kind, one JSON file per id
//! - `MemoryStore` - in-process map, used in tests and for ephemeral runs

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

/// Entity kinds the port partitions records by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    User,
    Session,
    Device,
}

impl RecordKind {
    /// Directory name for the file backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::User => "users",
            RecordKind::Session => "sessions",
            RecordKind::Device => "devices",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Store failures, classified for the caller's retry policy.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    /// Retry is safe
    #[error("transient store error: {0}")]
    Transient(String),

    /// Do not retry
    #[error("permanent store error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// The persistence port. All operations are idempotent.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write the record bytes, replacing any previous value.
    async fn save(&self, kind: RecordKind, id: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Read the record bytes. `StoreError::NotFound` when absent.
    async fn load(&self, kind: RecordKind, id: &str) -> Result<Vec<u8>, StoreError>;

    /// Delete the record. `StoreError::NotFound` when it was absent.
    async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError>;

    /// List all ids of a kind. Used only by startup warm-up and cleanup,
    /// never on the dispatch path.
    async fn list_ids(&self, kind: RecordKind) -> Result<Vec<String>, StoreError>;
}

/// Ids become file names; reject anything that could escape the root.
pub(crate) fn validate_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty()
        || id.contains('/')
        || id.contains('\\')
        || id.contains("..")
        || id.starts_with('.')
    {
        return Err(StoreError::Permanent(format!("invalid record id: {id:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_directories() {
        assert_eq!(RecordKind::User.as_str(), "users");
        assert_eq!(RecordKind::Session.as_str(), "sessions");
        assert_eq!(RecordKind::Device.as_str(), "devices");
    }

    #[test]
    fn test_id_validation() {
        assert!(validate_id("sess_0123abcd").is_ok());
        assert!(validate_id("../etc/passwd").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("").is_err());
        assert!(validate_id(".hidden").is_err());
    }
}
