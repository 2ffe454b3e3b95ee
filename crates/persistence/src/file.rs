//! File-backed record store
//!
//! Layout: `<root>/<kind>/<id>.json`. Writes go through a temp file and
//! rename so a crashed write never leaves a truncated record behind.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{validate_id, RecordKind, RecordStore, StoreError};

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kind_dir(&self, kind: RecordKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> PathBuf {
        self.kind_dir(kind).join(format!("{id}.json"))
    }
}

/// Classify an io error into the port's retry taxonomy.
fn classify(err: io::Error) -> StoreError {
    match err.kind() {
        io::ErrorKind::NotFound => StoreError::NotFound,
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            StoreError::Transient(err.to_string())
        }
        _ => StoreError::Permanent(err.to_string()),
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn save(&self, kind: RecordKind, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_id(id)?;
        let dir = self.kind_dir(kind);
        tokio::fs::create_dir_all(&dir).await.map_err(classify)?;

        let path = self.record_path(kind, id);
        let tmp = dir.join(format!("{id}.json.tmp"));
        tokio::fs::write(&tmp, bytes).await.map_err(classify)?;
        tokio::fs::rename(&tmp, &path).await.map_err(classify)?;

        tracing::trace!(kind = %kind, id = %id, bytes = bytes.len(), "record saved");
        Ok(())
    }

    async fn load(&self, kind: RecordKind, id: &str) -> Result<Vec<u8>, StoreError> {
        validate_id(id)?;
        tokio::fs::read(self.record_path(kind, id))
            .await
            .map_err(classify)
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        validate_id(id)?;
        tokio::fs::remove_file(self.record_path(kind, id))
            .await
            .map_err(classify)
    }

    async fn list_ids(&self, kind: RecordKind) -> Result<Vec<String>, StoreError> {
        let dir = self.kind_dir(kind);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // A kind with no records yet has no directory
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(classify(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(classify)? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_round_trip_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let bytes = br#"{"id":"u1","preferences":{}}"#;
        store.save(RecordKind::User, "u1", bytes).await.unwrap();
        let loaded = store.load(RecordKind::User, "u1").await.unwrap();
        assert_eq!(loaded, bytes);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let err = store.load(RecordKind::Session, "sess_missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_in_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.save(RecordKind::Device, "d1", b"{}").await.unwrap();
        store.delete(RecordKind::Device, "d1").await.unwrap();
        let err = store.delete(RecordKind::Device, "d1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.save(RecordKind::User, "u1", b"v1").await.unwrap();
        store.save(RecordKind::User, "u1", b"v2").await.unwrap();
        assert_eq!(store.load(RecordKind::User, "u1").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_list_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        assert!(store.list_ids(RecordKind::Session).await.unwrap().is_empty());
        store.save(RecordKind::Session, "sess_b", b"{}").await.unwrap();
        store.save(RecordKind::Session, "sess_a", b"{}").await.unwrap();
        assert_eq!(
            store.list_ids(RecordKind::Session).await.unwrap(),
            vec!["sess_a".to_string(), "sess_b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let err = store.save(RecordKind::User, "../evil", b"{}").await.unwrap_err();
        assert!(matches!(err, StoreError::Permanent(_)));
    }
}
