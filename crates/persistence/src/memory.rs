//! In-memory record store
//!
//! Backs tests and ephemeral runs. Supports scripted transient failures
//! so callers can exercise their retry paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{validate_id, RecordKind, RecordStore, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<(RecordKind, String), Vec<u8>>>,
    /// Number of upcoming operations that fail with `Transient`
    transient_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with a transient error.
    pub fn fail_transient(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check_injected_failure(&self) -> Result<(), StoreError> {
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .transient_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StoreError::Transient("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn save(&self, kind: RecordKind, id: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_id(id)?;
        self.check_injected_failure()?;
        self.records
            .write()
            .insert((kind, id.to_string()), bytes.to_vec());
        Ok(())
    }

    async fn load(&self, kind: RecordKind, id: &str) -> Result<Vec<u8>, StoreError> {
        validate_id(id)?;
        self.check_injected_failure()?;
        self.records
            .read()
            .get(&(kind, id.to_string()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        validate_id(id)?;
        self.check_injected_failure()?;
        self.records
            .write()
            .remove(&(kind, id.to_string()))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn list_ids(&self, kind: RecordKind) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .records
            .read()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
