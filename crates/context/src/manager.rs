//! Context manager
//!
//! Owns the user/session/device caches. Mutations are serialized per
//! record id, written through to the persistence port, and only then
//! reflected in the cache, so a failed write never leaves the cache
//! ahead of the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;

use orchestrator_config::SessionConfig;
use orchestrator_core::{
    DeviceRecord, HistoryEntry, IntentName, InterfaceTag, Parameters, SessionRecord, UserRecord,
};
use orchestrator_persistence::{RecordKind, RecordStore, StoreError};

use crate::ContextError;

/// Bounded retry for transient store failures.
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_CAP: Duration = Duration::from_millis(500);

/// Per-id write serialization across cache mutation and persistence.
#[derive(Default)]
struct WriteLocks {
    locks: Mutex<HashMap<(RecordKind, String), Arc<AsyncMutex<()>>>>,
}

impl WriteLocks {
    fn get(&self, kind: RecordKind, id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry((kind, id.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn forget(&self, kind: RecordKind, id: &str) {
        self.locks.lock().remove(&(kind, id.to_string()));
    }
}

pub struct ContextManager {
    store: Arc<dyn RecordStore>,
    config: SessionConfig,
    users: RwLock<HashMap<String, UserRecord>>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    write_locks: WriteLocks,
}

impl ContextManager {
    pub fn new(store: Arc<dyn RecordStore>, config: SessionConfig) -> Self {
        Self {
            store,
            config,
            users: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
            write_locks: WriteLocks::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Load persisted sessions into the cache so the TTL sweep also
    /// covers sessions from before a restart.
    pub async fn warm_up(&self) -> Result<usize, ContextError> {
        let ids = self
            .store
            .list_ids(RecordKind::Session)
            .await
            .map_err(|e| ContextError::Persistence(e.to_string()))?;

        let mut loaded = 0;
        for id in ids {
            match self.store.load(RecordKind::Session, &id).await {
                Ok(bytes) => match serde_json::from_slice::<SessionRecord>(&bytes) {
                    Ok(record) => {
                        self.sessions.write().insert(id, record);
                        loaded += 1;
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %id, error = %e, "skipping corrupt session record");
                    }
                },
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "failed to load session record");
                }
            }
        }
        tracing::info!(count = loaded, "session cache warmed up");
        Ok(loaded)
    }

    async fn persist(&self, kind: RecordKind, id: &str, bytes: &[u8]) -> Result<(), ContextError> {
        let mut delay = RETRY_BASE;
        for attempt in 1..=RETRY_ATTEMPTS {
            match self.store.save(kind, id, bytes).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                    tracing::debug!(
                        kind = %kind,
                        id = %id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RETRY_CAP);
                }
                Err(e) => return Err(ContextError::Persistence(e.to_string())),
            }
        }
        unreachable!("retry loop always returns")
    }

    // ---- users ----

    pub async fn create_user(&self, record: UserRecord) -> Result<(), ContextError> {
        let id = record.id.clone();
        let lock = self.write_locks.get(RecordKind::User, &id);
        let _guard = lock.lock().await;

        if self.user_exists(&id).await? {
            return Err(ContextError::AlreadyExists(format!("user {id}")));
        }

        let bytes = serde_json::to_vec(&record)?;
        self.persist(RecordKind::User, &id, &bytes).await?;
        self.users.write().insert(id.clone(), record);
        tracing::info!(user_id = %id, "user created");
        Ok(())
    }

    /// Full-record replacement; callers read-modify-write.
    pub async fn update_user(&self, id: &str, mut record: UserRecord) -> Result<(), ContextError> {
        let lock = self.write_locks.get(RecordKind::User, id);
        let _guard = lock.lock().await;

        if !self.user_exists(id).await? {
            return Err(ContextError::NotFound(format!("user {id}")));
        }

        record.id = id.to_string();
        record.last_activity = chrono::Utc::now();
        let bytes = serde_json::to_vec(&record)?;
        self.persist(RecordKind::User, id, &bytes).await?;
        self.users.write().insert(id.to_string(), record);
        Ok(())
    }

    pub async fn get_user_context(&self, id: &str) -> Result<UserRecord, ContextError> {
        if let Some(record) = self.users.read().get(id) {
            return Ok(record.clone());
        }
        let record: UserRecord = self.load_record(RecordKind::User, id, "user").await?;
        self.users.write().insert(id.to_string(), record.clone());
        Ok(record)
    }

    pub async fn delete_user(&self, id: &str) -> Result<(), ContextError> {
        let lock = self.write_locks.get(RecordKind::User, id);
        let _guard = lock.lock().await;

        let cached = self.users.write().remove(id).is_some();
        match self.store.delete(RecordKind::User, id).await {
            Ok(()) => {}
            Err(StoreError::NotFound) if cached => {}
            Err(StoreError::NotFound) => {
                return Err(ContextError::NotFound(format!("user {id}")));
            }
            Err(e) => return Err(ContextError::Persistence(e.to_string())),
        }
        drop(_guard);
        self.write_locks.forget(RecordKind::User, id);
        tracing::info!(user_id = %id, "user deleted");
        Ok(())
    }

    async fn user_exists(&self, id: &str) -> Result<bool, ContextError> {
        if self.users.read().contains_key(id) {
            return Ok(true);
        }
        match self.store.load(RecordKind::User, id).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(ContextError::Persistence(e.to_string())),
        }
    }

    // ---- sessions ----

    /// Create a session for a user on an interface, persisting
    /// immediately. Collisions of the generated id are treated as fatal
    /// after one regeneration.
    pub async fn create_session(
        &self,
        user_id: &str,
        interface: InterfaceTag,
    ) -> Result<SessionRecord, ContextError> {
        let mut id = generate_session_id();
        if self.session_id_taken(&id).await? {
            tracing::warn!(session_id = %id, "session id collision, regenerating");
            id = generate_session_id();
            if self.session_id_taken(&id).await? {
                return Err(ContextError::SessionIdCollision);
            }
        }

        let record = SessionRecord::new(&id, user_id, interface);
        let bytes = serde_json::to_vec(&record)?;
        self.persist(RecordKind::Session, &id, &bytes).await?;
        self.sessions.write().insert(id.clone(), record.clone());
        tracing::info!(session_id = %id, user_id = %user_id, interface = %interface, "session created");
        Ok(record)
    }

    async fn session_id_taken(&self, id: &str) -> Result<bool, ContextError> {
        if self.sessions.read().contains_key(id) {
            return Ok(true);
        }
        match self.store.load(RecordKind::Session, id).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(ContextError::Persistence(e.to_string())),
        }
    }

    /// Fetch a session, touching `last_accessed`.
    pub async fn get_session_context(&self, id: &str) -> Result<SessionRecord, ContextError> {
        self.mutate_session(id, |record| record.touch()).await
    }

    /// Peek at a session without touching `last_accessed`.
    pub async fn peek_session(&self, id: &str) -> Result<SessionRecord, ContextError> {
        self.session_snapshot(id).await
    }

    /// Full-record replacement. `last_accessed` stays monotonic even if
    /// the caller hands back an older timestamp.
    pub async fn update_session(
        &self,
        id: &str,
        record: SessionRecord,
    ) -> Result<(), ContextError> {
        self.mutate_session(id, move |current| {
            let floor = current.last_accessed;
            *current = record;
            current.id = id.to_string();
            if current.last_accessed < floor {
                current.last_accessed = floor;
            }
            current.touch();
        })
        .await
        .map(|_| ())
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), ContextError> {
        let lock = self.write_locks.get(RecordKind::Session, id);
        let _guard = lock.lock().await;

        let cached = self.sessions.write().remove(id).is_some();
        match self.store.delete(RecordKind::Session, id).await {
            Ok(()) => {}
            Err(StoreError::NotFound) if cached => {}
            Err(StoreError::NotFound) => {
                return Err(ContextError::NotFound(format!("session {id}")));
            }
            Err(e) => return Err(ContextError::Persistence(e.to_string())),
        }
        drop(_guard);
        self.write_locks.forget(RecordKind::Session, id);
        tracing::info!(session_id = %id, "session deleted");
        Ok(())
    }

    /// Append a command/response pair to the bounded history.
    pub async fn add_command_to_history(
        &self,
        id: &str,
        entry: HistoryEntry,
    ) -> Result<(), ContextError> {
        let cap = self.config.history_limit;
        self.mutate_session(id, move |record| {
            record.push_history(entry, cap);
            record.touch();
        })
        .await
        .map(|_| ())
    }

    pub async fn set_session_variable(
        &self,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ContextError> {
        let key = key.to_string();
        let value = value.to_string();
        self.mutate_session(id, move |record| {
            record.variables.insert(key, value);
            record.touch();
        })
        .await
        .map(|_| ())
    }

    pub async fn get_session_variable(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<String>, ContextError> {
        let record = self.session_snapshot(id).await?;
        Ok(record.variables.get(key).cloned())
    }

    /// Record the classified intent and its parameters for contextual
    /// inference on the next command.
    pub async fn update_last_intent(
        &self,
        id: &str,
        intent: IntentName,
        parameters: Parameters,
    ) -> Result<(), ContextError> {
        self.mutate_session(id, move |record| {
            record.last_intent = Some(intent);
            record.last_parameters = parameters;
            record.touch();
        })
        .await
        .map(|_| ())
    }

    pub async fn update_last_service(&self, id: &str, service: &str) -> Result<(), ContextError> {
        let service = service.to_string();
        self.mutate_session(id, move |record| {
            record.last_service = Some(service);
            record.touch();
        })
        .await
        .map(|_| ())
    }

    /// Merge a service's state map under `<service>.<key>`.
    pub async fn update_service_state(
        &self,
        id: &str,
        service: &str,
        state: HashMap<String, String>,
    ) -> Result<(), ContextError> {
        let service = service.to_string();
        self.mutate_session(id, move |record| {
            for (key, value) in state {
                record.service_state.insert(format!("{service}.{key}"), value);
            }
            record.touch();
        })
        .await
        .map(|_| ())
    }

    /// The `count` most recent history entries, oldest first.
    pub async fn get_recent_commands(
        &self,
        id: &str,
        count: usize,
    ) -> Result<Vec<HistoryEntry>, ContextError> {
        let record = self.session_snapshot(id).await?;
        Ok(record.recent_history(count).to_vec())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Remove sessions idle for at least the configured TTL, yielding to
    /// the runtime whenever a scan slice is used up so cleanup never
    /// starves dispatch.
    pub async fn cleanup_expired_sessions(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.ttl()).unwrap_or(chrono::Duration::MAX);
        let slice = self.config.cleanup_slice();
        let now = chrono::Utc::now();

        let expired: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, record)| record.is_expired(now, ttl))
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0;
        let mut slice_start = std::time::Instant::now();
        for id in expired {
            if slice_start.elapsed() >= slice {
                tokio::task::yield_now().await;
                slice_start = std::time::Instant::now();
            }

            let lock = self.write_locks.get(RecordKind::Session, &id);
            let _guard = lock.lock().await;

            // Re-check: the session may have been touched since the scan.
            let still_expired = self
                .sessions
                .read()
                .get(&id)
                .map(|record| record.is_expired(now, ttl))
                .unwrap_or(false);
            if !still_expired {
                continue;
            }

            self.sessions.write().remove(&id);
            if let Err(e) = self.store.delete(RecordKind::Session, &id).await {
                if !matches!(e, StoreError::NotFound) {
                    tracing::warn!(session_id = %id, error = %e, "failed to delete expired session");
                }
            }
            drop(_guard);
            self.write_locks.forget(RecordKind::Session, &id);
            removed += 1;
            tracing::debug!(session_id = %id, "expired session removed");
        }
        removed
    }

    async fn session_snapshot(&self, id: &str) -> Result<SessionRecord, ContextError> {
        if let Some(record) = self.sessions.read().get(id) {
            return Ok(record.clone());
        }
        let record: SessionRecord = self.load_record(RecordKind::Session, id, "session").await?;
        self.sessions.write().insert(id.to_string(), record.clone());
        Ok(record)
    }

    async fn mutate_session<F>(&self, id: &str, mutate: F) -> Result<SessionRecord, ContextError>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let lock = self.write_locks.get(RecordKind::Session, id);
        let _guard = lock.lock().await;

        let mut record = self.session_snapshot(id).await?;
        mutate(&mut record);

        let bytes = serde_json::to_vec(&record)?;
        self.persist(RecordKind::Session, id, &bytes).await?;
        self.sessions.write().insert(id.to_string(), record.clone());
        Ok(record)
    }

    // ---- devices ----

    /// Register (or re-register) a device.
    pub async fn register_device(&self, mut record: DeviceRecord) -> Result<(), ContextError> {
        let id = record.id.clone();
        let lock = self.write_locks.get(RecordKind::Device, &id);
        let _guard = lock.lock().await;

        record.last_update = chrono::Utc::now();
        let bytes = serde_json::to_vec(&record)?;
        self.persist(RecordKind::Device, &id, &bytes).await?;
        self.devices.write().insert(id.clone(), record);
        tracing::info!(device_id = %id, "device registered");
        Ok(())
    }

    pub async fn get_device_context(&self, id: &str) -> Result<DeviceRecord, ContextError> {
        if let Some(record) = self.devices.read().get(id) {
            return Ok(record.clone());
        }
        let record: DeviceRecord = self.load_record(RecordKind::Device, id, "device").await?;
        self.devices.write().insert(id.to_string(), record.clone());
        Ok(record)
    }

    /// Merge one key into the device's current-state map.
    pub async fn update_device_state(
        &self,
        id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ContextError> {
        let lock = self.write_locks.get(RecordKind::Device, id);
        let _guard = lock.lock().await;

        let existing = self.devices.read().get(id).cloned();
        let mut record = match existing {
            Some(record) => record,
            None => self.load_record(RecordKind::Device, id, "device").await?,
        };
        record.state.insert(key.to_string(), value.to_string());
        record.last_update = chrono::Utc::now();

        let bytes = serde_json::to_vec(&record)?;
        self.persist(RecordKind::Device, id, &bytes).await?;
        self.devices.write().insert(id.to_string(), record);
        Ok(())
    }

    pub async fn delete_device(&self, id: &str) -> Result<(), ContextError> {
        let lock = self.write_locks.get(RecordKind::Device, id);
        let _guard = lock.lock().await;

        let cached = self.devices.write().remove(id).is_some();
        match self.store.delete(RecordKind::Device, id).await {
            Ok(()) => {}
            Err(StoreError::NotFound) if cached => {}
            Err(StoreError::NotFound) => {
                return Err(ContextError::NotFound(format!("device {id}")));
            }
            Err(e) => return Err(ContextError::Persistence(e.to_string())),
        }
        drop(_guard);
        self.write_locks.forget(RecordKind::Device, id);
        Ok(())
    }

    async fn load_record<T: serde::de::DeserializeOwned>(
        &self,
        kind: RecordKind,
        id: &str,
        what: &str,
    ) -> Result<T, ContextError> {
        match self.store.load(kind, id).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(StoreError::NotFound) => Err(ContextError::NotFound(format!("{what} {id}"))),
            Err(e) => Err(ContextError::Persistence(e.to_string())),
        }
    }
}

/// 128 bits of cryptographic randomness, hex-encoded with a `sess_` prefix.
fn generate_session_id() -> String {
    format!("sess_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_persistence::MemoryStore;

    fn manager() -> ContextManager {
        ContextManager::new(Arc::new(MemoryStore::new()), SessionConfig::default())
    }

    #[tokio::test]
    async fn test_session_id_shape() {
        let id = generate_session_id();
        assert!(id.starts_with("sess_"));
        assert_eq!(id.len(), "sess_".len() + 32);
        assert!(id["sess_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let manager = manager();
        let user = UserRecord::new("u1");

        manager.create_user(user.clone()).await.unwrap();
        assert!(matches!(
            manager.create_user(user).await.unwrap_err(),
            ContextError::AlreadyExists(_)
        ));

        let mut fetched = manager.get_user_context("u1").await.unwrap();
        fetched.preferences.insert("voice".into(), "alloy".into());
        manager.update_user("u1", fetched).await.unwrap();
        let fetched = manager.get_user_context("u1").await.unwrap();
        assert_eq!(fetched.preferences.get("voice").map(String::as_str), Some("alloy"));

        manager.delete_user("u1").await.unwrap();
        // Idempotence law: the second delete reports not-found, not a fault
        assert!(matches!(
            manager.delete_user("u1").await.unwrap_err(),
            ContextError::NotFound(_)
        ));
        assert!(matches!(
            manager.get_user_context("u1").await.unwrap_err(),
            ContextError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_session_create_and_touch_monotonic() {
        let manager = manager();
        let session = manager
            .create_session("u1", InterfaceTag::Voice)
            .await
            .unwrap();

        let before = session.last_accessed;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let touched = manager.get_session_context(&session.id).await.unwrap();
        assert!(touched.last_accessed >= before);
    }

    #[tokio::test]
    async fn test_history_bounded_and_recent() {
        let manager = manager();
        let session = manager
            .create_session("u1", InterfaceTag::Text)
            .await
            .unwrap();

        for i in 0..51 {
            manager
                .add_command_to_history(
                    &session.id,
                    HistoryEntry::completed(format!("cmd {i}"), "ok"),
                )
                .await
                .unwrap();
        }

        let recent = manager.get_recent_commands(&session.id, 100).await.unwrap();
        assert_eq!(recent.len(), 50);
        assert_eq!(recent[0].command, "cmd 1");
        assert_eq!(recent[49].command, "cmd 50");
    }

    #[tokio::test]
    async fn test_session_variables_and_service_state() {
        let manager = manager();
        let session = manager
            .create_session("u1", InterfaceTag::Web)
            .await
            .unwrap();

        manager
            .set_session_variable(&session.id, "volume", "40")
            .await
            .unwrap();
        assert_eq!(
            manager
                .get_session_variable(&session.id, "volume")
                .await
                .unwrap()
                .as_deref(),
            Some("40")
        );

        let mut state = HashMap::new();
        state.insert("playlist".to_string(), "jazz".to_string());
        manager
            .update_service_state(&session.id, "music-player", state)
            .await
            .unwrap();
        let record = manager.peek_session(&session.id).await.unwrap();
        assert_eq!(
            record.service_state.get("music-player.playlist").map(String::as_str),
            Some("jazz")
        );
    }

    #[tokio::test]
    async fn test_delete_session_then_get_is_not_found() {
        let manager = manager();
        let session = manager
            .create_session("u1", InterfaceTag::Mobile)
            .await
            .unwrap();

        manager.delete_session(&session.id).await.unwrap();
        assert!(matches!(
            manager.get_session_context(&session.id).await.unwrap_err(),
            ContextError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_transient_store_failures_are_retried() {
        let store = Arc::new(MemoryStore::new());
        let manager = ContextManager::new(store.clone(), SessionConfig::default());

        // Two transient failures, third attempt lands
        store.fail_transient(2);
        manager.create_user(UserRecord::new("u1")).await.unwrap();
        assert!(manager.get_user_context("u1").await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_sessions() {
        let store = Arc::new(MemoryStore::new());
        let config = SessionConfig {
            ttl_minutes: 0, // everything is instantly expired
            ..SessionConfig::default()
        };
        let manager = ContextManager::new(store, config);

        let session = manager
            .create_session("u1", InterfaceTag::Voice)
            .await
            .unwrap();
        let removed = manager.cleanup_expired_sessions().await;
        assert_eq!(removed, 1);
        assert!(matches!(
            manager.get_session_context(&session.id).await.unwrap_err(),
            ContextError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_device_state_merge() {
        let manager = manager();
        let device = DeviceRecord::new("pi-livingroom", "speaker", "linux", "1.2.0");
        manager.register_device(device).await.unwrap();

        manager
            .update_device_state("pi-livingroom", "output", "hdmi")
            .await
            .unwrap();
        let record = manager.get_device_context("pi-livingroom").await.unwrap();
        assert_eq!(record.state.get("output").map(String::as_str), Some("hdmi"));

        manager.delete_device("pi-livingroom").await.unwrap();
        assert!(manager.get_device_context("pi-livingroom").await.is_err());
    }

    #[tokio::test]
    async fn test_warm_up_restores_persisted_sessions() {
        let store = Arc::new(MemoryStore::new());
        let session_id = {
            let manager = ContextManager::new(store.clone(), SessionConfig::default());
            manager
                .create_session("u1", InterfaceTag::Text)
                .await
                .unwrap()
                .id
        };

        let restarted = ContextManager::new(store, SessionConfig::default());
        assert_eq!(restarted.session_count(), 0);
        let loaded = restarted.warm_up().await.unwrap();
        assert_eq!(loaded, 1);
        assert!(restarted.get_session_context(&session_id).await.is_ok());
    }
}
