//! User, session, and device records
//!
//! These are the persisted context entities. The context manager owns the
//! in-memory caches; records serialize to JSON for the persistence port.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::InterfaceTag;
use crate::intent::{IntentName, Parameters};

/// A known user of the platform. Never auto-deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable identity
    pub id: String,
    #[serde(default = "default_language")]
    pub preferred_language: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    pub last_activity: DateTime<Utc>,
    /// Free-form preference key/value pairs
    #[serde(default)]
    pub preferences: HashMap<String, String>,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl UserRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            preferred_language: default_language(),
            timezone: default_timezone(),
            last_activity: Utc::now(),
            preferences: HashMap::new(),
        }
    }
}

/// Outcome marker on a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Completed,
    Failed,
    Cancelled,
}

/// One (command, response) pair in a session's bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub command: String,
    /// Absent for failures that produced no response text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub status: HistoryStatus,
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn completed(command: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            response: Some(response.into()),
            status: HistoryStatus::Completed,
            at: Utc::now(),
        }
    }

    pub fn failed(command: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            response: Some(error.into()),
            status: HistoryStatus::Failed,
            at: Utc::now(),
        }
    }

    pub fn cancelled(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            response: None,
            status: HistoryStatus::Cancelled,
            at: Utc::now(),
        }
    }
}

/// An ongoing conversational context for one user on one interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Server-generated id, `sess_` + 32 hex chars
    pub id: String,
    pub user_id: String,
    pub interface: InterfaceTag,
    pub created_at: DateTime<Utc>,
    /// Monotonically non-decreasing within a session
    pub last_accessed: DateTime<Utc>,
    /// Bounded command history, FIFO eviction
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Session variables
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_intent: Option<IntentName>,
    #[serde(default)]
    pub last_parameters: Parameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_service: Option<String>,
    /// Per-service state, keyed `<service>.<key>`
    #[serde(default)]
    pub service_state: HashMap<String, String>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, interface: InterfaceTag) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: user_id.into(),
            interface,
            created_at: now,
            last_accessed: now,
            history: Vec::new(),
            variables: HashMap::new(),
            last_intent: None,
            last_parameters: Parameters::new(),
            last_service: None,
            service_state: HashMap::new(),
        }
    }

    /// Advance `last_accessed`, keeping it monotonic under clock skew.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_accessed {
            self.last_accessed = now;
        }
    }

    /// Append to history, evicting the oldest entries beyond `cap`.
    pub fn push_history(&mut self, entry: HistoryEntry, cap: usize) {
        self.history.push(entry);
        if self.history.len() > cap {
            let overflow = self.history.len() - cap;
            self.history.drain(..overflow);
        }
    }

    /// The `count` most recent history entries, oldest first.
    pub fn recent_history(&self, count: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(count);
        &self.history[start..]
    }

    /// Whether the session has been idle for at least `ttl`.
    ///
    /// Idle time exactly equal to the TTL counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_accessed >= ttl
    }
}

/// A registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub device_type: String,
    pub platform: String,
    pub version: String,
    /// Capabilities the device advertises
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub last_update: DateTime<Utc>,
    /// Current device state key/value pairs
    #[serde(default)]
    pub state: HashMap<String, String>,
}

impl DeviceRecord {
    pub fn new(
        id: impl Into<String>,
        device_type: impl Into<String>,
        platform: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            device_type: device_type.into(),
            platform: platform.into(),
            version: version.into(),
            capabilities: Vec::new(),
            last_update: Utc::now(),
            state: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_cap_fifo() {
        let mut session = SessionRecord::new("sess_x", "u1", InterfaceTag::Text);
        for i in 0..55 {
            session.push_history(
                HistoryEntry::completed(format!("cmd {}", i), "ok"),
                50,
            );
        }
        assert_eq!(session.history.len(), 50);
        // Oldest five evicted
        assert_eq!(session.history[0].command, "cmd 5");
        assert_eq!(session.history[49].command, "cmd 54");
    }

    #[test]
    fn test_recent_history_clamps() {
        let mut session = SessionRecord::new("sess_x", "u1", InterfaceTag::Text);
        for i in 0..3 {
            session.push_history(HistoryEntry::completed(format!("cmd {}", i), "ok"), 50);
        }
        assert_eq!(session.recent_history(100).len(), 3);
        assert_eq!(session.recent_history(2)[0].command, "cmd 1");
    }

    #[test]
    fn test_ttl_boundary_is_expired() {
        let mut session = SessionRecord::new("sess_x", "u1", InterfaceTag::Voice);
        let ttl = chrono::Duration::minutes(30);
        let now = session.last_accessed + ttl;
        assert!(session.is_expired(now, ttl));
        assert!(!session.is_expired(now - chrono::Duration::seconds(1), ttl));
        session.touch();
    }

    #[test]
    fn test_record_json_round_trip() {
        let mut session = SessionRecord::new("sess_abc", "u1", InterfaceTag::Web);
        session.variables.insert("k".into(), "v".into());
        session.last_intent = Some(IntentName::PlayMusic);
        let bytes = serde_json::to_vec(&session).unwrap();
        let back: SessionRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, session);
    }
}
