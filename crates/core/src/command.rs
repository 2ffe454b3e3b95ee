//! Command envelopes
//!
//! `CommandSubmission` is the wire form accepted from front-end adapters,
//! `CommandRequest` the in-flight form owned by the pipeline, and
//! `CommandResult` the terminal form delivered back through UI dispatch.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;

/// Front-end interface a command arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceTag {
    Voice,
    Text,
    Web,
    Mobile,
}

impl InterfaceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceTag::Voice => "voice",
            InterfaceTag::Text => "text",
            InterfaceTag::Web => "web",
            InterfaceTag::Mobile => "mobile",
        }
    }
}

impl std::fmt::Display for InterfaceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Admission priority band.
///
/// Bands control queue ordering and the displacement policy: `critical`
/// and `high` may displace the oldest `low` entry when the queue is full.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Band index, highest priority first. Used to index queue bands.
    pub fn band(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub const COUNT: usize = 4;

    /// Whether this band may displace a queued `low` entry on overflow.
    pub fn displaces(&self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Server-assigned request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(format!("req_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Raw submission as it arrives from a front-end adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSubmission {
    /// Raw natural-language command text
    pub text: String,
    /// Originating interface
    pub interface: InterfaceTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Optional deadline budget in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
}

/// An in-flight command, owned by the pipeline from enqueue to terminal state.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub id: RequestId,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub interface: InterfaceTag,
    pub text: String,
    pub priority: Priority,
    /// When the submission was admitted
    pub submitted_at: Instant,
    /// Absolute effective deadline
    pub deadline: Instant,
    /// Cooperative cancellation token, checked at every stage boundary
    pub cancel: CancellationToken,
}

impl CommandRequest {
    /// Admit a submission, assigning an id and resolving the effective
    /// deadline against the configured default.
    pub fn admit(submission: CommandSubmission, default_deadline: Duration) -> Self {
        let now = Instant::now();
        let budget = submission
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or(default_deadline);
        Self {
            id: RequestId::generate(),
            user_id: submission.user_id,
            session_id: submission.session_id,
            interface: submission.interface,
            text: submission.text,
            priority: submission.priority,
            submitted_at: now,
            deadline: now + budget,
            cancel: CancellationToken::new(),
        }
    }

    /// Remaining deadline budget, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Serialization key for per-session FIFO ordering.
    ///
    /// Requests without a session id fall back to an implicit singleton
    /// keyed by interface + user id; anonymous requests run fully
    /// concurrently.
    pub fn session_key(&self) -> Option<String> {
        if let Some(sid) = &self.session_id {
            return Some(sid.clone());
        }
        self.user_id
            .as_ref()
            .map(|uid| format!("{}:{}", self.interface, uid))
    }

    /// Latency since admission, in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.submitted_at.elapsed().as_millis() as u64
    }
}

/// Terminal result of a command, delivered exactly once to the adapter
/// whose interface tag matches the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub request_id: RequestId,
    pub success: bool,
    /// Response payload; on failure carries the short human-readable message
    pub response: String,
    pub interface: InterfaceTag,
    pub latency_ms: u64,
    /// Terminal error kind, absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl CommandResult {
    /// Successful (or clarify) result.
    pub fn ok(request: &CommandRequest, response: impl Into<String>) -> Self {
        Self {
            request_id: request.id.clone(),
            success: true,
            response: response.into(),
            interface: request.interface,
            latency_ms: request.elapsed_ms(),
            error: None,
        }
    }

    /// Failed result carrying a taxonomy code and a short message.
    pub fn error(request: &CommandRequest, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            request_id: request.id.clone(),
            success: false,
            response: message.into(),
            interface: request.interface,
            latency_ms: request.elapsed_ms(),
            error: Some(kind),
        }
    }
}
