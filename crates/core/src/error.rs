//! User-visible error taxonomy
//!
//! The pipeline is the only place that converts lower-level faults into
//! these codes; inside components errors carry a cause chain for logs,
//! and only the taxonomy plus a short message crosses the boundary.

use serde::{Deserialize, Serialize};

/// Terminal error codes surfaced to callers and used in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Queue was full and the submission could not be admitted
    #[serde(rename = "rejected-overload")]
    RejectedOverload,
    /// Submission arrived from an interface with no registered adapter
    #[serde(rename = "adapter-unknown")]
    AdapterUnknown,
    /// Request was cancelled cooperatively
    #[serde(rename = "cancelled")]
    Cancelled,
    /// Deadline expired before a terminal response
    #[serde(rename = "timed_out")]
    TimedOut,
    /// No eligible service for the required capability
    #[serde(rename = "no-service")]
    NoService,
    /// The intent maps to no known capability
    #[serde(rename = "capability-unknown")]
    CapabilityUnknown,
    /// Downstream service returned a structured error
    #[serde(rename = "service-error")]
    ServiceError,
    /// Transport-level failure talking to the service
    #[serde(rename = "transport-error")]
    TransportError,
    /// Unexpected internal fault
    #[serde(rename = "internal-error")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RejectedOverload => "rejected-overload",
            ErrorKind::AdapterUnknown => "adapter-unknown",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::NoService => "no-service",
            ErrorKind::CapabilityUnknown => "capability-unknown",
            ErrorKind::ServiceError => "service-error",
            ErrorKind::TransportError => "transport-error",
            ErrorKind::Internal => "internal-error",
        }
    }

    /// Whether the pipeline may retry after this error on a fresh selection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransportError | ErrorKind::TimedOut)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
