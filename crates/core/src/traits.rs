//! Traits at component seams
//!
//! The pipeline depends on the registry and invoker only through the
//! narrow `ServiceSelector` and `CommandInvoker` traits, and delivers
//! results through `ResultSink`; nothing is passed back upward, which
//! keeps the component graph acyclic.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::command::CommandResult;
use crate::intent::{IntentName, Parameters};
use crate::service::ServiceDescriptor;

/// Per-call context forwarded to downstream services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

/// Request payload sent to a downstream service, on every transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    pub intent: IntentName,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub context: CallContext,
}

/// Response payload returned by a downstream service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Invocation failure classification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvokeError {
    #[error("invocation timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("service error: {0}")]
    Service(String),
    #[error("invocation cancelled")]
    Cancelled,
    #[error("no service available")]
    NoService,
}

/// How an attempt ended, for registry health accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    Success,
    /// Structured downstream error (5xx-equivalent)
    SoftFailure,
    /// Timeout or transport failure
    HardFailure,
    /// Cancelled before completion; does not count against health
    Abandoned,
}

/// Picks service instances for capabilities and accounts in-flight load.
///
/// `acquire` atomically reserves a concurrency slot on the chosen
/// instance; every successful `acquire` must be matched by exactly one
/// `release`.
pub trait ServiceSelector: Send + Sync {
    /// Select the best eligible instance for a capability, incrementing
    /// its in-flight count. `None` when no eligible instance exists.
    fn acquire(&self, capability: &str) -> Option<ServiceDescriptor>;

    /// Return a previously acquired slot, reporting the attempt outcome
    /// and its latency.
    fn release(&self, name: &str, outcome: InvocationOutcome, latency: Duration);
}

/// Transport-agnostic single-shot invocation of a selected service.
#[async_trait]
pub trait CommandInvoker: Send + Sync {
    async fn invoke(
        &self,
        service: &ServiceDescriptor,
        call: &ServiceCall,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ServiceReply, InvokeError>;
}

/// Receives terminal command results from the pipeline.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn deliver(&self, result: CommandResult);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_call_wire_form() {
        let call = ServiceCall {
            intent: IntentName::PlayMusic,
            parameters: Parameters::new(),
            context: CallContext {
                user_id: Some("u1".into()),
                session_id: None,
                locale: None,
            },
        };
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["intent"], "play_music");
        assert_eq!(json["context"]["userId"], "u1");
        assert!(json["context"].get("sessionId").is_none());
    }

    #[test]
    fn test_service_reply_defaults() {
        let reply: ServiceReply = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(reply.success);
        assert!(reply.response.is_none());
        assert!(reply.error.is_none());
    }
}
