//! Core types and traits for the command orchestrator
//!
//! This crate provides the shared vocabulary used across all other crates:
//! - Command request/result envelopes and the priority bands
//! - The closed intent enumeration with its capability routing table
//! - User, session, and device records
//! - Service descriptors and health states
//! - The user-visible error taxonomy
//! - Narrow traits at component seams (selector, invoker, result sink)

pub mod command;
pub mod error;
pub mod intent;
pub mod records;
pub mod service;
pub mod traits;

pub use command::{
    CommandRequest, CommandResult, CommandSubmission, InterfaceTag, Priority, RequestId,
};
pub use error::ErrorKind;
pub use intent::{Intent, IntentName, ParamValue, Parameters, PARAM_ERRORS_KEY};
pub use records::{DeviceRecord, HistoryEntry, HistoryStatus, SessionRecord, UserRecord};
pub use service::{HealthStatus, ServiceDescriptor, TransportKind};
pub use traits::{
    CallContext, CommandInvoker, InvocationOutcome, InvokeError, ResultSink, ServiceCall,
    ServiceReply, ServiceSelector,
};
