//! Service registry
//!
//! Single-process authoritative view of downstream services:
//! - Capability index with deterministic selection
//! - Health state machine fed by invocation outcomes and heartbeats
//! - Soft-state eviction of services that stay unhealthy
//! - Background heartbeat probing that never blocks dispatch

pub mod health;
pub mod heartbeat;
pub mod registry;

pub use heartbeat::start_heartbeat_task;
pub use registry::ServiceRegistry;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("service {0} is already registered at this endpoint")]
    Conflict(String),

    #[error("service {0} is not registered")]
    NotFound(String),
}
