//! Service descriptors and health states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport a service is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    Mqtt,
    Inproc,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Mqtt => "mqtt",
            TransportKind::Inproc => "inproc",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Service health.
///
/// `unhealthy` services are never selected; `degraded` services are
/// selected only after healthy candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Selection rank, lower is preferred. Only `healthy` and `degraded`
    /// are eligible at all.
    pub fn rank(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unknown => 2,
            HealthStatus::Unhealthy => 3,
        }
    }

    pub fn is_selectable(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// One step down the ladder, used for missed-heartbeat demotion.
    pub fn demoted(&self) -> HealthStatus {
        match self {
            HealthStatus::Healthy | HealthStatus::Unknown => HealthStatus::Degraded,
            HealthStatus::Degraded | HealthStatus::Unhealthy => HealthStatus::Unhealthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A downstream service known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique within the registry
    pub name: String,
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    /// Capability tags, in declared order
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
    /// Requests currently dispatched to this service
    #[serde(default)]
    pub in_flight: u32,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    16
}

impl ServiceDescriptor {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        transport: TransportKind,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            transport,
            capabilities: Vec::new(),
            health: HealthStatus::Unknown,
            last_seen: Utc::now(),
            in_flight: 0,
            max_concurrency: default_max_concurrency(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Eligible for selection: selectable health and spare concurrency.
    pub fn is_eligible(&self) -> bool {
        self.health.is_selectable() && self.in_flight < self.max_concurrency
    }

    /// Base URL for HTTP transport.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}
