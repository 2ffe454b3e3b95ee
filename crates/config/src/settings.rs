//! Settings tree
//!
//! Every knob has a default; a bare binary starts with no file at all.
//! File values are overridden by `ORCHESTRATOR_`-prefixed environment
//! variables (e.g. `ORCHESTRATOR_PIPELINE__WORKER_COUNT=16`).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Root settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,
}

/// HTTP server binding and CORS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Emit logs as JSON instead of human-readable lines
    #[serde(default)]
    pub log_json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8900
}
fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            log_json: false,
        }
    }
}

/// Session lifetime and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle minutes before a session is eligible for eviction
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,

    /// Per-tick budget for the cleanup scan, so cleanup never stalls
    /// command dispatch
    #[serde(default = "default_cleanup_slice_ms")]
    pub cleanup_slice_ms: u64,

    /// History cap per session, FIFO eviction beyond it
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_ttl_minutes() -> u64 {
    30
}
fn default_cleanup_interval() -> u64 {
    60
}
fn default_cleanup_slice_ms() -> u64 {
    10
}
fn default_history_limit() -> usize {
    50
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_minutes: default_ttl_minutes(),
            cleanup_interval_seconds: default_cleanup_interval(),
            cleanup_slice_ms: default_cleanup_slice_ms(),
            history_limit: default_history_limit(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes * 60)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn cleanup_slice(&self) -> Duration {
        Duration::from_millis(self.cleanup_slice_ms)
    }
}

/// Queue, workers, deadlines, retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,

    /// Per-attempt cap; each attempt runs under
    /// min(remaining deadline, this cap)
    #[serde(default = "default_attempt_cap_ms")]
    pub per_attempt_cap_ms: u64,

    /// Shutdown drain window before remaining requests are cancelled
    #[serde(default = "default_drain_grace")]
    pub drain_grace_seconds: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_queue_capacity() -> usize {
    1024
}
fn default_worker_count() -> usize {
    8
}
fn default_deadline_ms() -> u64 {
    10_000
}
fn default_attempt_cap_ms() -> u64 {
    5_000
}
fn default_drain_grace() -> u64 {
    30
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            worker_count: default_worker_count(),
            default_deadline_ms: default_deadline_ms(),
            per_attempt_cap_ms: default_attempt_cap_ms(),
            drain_grace_seconds: default_drain_grace(),
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn per_attempt_cap(&self) -> Duration {
        Duration::from_millis(self.per_attempt_cap_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_seconds)
    }
}

/// Pipeline retry policy for transport/timeout failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,

    #[serde(default = "default_retry_cap_ms")]
    pub cap_ms: u64,

    /// Jitter applied to each delay, in percent of the delay
    #[serde(default = "default_retry_jitter")]
    pub jitter_pct: u32,
}

fn default_retry_attempts() -> u32 {
    2
}
fn default_retry_base_ms() -> u64 {
    100
}
fn default_retry_cap_ms() -> u64 {
    2_000
}
fn default_retry_jitter() -> u32 {
    20
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_ms: default_retry_base_ms(),
            cap_ms: default_retry_cap_ms(),
            jitter_pct: default_retry_jitter(),
        }
    }
}

/// Registry health checking and eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Continuous unhealthy minutes before a service is evicted
    #[serde(default = "default_eviction_minutes")]
    pub eviction_minutes: u64,

    /// Consecutive failed heartbeat probes before removal
    #[serde(default = "default_max_failed_heartbeats")]
    pub max_failed_heartbeats: u32,

    /// Fallback p95 latency threshold for degradation
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,

    /// Per-capability overrides of the latency threshold
    #[serde(default)]
    pub latency_thresholds_ms: HashMap<String, u64>,
}

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_probe_timeout_ms() -> u64 {
    2_000
}
fn default_eviction_minutes() -> u64 {
    10
}
fn default_max_failed_heartbeats() -> u32 {
    5
}
fn default_latency_threshold_ms() -> u64 {
    1_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            probe_timeout_ms: default_probe_timeout_ms(),
            eviction_minutes: default_eviction_minutes(),
            max_failed_heartbeats: default_max_failed_heartbeats(),
            latency_threshold_ms: default_latency_threshold_ms(),
            latency_thresholds_ms: HashMap::new(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn eviction_window(&self) -> Duration {
        Duration::from_secs(self.eviction_minutes * 60)
    }

    /// Latency threshold for a capability, falling back to the default.
    pub fn latency_threshold(&self, capability: &str) -> Duration {
        let ms = self
            .latency_thresholds_ms
            .get(capability)
            .copied()
            .unwrap_or(self.latency_threshold_ms);
        Duration::from_millis(ms)
    }
}

/// Persistence backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: PersistenceBackend,

    /// Root directory for the file backend
    #[serde(default = "default_persistence_root")]
    pub root: String,
}

fn default_persistence_root() -> String {
    "data".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::default(),
            root: default_persistence_root(),
        }
    }
}

/// MQTT broker connection for the mqtt transport. Disabled by default;
/// mqtt-transport services fail with a transport error until enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_mqtt_host")]
    pub broker_host: String,

    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,

    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_mqtt_client_id() -> String {
    "command-orchestrator".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_host: default_mqtt_host(),
            broker_port: default_mqtt_port(),
            client_id: default_mqtt_client_id(),
        }
    }
}

/// Load settings from an optional file plus environment overrides.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        builder = builder.add_source(config::File::from(path));
    }

    let cfg = builder
        .add_source(
            config::Environment::with_prefix("ORCHESTRATOR")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let settings: Settings = cfg.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}

impl Settings {
    /// Reject values that would wedge the runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.worker_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.queue_capacity".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.session.history_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.history_limit".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
