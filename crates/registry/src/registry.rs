//! Registry core
//!
//! One lock serializes all updates; reads hand out consistent snapshots.
//! In-flight accounting happens inside `acquire`/`release` so the
//! declared max concurrency holds under contention.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use orchestrator_config::RegistryConfig;
use orchestrator_core::{
    HealthStatus, InvocationOutcome, ServiceDescriptor, ServiceSelector,
};

use crate::health::HealthState;
use crate::RegistryError;

struct ServiceEntry {
    descriptor: ServiceDescriptor,
    health: HealthState,
}

impl ServiceEntry {
    /// Descriptor snapshot with the live health status folded in.
    fn snapshot(&self) -> ServiceDescriptor {
        let mut descriptor = self.descriptor.clone();
        descriptor.health = self.health.status();
        descriptor
    }
}

pub struct ServiceRegistry {
    config: RegistryConfig,
    services: RwLock<HashMap<String, ServiceEntry>>,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a service. A duplicate name at the same endpoint is a
    /// conflict; the same name at a different endpoint replaces the old
    /// registration atomically.
    pub fn register_service(&self, descriptor: ServiceDescriptor) -> Result<(), RegistryError> {
        let mut services = self.services.write();
        if let Some(existing) = services.get(&descriptor.name) {
            let same_endpoint = existing.descriptor.host == descriptor.host
                && existing.descriptor.port == descriptor.port
                && existing.descriptor.transport == descriptor.transport;
            if same_endpoint {
                return Err(RegistryError::Conflict(descriptor.name.clone()));
            }
            tracing::info!(
                service = %descriptor.name,
                host = %descriptor.host,
                port = descriptor.port,
                "service re-registered at new endpoint"
            );
        } else {
            tracing::info!(
                service = %descriptor.name,
                transport = %descriptor.transport,
                capabilities = ?descriptor.capabilities,
                "service registered"
            );
        }

        let name = descriptor.name.clone();
        let mut descriptor = descriptor;
        descriptor.health = HealthStatus::Unknown;
        descriptor.in_flight = 0;
        descriptor.last_seen = chrono::Utc::now();
        services.insert(
            name,
            ServiceEntry {
                descriptor,
                health: HealthState::new(),
            },
        );
        Ok(())
    }

    pub fn unregister_service(&self, name: &str) -> Result<(), RegistryError> {
        match self.services.write().remove(name) {
            Some(_) => {
                tracing::info!(service = %name, "service unregistered");
                Ok(())
            }
            None => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// Snapshot of every registered service.
    pub fn list_services(&self) -> Vec<ServiceDescriptor> {
        let mut services: Vec<ServiceDescriptor> =
            self.services.read().values().map(ServiceEntry::snapshot).collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Selectable candidates for a capability, ordered by
    /// (health rank, in-flight count, name).
    pub fn find_by_capability(&self, capability: &str) -> Vec<ServiceDescriptor> {
        let mut candidates: Vec<ServiceDescriptor> = self
            .services
            .read()
            .values()
            .filter(|entry| {
                entry.descriptor.has_capability(capability) && entry.health.status().is_selectable()
            })
            .map(ServiceEntry::snapshot)
            .collect();
        candidates.sort_by(|a, b| {
            (a.health.rank(), a.in_flight, &a.name).cmp(&(b.health.rank(), b.in_flight, &b.name))
        });
        candidates
    }

    /// Record a heartbeat observation for a service.
    pub fn record_heartbeat(&self, name: &str, observed: HealthStatus) {
        let mut services = self.services.write();
        let Some(entry) = services.get_mut(name) else {
            return;
        };
        match observed {
            HealthStatus::Healthy => {
                entry.descriptor.last_seen = chrono::Utc::now();
                entry.health.on_probe_success();
            }
            HealthStatus::Degraded => {
                entry.descriptor.last_seen = chrono::Utc::now();
                entry.health.on_probe_degraded();
            }
            HealthStatus::Unhealthy | HealthStatus::Unknown => {
                entry.health.on_probe_failure();
            }
        }
    }

    /// Record the outcome of an invocation attempt, without touching the
    /// in-flight count (that is `release`'s job).
    pub fn record_invocation_result(
        &self,
        name: &str,
        outcome: InvocationOutcome,
        latency: Duration,
    ) {
        let mut services = self.services.write();
        let Some(entry) = services.get_mut(name) else {
            return;
        };
        let threshold = entry
            .descriptor
            .capabilities
            .first()
            .map(|cap| self.config.latency_threshold(cap))
            .unwrap_or_else(|| self.config.latency_threshold(""));
        match outcome {
            InvocationOutcome::Success => {
                entry.descriptor.last_seen = chrono::Utc::now();
                entry.health.on_success(latency, threshold);
            }
            InvocationOutcome::SoftFailure => {
                // The service answered, just unhappily
                entry.descriptor.last_seen = chrono::Utc::now();
                entry.health.on_soft_failure(Instant::now());
            }
            InvocationOutcome::HardFailure => {
                entry.health.on_hard_failure(Instant::now());
            }
            InvocationOutcome::Abandoned => {}
        }
    }

    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        if let Some(entry) = self.services.write().get_mut(name) {
            tracing::warn!(service = %name, reason = %reason, "service marked unhealthy");
            entry.health.force(HealthStatus::Unhealthy);
        }
    }

    pub fn mark_healthy(&self, name: &str) {
        if let Some(entry) = self.services.write().get_mut(name) {
            entry.health.force(HealthStatus::Healthy);
        }
    }

    /// Heartbeat-age demotions plus soft-state eviction. Called from the
    /// heartbeat loop once per tick.
    pub fn sweep(&self) -> Vec<String> {
        let interval = self.config.heartbeat_interval();
        let eviction_window = self.config.eviction_window();
        let max_failed = self.config.max_failed_heartbeats;
        let now_utc = chrono::Utc::now();
        let now = Instant::now();

        let mut services = self.services.write();
        for entry in services.values_mut() {
            let age = (now_utc - entry.descriptor.last_seen)
                .to_std()
                .unwrap_or(Duration::ZERO);
            entry.health.on_heartbeat_age(age, interval);
        }

        let evicted: Vec<String> = services
            .iter()
            .filter(|(_, entry)| {
                entry.health.failed_probes() >= max_failed
                    || entry
                        .health
                        .unhealthy_for(now)
                        .map(|d| d >= eviction_window)
                        .unwrap_or(false)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in &evicted {
            services.remove(name);
            tracing::warn!(service = %name, "service evicted");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// Current in-flight count, for tests and the admin surface.
    pub fn in_flight(&self, name: &str) -> Option<u32> {
        self.services.read().get(name).map(|e| e.descriptor.in_flight)
    }
}

impl ServiceSelector for ServiceRegistry {
    /// Deterministic selection: among candidates with selectable health
    /// and spare concurrency, minimize (in-flight count, name).
    fn acquire(&self, capability: &str) -> Option<ServiceDescriptor> {
        let mut services = self.services.write();
        let chosen = services
            .values_mut()
            .filter(|entry| {
                entry.descriptor.has_capability(capability)
                    && entry.health.status().is_selectable()
                    && entry.descriptor.in_flight < entry.descriptor.max_concurrency
            })
            .min_by(|a, b| {
                (a.descriptor.in_flight, &a.descriptor.name)
                    .cmp(&(b.descriptor.in_flight, &b.descriptor.name))
            })?;
        chosen.descriptor.in_flight += 1;
        Some(chosen.snapshot())
    }

    fn release(&self, name: &str, outcome: InvocationOutcome, latency: Duration) {
        {
            let mut services = self.services.write();
            if let Some(entry) = services.get_mut(name) {
                entry.descriptor.in_flight = entry.descriptor.in_flight.saturating_sub(1);
            }
        }
        self.record_invocation_result(name, outcome, latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::TransportKind;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(RegistryConfig::default())
    }

    fn service(name: &str, port: u16, capability: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(name, "127.0.0.1", port, TransportKind::Http)
            .with_capability(capability)
    }

    #[test]
    fn test_register_conflict_and_replace() {
        let registry = registry();
        registry.register_service(service("music", 9000, "music")).unwrap();

        // Same endpoint: conflict
        let err = registry
            .register_service(service("music", 9000, "music"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));

        // Different endpoint: replace
        registry.register_service(service("music", 9001, "music")).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list_services()[0].port, 9001);
    }

    #[test]
    fn test_find_excludes_unknown_and_unhealthy() {
        let registry = registry();
        registry.register_service(service("a", 9000, "audio")).unwrap();
        // Unknown health: not selectable
        assert!(registry.find_by_capability("audio").is_empty());

        registry.mark_healthy("a");
        assert_eq!(registry.find_by_capability("audio").len(), 1);

        registry.mark_unhealthy("a", "test");
        assert!(registry.find_by_capability("audio").is_empty());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let registry = registry();
        registry.register_service(service("beta", 9001, "audio")).unwrap();
        registry.register_service(service("alpha", 9000, "audio")).unwrap();
        registry.mark_healthy("alpha");
        registry.mark_healthy("beta");

        // Equal in-flight: name breaks the tie
        let first = registry.acquire("audio").unwrap();
        assert_eq!(first.name, "alpha");

        // alpha now carries load, beta wins
        let second = registry.acquire("audio").unwrap();
        assert_eq!(second.name, "beta");

        registry.release("alpha", InvocationOutcome::Success, Duration::from_millis(10));
        registry.release("beta", InvocationOutcome::Success, Duration::from_millis(10));
    }

    #[test]
    fn test_max_concurrency_enforced() {
        let registry = registry();
        let svc = service("solo", 9000, "audio").with_max_concurrency(1);
        registry.register_service(svc).unwrap();
        registry.mark_healthy("solo");

        let grant = registry.acquire("audio");
        assert!(grant.is_some());
        assert_eq!(registry.in_flight("solo"), Some(1));

        // Slot exhausted
        assert!(registry.acquire("audio").is_none());

        registry.release("solo", InvocationOutcome::Success, Duration::from_millis(5));
        assert_eq!(registry.in_flight("solo"), Some(0));
        assert!(registry.acquire("audio").is_some());
    }

    #[tokio::test]
    async fn test_hard_failures_drive_no_service() {
        let registry = registry();
        registry.register_service(service("flaky", 9000, "audio").with_max_concurrency(4)).unwrap();
        registry.mark_healthy("flaky");

        for _ in 0..3 {
            let grant = registry.acquire("audio").expect("selectable");
            registry.release(
                &grant.name,
                InvocationOutcome::HardFailure,
                Duration::from_millis(50),
            );
        }

        // healthy -> degraded -> unhealthy, no candidate left
        assert!(registry.acquire("audio").is_none());
        assert!(registry.find_by_capability("audio").is_empty());
    }

    #[test]
    fn test_heartbeat_updates_and_recovers() {
        let registry = registry();
        registry.register_service(service("svc", 9000, "system")).unwrap();

        registry.record_heartbeat("svc", HealthStatus::Healthy);
        assert_eq!(registry.list_services()[0].health, HealthStatus::Healthy);

        registry.mark_unhealthy("svc", "probe storm");
        registry.record_heartbeat("svc", HealthStatus::Healthy);
        // A successful probe recovers one level only
        assert_eq!(registry.list_services()[0].health, HealthStatus::Degraded);
    }

    #[test]
    fn test_sweep_evicts_after_failed_probes() {
        let config = RegistryConfig {
            max_failed_heartbeats: 2,
            ..RegistryConfig::default()
        };
        let registry = ServiceRegistry::new(config);
        registry.register_service(service("gone", 9000, "audio")).unwrap();

        registry.record_heartbeat("gone", HealthStatus::Unknown);
        registry.record_heartbeat("gone", HealthStatus::Unknown);
        let evicted = registry.sweep();
        assert_eq!(evicted, vec!["gone".to_string()]);
        assert!(registry.is_empty());
    }
}
