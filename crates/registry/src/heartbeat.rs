//! Heartbeat loop
//!
//! Probes every registered service at the configured interval, feeds the
//! observations back into the registry, and runs the eviction sweep.
//! Probes run on their own task with an independent timeout and never
//! block command dispatch.

use std::sync::Arc;

use tokio::sync::watch;

use orchestrator_core::{HealthStatus, ServiceDescriptor, TransportKind};

use crate::ServiceRegistry;

/// Start the heartbeat task. Send `true` on the returned channel to stop.
pub fn start_heartbeat_task(registry: Arc<ServiceRegistry>) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let interval = registry.config().heartbeat_interval();
    let probe_timeout = registry.config().probe_timeout();

    let client = reqwest::Client::builder()
        .timeout(probe_timeout)
        .build()
        .unwrap_or_default();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for service in registry.list_services() {
                        // Shutdown may land mid-pass; probes are cancellable
                        tokio::select! {
                            observed = probe(&client, &service) => {
                                if let Some(observed) = observed {
                                    registry.record_heartbeat(&service.name, observed);
                                }
                            }
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                    let evicted = registry.sweep();
                    if !evicted.is_empty() {
                        tracing::info!(count = evicted.len(), services = ?evicted, "heartbeat sweep evicted services");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("heartbeat task shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}

/// Probe one service. `None` means this transport has no probe here and
/// liveness comes from explicit `record_heartbeat` calls instead.
async fn probe(client: &reqwest::Client, service: &ServiceDescriptor) -> Option<HealthStatus> {
    match service.transport {
        TransportKind::Http => {
            let url = format!("{}/health", service.base_url());
            match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => Some(HealthStatus::Healthy),
                Ok(response) if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE => {
                    Some(HealthStatus::Degraded)
                }
                Ok(response) => {
                    tracing::debug!(
                        service = %service.name,
                        status = %response.status(),
                        "unexpected health probe status"
                    );
                    Some(HealthStatus::Unknown)
                }
                Err(e) => {
                    tracing::debug!(service = %service.name, error = %e, "health probe failed");
                    Some(HealthStatus::Unknown)
                }
            }
        }
        // In-process services live and die with this process
        TransportKind::Inproc => Some(HealthStatus::Healthy),
        // MQTT services report via the retained health topic; the broker
        // bridge feeds record_heartbeat directly
        TransportKind::Mqtt => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_config::RegistryConfig;

    #[tokio::test(start_paused = true)]
    async fn test_inproc_services_stay_healthy() {
        let config = RegistryConfig {
            heartbeat_interval_seconds: 1,
            ..RegistryConfig::default()
        };
        let registry = Arc::new(ServiceRegistry::new(config));
        registry
            .register_service(
                ServiceDescriptor::new("local", "localhost", 0, TransportKind::Inproc)
                    .with_capability("system"),
            )
            .unwrap();

        let shutdown = start_heartbeat_task(registry.clone());
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        assert_eq!(registry.list_services()[0].health, HealthStatus::Healthy);
        shutdown.send(true).unwrap();
    }
}
