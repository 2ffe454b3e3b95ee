//! Periodic session cleanup task

use std::sync::Arc;

use tokio::sync::watch;

use crate::ContextManager;

/// Start the background task that evicts expired sessions.
///
/// Returns a shutdown sender; send `true` to stop the task. The scan
/// itself is time-sliced inside `cleanup_expired_sessions`, so a large
/// cache never stalls dispatch.
pub fn start_cleanup_task(manager: Arc<ContextManager>) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let interval = manager.config().cleanup_interval();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh start
        // does not race warm-up.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = manager.cleanup_expired_sessions().await;
                    if removed > 0 {
                        tracing::info!(
                            removed,
                            remaining = manager.session_count(),
                            "session cleanup pass finished"
                        );
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("session cleanup task shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_config::SessionConfig;
    use orchestrator_core::InterfaceTag;
    use orchestrator_persistence::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_evicts_and_stops() {
        let config = SessionConfig {
            ttl_minutes: 0,
            cleanup_interval_seconds: 1,
            ..SessionConfig::default()
        };
        let manager = Arc::new(ContextManager::new(Arc::new(MemoryStore::new()), config));
        manager
            .create_session("u1", InterfaceTag::Text)
            .await
            .unwrap();

        let shutdown = start_cleanup_task(manager.clone());
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        assert_eq!(manager.session_count(), 0);

        shutdown.send(true).unwrap();
    }
}
