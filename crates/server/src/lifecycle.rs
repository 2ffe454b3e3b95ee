//! Lifecycle supervision
//!
//! Constructs and starts the components in dependency order
//! (persistence -> context -> classifier -> registry -> invoker ->
//! pipeline -> dispatch/adapters -> HTTP), then shuts them down in
//! reverse: stop accepting submissions, drain the pipeline within its
//! grace window, stop workers, stop background tasks.

use std::sync::Arc;

use orchestrator_config::{PersistenceBackend, Settings};
use orchestrator_context::{start_cleanup_task, ContextManager};
use orchestrator_invoker::{InprocRouter, MqttTransport, ServiceInvoker};
use orchestrator_nlp::IntentClassifier;
use orchestrator_persistence::{FileStore, MemoryStore, RecordStore};
use orchestrator_pipeline::CommandPipeline;
use orchestrator_registry::{start_heartbeat_task, ServiceRegistry};

use crate::adapters::WebAdapter;
use crate::dispatch::UiDispatch;
use crate::http::create_router;
use crate::metrics::init_metrics;
use crate::state::AppState;
use crate::ServerError;

pub struct Supervisor {
    settings: Settings,
}

impl Supervisor {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Bring the orchestrator up, serve until a shutdown signal, then
    /// tear everything down in reverse order.
    pub async fn run(self) -> Result<(), ServerError> {
        let settings = Arc::new(self.settings);

        // Persistence port
        let store: Arc<dyn RecordStore> = match settings.persistence.backend {
            PersistenceBackend::File => {
                tracing::info!(root = %settings.persistence.root, "file persistence");
                Arc::new(FileStore::new(settings.persistence.root.as_str()))
            }
            PersistenceBackend::Memory => {
                tracing::warn!("in-memory persistence: context will not survive restarts");
                Arc::new(MemoryStore::new())
            }
        };

        // Context manager
        let context = Arc::new(ContextManager::new(store, settings.session.clone()));
        context
            .warm_up()
            .await
            .map_err(|e| ServerError::Init(format!("context warm-up: {e}")))?;

        // Intent classifier
        let classifier = Arc::new(IntentClassifier::new());

        // Service registry and its heartbeat loop
        let registry = Arc::new(ServiceRegistry::new(settings.registry.clone()));
        let heartbeat_shutdown = start_heartbeat_task(registry.clone());

        // Invoker with its transports
        let inproc = Arc::new(InprocRouter::new());
        let mqtt = if settings.mqtt.enabled {
            Some(
                MqttTransport::connect(&settings.mqtt)
                    .await
                    .map_err(|e| ServerError::Init(format!("mqtt transport: {e}")))?,
            )
        } else {
            None
        };
        let invoker = Arc::new(ServiceInvoker::new(inproc, mqtt));

        // Metrics recorder; its absence degrades /metrics, nothing else
        let metrics = match init_metrics() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "metrics recorder unavailable");
                None
            }
        };

        // Dispatch is the pipeline's result sink, so it exists first and
        // the pipeline is bound afterwards
        let dispatch = Arc::new(UiDispatch::new());
        let pipeline = CommandPipeline::new(
            settings.pipeline.clone(),
            classifier,
            context.clone(),
            registry.clone(),
            invoker,
            dispatch.clone(),
        );
        dispatch.bind_pipeline(pipeline.clone());
        pipeline.start();

        let cleanup_shutdown = start_cleanup_task(context.clone());

        // Front-end adapters
        let web = WebAdapter::new();
        dispatch.register_adapter(web.clone()).await;

        // HTTP surface
        let state = AppState {
            settings: settings.clone(),
            dispatch: dispatch.clone(),
            web,
            pipeline: pipeline.clone(),
            context: context.clone(),
            registry: registry.clone(),
            metrics,
        };
        let router = create_router(state);

        let addr = format!("{}:{}", settings.server.host, settings.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Init(format!("bind {addr}: {e}")))?;
        tracing::info!(addr = %addr, "command orchestrator listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| ServerError::Internal(format!("server: {e}")))?;

        // Reverse-order shutdown
        tracing::info!("shutting down");
        dispatch.stop_adapters().await;
        pipeline.shutdown().await;
        let _ = heartbeat_shutdown.send(true);
        let _ = cleanup_shutdown.send(true);
        tracing::info!("shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
