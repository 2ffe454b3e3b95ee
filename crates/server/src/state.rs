//! Shared application state

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use orchestrator_config::Settings;
use orchestrator_context::ContextManager;
use orchestrator_pipeline::CommandPipeline;
use orchestrator_registry::ServiceRegistry;

use crate::adapters::WebAdapter;
use crate::dispatch::UiDispatch;

/// Handles shared by every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub dispatch: Arc<UiDispatch>,
    pub web: Arc<WebAdapter>,
    pub pipeline: Arc<CommandPipeline>,
    pub context: Arc<ContextManager>,
    pub registry: Arc<ServiceRegistry>,
    pub metrics: Option<PrometheusHandle>,
}
