//! UI dispatch
//!
//! The uniform bridge between heterogeneous front-end adapters and the
//! pipeline. Adapters satisfy one small capability set (submit flows
//! through here, plus deliver/start/stop); dispatch owns the mapping
//! from interface tag to adapter and guarantees each result is handed
//! to the matching adapter exactly once, buffering up to a bounded
//! backlog while an adapter is unavailable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};

use orchestrator_core::{
    CommandResult, CommandSubmission, InterfaceTag, RequestId, ResultSink,
};
use orchestrator_pipeline::{CommandPipeline, PipelineError};

use crate::metrics::record_buffer_discard;
use crate::ServerError;

/// Per-adapter delivery backlog while the adapter is unavailable.
const DELIVERY_BUFFER_CAPACITY: usize = 64;

/// A front-end adapter: one per interface tag.
#[async_trait]
pub trait FrontendAdapter: Send + Sync {
    fn interface(&self) -> InterfaceTag;

    async fn start(&self) -> Result<(), ServerError> {
        Ok(())
    }

    async fn stop(&self) {}

    /// Hand a terminal result to the front-end. An error means the
    /// adapter cannot take it right now and dispatch should buffer.
    async fn deliver(&self, result: CommandResult) -> Result<(), ServerError>;
}

pub struct UiDispatch {
    pipeline: OnceCell<Arc<CommandPipeline>>,
    adapters: RwLock<HashMap<InterfaceTag, Arc<dyn FrontendAdapter>>>,
    buffers: Mutex<HashMap<InterfaceTag, VecDeque<CommandResult>>>,
    discarded: AtomicU64,
}

impl UiDispatch {
    pub fn new() -> Self {
        Self {
            pipeline: OnceCell::new(),
            adapters: RwLock::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            discarded: AtomicU64::new(0),
        }
    }

    /// Late-bind the pipeline; dispatch is constructed first because it
    /// is the pipeline's result sink.
    pub fn bind_pipeline(&self, pipeline: Arc<CommandPipeline>) {
        if self.pipeline.set(pipeline).is_err() {
            tracing::warn!("pipeline already bound to dispatch");
        }
    }

    pub async fn register_adapter(&self, adapter: Arc<dyn FrontendAdapter>) {
        let tag = adapter.interface();
        self.adapters.write().insert(tag, adapter.clone());
        tracing::info!(interface = %tag, "adapter registered");
        self.flush_buffer(tag).await;
    }

    pub async fn unregister_adapter(&self, tag: InterfaceTag) {
        if let Some(adapter) = self.adapters.write().remove(&tag) {
            adapter.stop().await;
            tracing::info!(interface = %tag, "adapter unregistered");
        }
    }

    /// Submit a command on behalf of an adapter.
    pub async fn submit(&self, submission: CommandSubmission) -> Result<RequestId, ServerError> {
        if !self.adapters.read().contains_key(&submission.interface) {
            return Err(ServerError::AdapterUnknown(
                submission.interface.to_string(),
            ));
        }
        let pipeline = self
            .pipeline
            .get()
            .ok_or_else(|| ServerError::Internal("pipeline not bound".to_string()))?;
        match pipeline.submit(submission).await {
            Ok(id) => Ok(id),
            Err(PipelineError::ShuttingDown) => {
                Err(ServerError::Unavailable("orchestrator is shutting down".to_string()))
            }
        }
    }

    /// Results discarded from full delivery buffers since startup.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub async fn stop_adapters(&self) {
        let adapters: Vec<Arc<dyn FrontendAdapter>> =
            self.adapters.write().drain().map(|(_, a)| a).collect();
        for adapter in adapters {
            adapter.stop().await;
        }
    }

    async fn flush_buffer(&self, tag: InterfaceTag) {
        loop {
            let next = {
                let mut buffers = self.buffers.lock();
                buffers.get_mut(&tag).and_then(VecDeque::pop_front)
            };
            let Some(result) = next else {
                return;
            };
            let adapter = self.adapters.read().get(&tag).cloned();
            let Some(adapter) = adapter else {
                // Adapter vanished again; put it back
                self.buffer(result);
                return;
            };
            if let Err(e) = adapter.deliver(result.clone()).await {
                tracing::debug!(interface = %tag, error = %e, "flush delivery failed, rebuffering");
                self.buffer(result);
                return;
            }
        }
    }

    fn buffer(&self, result: CommandResult) {
        let tag = result.interface;
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(tag).or_default();
        buffer.push_back(result);
        if buffer.len() > DELIVERY_BUFFER_CAPACITY {
            buffer.pop_front();
            self.discarded.fetch_add(1, Ordering::Relaxed);
            record_buffer_discard(tag);
            tracing::warn!(interface = %tag, "delivery buffer full, discarded oldest result");
        }
    }
}

impl Default for UiDispatch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultSink for UiDispatch {
    async fn deliver(&self, result: CommandResult) {
        crate::metrics::record_command_result(&result);

        let adapter = self.adapters.read().get(&result.interface).cloned();
        match adapter {
            Some(adapter) => {
                if let Err(e) = adapter.deliver(result.clone()).await {
                    tracing::debug!(
                        interface = %result.interface,
                        request_id = %result.request_id,
                        error = %e,
                        "adapter unavailable, buffering result"
                    );
                    self.buffer(result);
                }
            }
            None => self.buffer(result),
        }
    }
}
