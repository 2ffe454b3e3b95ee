//! Built-in front-end adapters
//!
//! - `WebAdapter`: pairs HTTP submissions with their results through
//!   pending one-shot channels, so `POST /api/commands` can await the
//!   outcome in the request/response cycle.
//! - `ChannelAdapter`: an in-process adapter over tokio channels for
//!   embedders and tests.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use orchestrator_core::{CommandResult, InterfaceTag, RequestId};

use crate::dispatch::FrontendAdapter;
use crate::ServerError;

/// Results parked for subscribers that have not shown up yet.
const UNCLAIMED_CAP: usize = 256;

/// Adapter for the `web` interface.
pub struct WebAdapter {
    pending: DashMap<RequestId, oneshot::Sender<CommandResult>>,
    /// Results that arrived before the HTTP handler subscribed; the
    /// pipeline assigns ids at submit time, so a very fast result can
    /// beat the subscription
    unclaimed: DashMap<RequestId, CommandResult>,
}

impl WebAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            unclaimed: DashMap::new(),
        })
    }

    /// Register interest in a request's result. Results that already
    /// arrived resolve the receiver immediately.
    pub fn subscribe(&self, id: RequestId) -> oneshot::Receiver<CommandResult> {
        let (tx, rx) = oneshot::channel();
        if let Some((_, result)) = self.unclaimed.remove(&id) {
            let _ = tx.send(result);
            return rx;
        }
        self.pending.insert(id, tx);
        rx
    }

    /// Drop interest (e.g. the HTTP client went away).
    pub fn unsubscribe(&self, id: &RequestId) {
        self.pending.remove(id);
        self.unclaimed.remove(id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl FrontendAdapter for WebAdapter {
    fn interface(&self) -> InterfaceTag {
        InterfaceTag::Web
    }

    async fn deliver(&self, result: CommandResult) -> Result<(), ServerError> {
        match self.pending.remove(&result.request_id) {
            Some((_, tx)) => {
                // A closed receiver means the client stopped waiting;
                // the result is simply dropped
                let _ = tx.send(result);
                Ok(())
            }
            None => {
                if self.unclaimed.len() >= UNCLAIMED_CAP {
                    tracing::debug!("unclaimed web results at capacity, dropping backlog");
                    self.unclaimed.clear();
                }
                self.unclaimed.insert(result.request_id.clone(), result);
                Ok(())
            }
        }
    }

    async fn stop(&self) {
        self.pending.clear();
        self.unclaimed.clear();
    }
}

/// Channel-backed adapter for an arbitrary interface tag.
pub struct ChannelAdapter {
    tag: InterfaceTag,
    tx: mpsc::UnboundedSender<CommandResult>,
}

impl ChannelAdapter {
    /// Create an adapter and the receiving end for its results.
    pub fn new(tag: InterfaceTag) -> (Arc<Self>, mpsc::UnboundedReceiver<CommandResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tag, tx }), rx)
    }
}

#[async_trait]
impl FrontendAdapter for ChannelAdapter {
    fn interface(&self) -> InterfaceTag {
        self.tag
    }

    async fn deliver(&self, result: CommandResult) -> Result<(), ServerError> {
        self.tx
            .send(result)
            .map_err(|_| ServerError::AdapterUnavailable(format!("{} receiver closed", self.tag)))
    }
}
