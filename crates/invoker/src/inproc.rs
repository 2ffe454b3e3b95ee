//! In-process service transport
//!
//! Named async handlers living in this process, invoked with the same
//! payload schema as the network transports. Hosts built-in services
//! and test fixtures.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use orchestrator_core::{InvokeError, ServiceCall, ServiceReply};

/// An in-process service implementation.
#[async_trait]
pub trait InprocService: Send + Sync {
    async fn handle(&self, call: ServiceCall) -> ServiceReply;
}

/// Adapter turning an async closure into an `InprocService`.
struct FnService<F> {
    f: F,
}

#[async_trait]
impl<F> InprocService for FnService<F>
where
    F: Fn(ServiceCall) -> BoxFuture<'static, ServiceReply> + Send + Sync,
{
    async fn handle(&self, call: ServiceCall) -> ServiceReply {
        (self.f)(call).await
    }
}

/// Registry of in-process handlers, keyed by service name.
#[derive(Default)]
pub struct InprocRouter {
    handlers: RwLock<HashMap<String, Arc<dyn InprocService>>>,
}

impl InprocRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, service: Arc<dyn InprocService>) {
        let name = name.into();
        tracing::debug!(service = %name, "inproc handler registered");
        self.handlers.write().insert(name, service);
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ServiceReply> + Send + 'static,
    {
        let boxed = move |call: ServiceCall| -> BoxFuture<'static, ServiceReply> {
            Box::pin(f(call))
        };
        self.register(name, Arc::new(FnService { f: boxed }));
    }

    pub fn unregister(&self, name: &str) {
        self.handlers.write().remove(name);
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Dispatch a call to a named handler. A missing handler is a
    /// transport-level failure, like an unreachable host.
    pub async fn handle(&self, name: &str, call: &ServiceCall) -> Result<ServiceReply, InvokeError> {
        let handler = self.handlers.read().get(name).cloned();
        match handler {
            Some(handler) => Ok(handler.handle(call.clone()).await),
            None => Err(InvokeError::Transport(format!(
                "no in-process handler for {name}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::IntentName;

    fn call() -> ServiceCall {
        ServiceCall {
            intent: IntentName::SystemControl,
            parameters: Default::default(),
            context: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let router = InprocRouter::new();
        router.register_fn("echo", |call| async move {
            ServiceReply {
                success: true,
                response: Some(call.intent.to_string()),
                error: None,
            }
        });

        let reply = router.handle("echo", &call()).await.unwrap();
        assert_eq!(reply.response.as_deref(), Some("system_control"));

        router.unregister("echo");
        assert!(router.handle("echo", &call()).await.is_err());
    }
}
