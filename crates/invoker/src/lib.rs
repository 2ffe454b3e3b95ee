//! Service invoker
//!
//! Single-shot, transport-agnostic invocation of a selected service.
//! Every attempt runs under the caller's absolute deadline and the
//! request's cancellation token. The invoker retries at most once, only
//! for transport errors and only while deadline budget remains; further
//! retries (on a fresh selection) are the pipeline's job.

pub mod http;
pub mod inproc;
pub mod mqtt;

pub use http::HttpTransport;
pub use inproc::{InprocRouter, InprocService};
pub use mqtt::MqttTransport;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use orchestrator_core::{
    CommandInvoker, InvokeError, ServiceCall, ServiceDescriptor, ServiceReply, TransportKind,
};

pub struct ServiceInvoker {
    http: HttpTransport,
    inproc: Arc<InprocRouter>,
    mqtt: Option<MqttTransport>,
}

impl ServiceInvoker {
    pub fn new(inproc: Arc<InprocRouter>, mqtt: Option<MqttTransport>) -> Self {
        Self {
            http: HttpTransport::new(),
            inproc,
            mqtt,
        }
    }

    /// The in-process handler registry, for hosting local services.
    pub fn inproc(&self) -> &Arc<InprocRouter> {
        &self.inproc
    }

    async fn attempt(
        &self,
        service: &ServiceDescriptor,
        call: &ServiceCall,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ServiceReply, InvokeError> {
        if cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(InvokeError::Timeout);
        }

        let transport = async {
            match service.transport {
                TransportKind::Http => self.http.request(service, call).await,
                TransportKind::Inproc => self.inproc.handle(&service.name, call).await,
                TransportKind::Mqtt => match &self.mqtt {
                    Some(mqtt) => mqtt.request(&service.name, call).await,
                    None => Err(InvokeError::Transport(
                        "mqtt transport is not configured".to_string(),
                    )),
                },
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(InvokeError::Cancelled),
            result = tokio::time::timeout_at(deadline, transport) => match result {
                Ok(reply) => reply,
                Err(_) => Err(InvokeError::Timeout),
            },
        }
    }
}

#[async_trait]
impl CommandInvoker for ServiceInvoker {
    async fn invoke(
        &self,
        service: &ServiceDescriptor,
        call: &ServiceCall,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ServiceReply, InvokeError> {
        let first = self.attempt(service, call, deadline, cancel).await;
        match first {
            Err(InvokeError::Transport(ref reason)) if Instant::now() < deadline => {
                tracing::debug!(
                    service = %service.name,
                    reason = %reason,
                    "transport error, one in-invoker retry"
                );
                self.attempt(service, call, deadline, cancel).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn inproc_service(name: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(name, "localhost", 0, TransportKind::Inproc)
            .with_capability("music")
    }

    fn call() -> ServiceCall {
        ServiceCall {
            intent: orchestrator_core::IntentName::PlayMusic,
            parameters: Default::default(),
            context: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_inproc_invocation() {
        let router = Arc::new(InprocRouter::new());
        router.register_fn("music-player", |_call| async {
            ServiceReply {
                success: true,
                response: Some("now playing".to_string()),
                error: None,
            }
        });
        let invoker = ServiceInvoker::new(router, None);

        let reply = invoker
            .invoke(
                &inproc_service("music-player"),
                &call(),
                Instant::now() + Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(reply.success);
        assert_eq!(reply.response.as_deref(), Some("now playing"));
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        let router = Arc::new(InprocRouter::new());
        router.register_fn("sleeper", |_call| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ServiceReply {
                success: true,
                response: None,
                error: None,
            }
        });
        let invoker = ServiceInvoker::new(router, None);

        let err = invoker
            .invoke(
                &inproc_service("sleeper"),
                &call(),
                Instant::now() + Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Timeout));
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let router = Arc::new(InprocRouter::new());
        router.register_fn("sleeper", |_call| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ServiceReply {
                success: true,
                response: None,
                error: None,
            }
        });
        let invoker = ServiceInvoker::new(router, None);

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let err = invoker
            .invoke(
                &inproc_service("sleeper"),
                &call(),
                Instant::now() + Duration::from_secs(10),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_transport_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let router = Arc::new(InprocRouter::new());
        {
            let attempts = attempts.clone();
            router.register_fn("flaky", move |_call| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        // Structured failure, not a transport fault
                        ServiceReply {
                            success: false,
                            response: None,
                            error: Some("device busy".to_string()),
                        }
                    } else {
                        ServiceReply {
                            success: true,
                            response: Some("ok".to_string()),
                            error: None,
                        }
                    }
                }
            });
        }

        // Structured failure replies are not retried by the invoker
        let invoker = ServiceInvoker::new(router, None);
        let reply = invoker
            .invoke(
                &inproc_service("flaky"),
                &call(),
                Instant::now() + Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!reply.success);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_inproc_handler_is_transport_error() {
        let invoker = ServiceInvoker::new(Arc::new(InprocRouter::new()), None);
        let err = invoker
            .invoke(
                &inproc_service("ghost"),
                &call(),
                Instant::now() + Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        // One retry happens, then the transport error surfaces
        assert!(matches!(err, InvokeError::Transport(_)));
    }
}
