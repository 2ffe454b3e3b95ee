//! MQTT transport
//!
//! Request/response over a broker: the call payload goes to
//! `commands/<service>/request` carrying a correlation id, and the
//! service answers on `commands/<service>/response/<requestId>`. A
//! single event-loop task routes responses back to pending requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::oneshot;

use orchestrator_config::MqttConfig;
use orchestrator_core::{InvokeError, ServiceCall, ServiceReply};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ServiceReply>>>>;

pub struct MqttTransport {
    client: AsyncClient,
    pending: PendingMap,
}

impl MqttTransport {
    /// Connect to the broker and start the response-routing task.
    pub async fn connect(config: &MqttConfig) -> Result<Self, InvokeError> {
        let mut options = MqttOptions::new(
            config.client_id.clone(),
            config.broker_host.clone(),
            config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        client
            .subscribe("commands/+/response/+", QoS::AtLeastOnce)
            .await
            .map_err(|e| InvokeError::Transport(format!("mqtt subscribe failed: {e}")))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let routing = pending.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        route_response(&routing, &publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "mqtt event loop error, reconnecting");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        tracing::info!(
            host = %config.broker_host,
            port = config.broker_port,
            "mqtt transport connected"
        );
        Ok(Self { client, pending })
    }

    /// Publish a request and await the correlated response. The caller
    /// (the invoker) enforces the deadline around this future.
    pub async fn request(
        &self,
        service_name: &str,
        call: &ServiceCall,
    ) -> Result<ServiceReply, InvokeError> {
        let correlation = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation.clone(), tx);
        // Drop the pending entry even if the deadline cancels this future
        let _cleanup = PendingCleanup {
            pending: self.pending.clone(),
            key: correlation.clone(),
        };

        let mut payload = serde_json::to_value(call)
            .map_err(|e| InvokeError::Transport(format!("encode failed: {e}")))?;
        payload["requestId"] = serde_json::Value::String(correlation.clone());

        let topic = format!("commands/{service_name}/request");
        self.client
            .publish(
                topic,
                QoS::AtLeastOnce,
                false,
                serde_json::to_vec(&payload)
                    .map_err(|e| InvokeError::Transport(format!("encode failed: {e}")))?,
            )
            .await
            .map_err(|e| InvokeError::Transport(format!("mqtt publish failed: {e}")))?;

        rx.await
            .map_err(|_| InvokeError::Transport("mqtt response channel closed".to_string()))
    }
}

struct PendingCleanup {
    pending: PendingMap,
    key: String,
}

impl Drop for PendingCleanup {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}

/// Match `commands/<service>/response/<requestId>` and complete the
/// pending request.
fn route_response(pending: &PendingMap, topic: &str, payload: &[u8]) {
    let mut parts = topic.split('/');
    let is_response = parts.next() == Some("commands")
        && parts.next().is_some()
        && parts.next() == Some("response");
    let Some(request_id) = parts.next() else {
        return;
    };
    if !is_response {
        return;
    }

    let Some(tx) = pending.lock().remove(request_id) else {
        tracing::debug!(topic = %topic, "mqtt response with no pending request");
        return;
    };
    match serde_json::from_slice::<ServiceReply>(payload) {
        Ok(reply) => {
            let _ = tx.send(reply);
        }
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "undecodable mqtt response");
            let _ = tx.send(ServiceReply {
                success: false,
                response: None,
                error: Some(format!("undecodable response: {e}")),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_response_completes_pending() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert("abc123".to_string(), tx);

        route_response(
            &pending,
            "commands/music/response/abc123",
            br#"{"success":true,"response":"done"}"#,
        );
        let reply = rx.try_recv().unwrap();
        assert!(reply.success);
        assert!(pending.lock().is_empty());
    }

    #[test]
    fn test_route_ignores_foreign_topics() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert("abc123".to_string(), tx);

        route_response(&pending, "health/music", br#"{"status":"healthy"}"#);
        assert!(rx.try_recv().is_err());
        assert_eq!(pending.lock().len(), 1);
    }
}
