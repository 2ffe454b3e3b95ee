//! HTTP transport
//!
//! `POST /invoke` with the JSON call payload; the response body is the
//! standard reply schema. Connection-level failures are transport
//! errors (retryable); a parseable error body is a service error.

use orchestrator_core::{InvokeError, ServiceCall, ServiceDescriptor, ServiceReply};

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            // Per-attempt deadlines are enforced by the invoker, not here
            client: reqwest::Client::new(),
        }
    }

    pub async fn request(
        &self,
        service: &ServiceDescriptor,
        call: &ServiceCall,
    ) -> Result<ServiceReply, InvokeError> {
        let url = format!("{}/invoke", service.base_url());
        let response = self
            .client
            .post(&url)
            .json(call)
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let status = response.status();
        match response.json::<ServiceReply>().await {
            Ok(reply) => Ok(reply),
            Err(_) if status.is_server_error() || status.is_client_error() => Err(
                InvokeError::Service(format!("{} returned {status}", service.name)),
            ),
            Err(e) => Err(InvokeError::Transport(format!(
                "invalid response body from {}: {e}",
                service.name
            ))),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_send_error(e: &reqwest::Error) -> InvokeError {
    if e.is_timeout() {
        InvokeError::Timeout
    } else {
        InvokeError::Transport(e.to_string())
    }
}
