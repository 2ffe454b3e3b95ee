//! Orchestrator server
//!
//! Bridges front-end adapters to the command pipeline, exposes the HTTP
//! and admin surface, and supervises component lifecycle.

pub mod adapters;
pub mod dispatch;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod state;

pub use adapters::{ChannelAdapter, WebAdapter};
pub use dispatch::{FrontendAdapter, UiDispatch};
pub use http::create_router;
pub use lifecycle::Supervisor;
pub use state::AppState;

use thiserror::Error;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Session error: {0}")]
    Session(String),

    #[error("No adapter registered for interface {0}")]
    AdapterUnknown(String),

    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ServerError> for axum::http::StatusCode {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Session(_) => axum::http::StatusCode::NOT_FOUND,
            ServerError::AdapterUnknown(_) => axum::http::StatusCode::BAD_REQUEST,
            ServerError::AdapterUnavailable(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            ServerError::InvalidRequest(_) => axum::http::StatusCode::BAD_REQUEST,
            ServerError::Unavailable(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Init(_) | ServerError::Internal(_) => {
                axum::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
