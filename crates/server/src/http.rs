//! HTTP endpoints
//!
//! REST surface for the orchestrator: command submission (doubling as
//! the `web` adapter), session/user/device context administration,
//! service registration, health, readiness, and Prometheus metrics.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use orchestrator_core::{
    CommandSubmission, DeviceRecord, HealthStatus, InterfaceTag, RequestId, ServiceDescriptor,
    UserRecord,
};

use crate::state::AppState;

/// Extra wait beyond the command deadline before the HTTP handler gives
/// up and reports the request as still pending.
const RESULT_WAIT_MARGIN: Duration = Duration::from_secs(1);

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let cors_layer = build_cors_layer(
        &state.settings.server.cors_origins,
        state.settings.server.cors_enabled,
    );

    Router::new()
        // Command submission and cancellation
        .route("/api/commands", post(submit_command))
        .route("/api/commands/:id/cancel", post(cancel_command))

        // Session endpoints
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id", delete(delete_session))
        .route("/api/sessions/:id/commands", get(recent_commands))

        // User endpoints
        .route("/api/users", post(create_user))
        .route("/api/users/:id", get(get_user))
        .route("/api/users/:id", put(update_user))
        .route("/api/users/:id", delete(delete_user))

        // Device endpoints
        .route("/api/devices", post(register_device))
        .route("/api/devices/:id", get(get_device))
        .route("/api/devices/:id", delete(delete_device))
        .route("/api/devices/:id/state", post(update_device_state))

        // Service registry endpoints
        .route("/api/services", get(list_services))
        .route("/api/services", post(register_service))
        .route("/api/services/:name", delete(unregister_service))
        .route("/api/services/:name/heartbeat", post(service_heartbeat))

        // Health and observability
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))

        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        tracing::warn!("CORS is disabled - allowing all origins (NOT FOR PRODUCTION)");
        return CorsLayer::permissive();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    if parsed.is_empty() {
        return CorsLayer::new()
            .allow_origin(
                "http://localhost:3000"
                    .parse::<HeaderValue>()
                    .expect("static origin"),
            )
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers(Any);
    }

    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

/// Submit a command. Web submissions wait for the result; other
/// interfaces get their result through their own adapter and receive
/// only the request id here.
async fn submit_command(
    State(state): State<AppState>,
    Json(submission): Json<CommandSubmission>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let wait_for_result = submission.interface == InterfaceTag::Web;
    let wait_budget = Duration::from_millis(
        submission
            .deadline_ms
            .unwrap_or(state.settings.pipeline.default_deadline_ms),
    ) + RESULT_WAIT_MARGIN;

    let id = state
        .dispatch
        .submit(submission)
        .await
        .map_err(StatusCode::from)?;

    if !wait_for_result {
        return Ok(Json(serde_json::json!({
            "requestId": id,
            "accepted": true,
        })));
    }

    let rx = state.web.subscribe(id.clone());
    match tokio::time::timeout(wait_budget, rx).await {
        Ok(Ok(result)) => Ok(Json(
            serde_json::to_value(result).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
        )),
        _ => {
            state.web.unsubscribe(&id);
            Ok(Json(serde_json::json!({
                "requestId": id,
                "pending": true,
            })))
        }
    }
}

/// Cancel an in-flight command
async fn cancel_command(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.pipeline.cancel(&RequestId::from(id)) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    user_id: String,
    interface: InterfaceTag,
}

/// Create a session
async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state
        .context
        .create_session(&request.user_id, request.interface)
        .await
    {
        Ok(record) => Ok(Json(serde_json::json!({
            "sessionId": record.id,
            "createdAt": record.created_at,
        }))),
        Err(e) => {
            tracing::error!("Session creation failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Get session info (touches last-accessed)
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let record = state
        .context
        .get_session_context(&id)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(Json(
        serde_json::to_value(record).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
    ))
}

/// Delete session
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    match state.context.delete_session(&id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    #[serde(default = "default_recent_count")]
    count: usize,
}

fn default_recent_count() -> usize {
    10
}

/// Most recent commands of a session
async fn recent_commands(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let commands = state
        .context
        .get_recent_commands(&id, query.count)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(Json(serde_json::json!({
        "sessionId": id,
        "commands": commands,
    })))
}

/// Create a user
async fn create_user(
    State(state): State<AppState>,
    Json(record): Json<UserRecord>,
) -> StatusCode {
    match state.context.create_user(record).await {
        Ok(()) => StatusCode::CREATED,
        Err(orchestrator_context::ContextError::AlreadyExists(_)) => StatusCode::CONFLICT,
        Err(e) => {
            tracing::error!("User creation failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UserRecord>, StatusCode> {
    state
        .context
        .get_user_context(&id)
        .await
        .map(Json)
        .map_err(|_| StatusCode::NOT_FOUND)
}

async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(record): Json<UserRecord>,
) -> StatusCode {
    match state.context.update_user(&id, record).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(orchestrator_context::ContextError::NotFound(_)) => StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!("User update failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn delete_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    match state.context.delete_user(&id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

/// Register (or re-register) a device
async fn register_device(
    State(state): State<AppState>,
    Json(record): Json<DeviceRecord>,
) -> StatusCode {
    match state.context.register_device(record).await {
        Ok(()) => StatusCode::CREATED,
        Err(e) => {
            tracing::error!("Device registration failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceRecord>, StatusCode> {
    state
        .context
        .get_device_context(&id)
        .await
        .map(Json)
        .map_err(|_| StatusCode::NOT_FOUND)
}

async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    match state.context.delete_device(&id).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

#[derive(Debug, Deserialize)]
struct DeviceStateUpdate {
    key: String,
    value: String,
}

/// Merge one key into a device's current state
async fn update_device_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<DeviceStateUpdate>,
) -> StatusCode {
    match state
        .context
        .update_device_state(&id, &update.key, &update.value)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(orchestrator_context::ContextError::NotFound(_)) => StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!("Device state update failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// List registered services
async fn list_services(State(state): State<AppState>) -> Json<serde_json::Value> {
    let services = state.registry.list_services();
    Json(serde_json::json!({
        "services": services,
        "count": services.len(),
    }))
}

/// Register a downstream service
async fn register_service(
    State(state): State<AppState>,
    Json(descriptor): Json<ServiceDescriptor>,
) -> StatusCode {
    match state.registry.register_service(descriptor) {
        Ok(()) => StatusCode::CREATED,
        Err(orchestrator_registry::RegistryError::Conflict(_)) => StatusCode::CONFLICT,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn unregister_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> StatusCode {
    match state.registry.unregister_service(&name) {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::NOT_FOUND,
    }
}

#[derive(Debug, Deserialize)]
struct HeartbeatReport {
    status: HealthStatus,
}

/// Explicit heartbeat report (used by mqtt services and tests)
async fn service_heartbeat(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(report): Json<HeartbeatReport>,
) -> StatusCode {
    state.registry.record_heartbeat(&name, report.status);
    StatusCode::ACCEPTED
}

/// Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ready",
        "queueDepth": state.pipeline.queue_len(),
        "activeCommands": state.pipeline.active_count(),
        "sessions": state.context.session_count(),
        "services": state.registry.len(),
        "bufferDiscards": state.dispatch.discarded(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
