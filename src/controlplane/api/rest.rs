//! REST API Handlers
//!
//! Implements the HTTP endpoints for pool status, initial setup, device
//! operations, boot recovery queries and the server-sent progress topics.

use crate::controlplane::orchestrator::OperationOrchestrator;
use crate::controlplane::recovery::BootRecoveryChecker;
use crate::domain::operation::{OperationRecord, ProgressState, ProgressTopic};
use crate::domain::ports::{DeviceId, RaidType};
use crate::error::{Error, ErrorClass};
use crate::hardware::registry::DeviceRegistry;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Initial pool setup request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub device_ids: Vec<String>,
    pub raid_type: RaidType,
}

/// Initial pool setup response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupResponse {
    pub success: bool,
    pub pool_name: String,
    pub usable_space: u64,
}

/// Request naming a single device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub device_id: String,
}

/// Replace request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceRequest {
    pub old_device_id: String,
    pub new_device_id: String,
}

/// An accepted operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub success: bool,
    pub operation_id: String,
    pub kind: String,
    pub state: ProgressState,
    pub progress: u8,
}

impl From<OperationRecord> for OperationResponse {
    fn from(record: OperationRecord) -> Self {
        Self {
            success: true,
            kind: record.kind_name().to_string(),
            state: record.state(),
            progress: record.progress(),
            operation_id: record.id,
        }
    }
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<OperationOrchestrator>,
    recovery: Arc<BootRecoveryChecker>,
    registry: Arc<DeviceRegistry>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(
        orchestrator: Arc<OperationOrchestrator>,
        recovery: Arc<BootRecoveryChecker>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            orchestrator,
            recovery,
            registry,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
            recovery: self.recovery,
            registry: self.registry,
        };

        Router::new()
            // Pool endpoints
            .route("/v1/raid/status", get(get_status))
            .route("/v1/raid/setup", post(setup_pool))
            .route("/v1/raid/devices", post(add_device))
            .route("/v1/raid/replace", post(replace_device))
            .route("/v1/raid/replace/cancel", post(cancel_replace))
            .route("/v1/raid/failsafe", post(transition_to_failsafe))
            // Boot recovery endpoints
            .route("/v1/raid/initial-setup", get(initial_setup_status))
            .route("/v1/raid/mount-failure", get(mount_failure))
            .route("/v1/raid/mount-failure/devices", get(mount_failure_devices))
            // Device endpoints
            .route("/v1/devices", get(list_devices))
            // Push topics
            .route("/v1/events/:topic", get(subscribe_topic))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<OperationOrchestrator>,
    recovery: Arc<BootRecoveryChecker>,
    registry: Arc<DeviceRegistry>,
}

// =============================================================================
// Error Mapping
// =============================================================================

fn error_status(err: &Error) -> StatusCode {
    match err {
        Error::DeviceNotFound { .. } => StatusCode::NOT_FOUND,
        Error::InvalidSetup(_)
        | Error::WrongRaidType { .. }
        | Error::TransitionRequiresSingleDevice { .. }
        | Error::DeviceTooSmall { .. } => StatusCode::BAD_REQUEST,
        e if e.is_precondition() => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(context: &str, err: Error) -> Response {
    let status = error_status(&err);
    let code = match err.class() {
        ErrorClass::Precondition => "precondition_failed",
        ErrorClass::Engine => "engine_error",
        ErrorClass::Integrity => "integrity_error",
        ErrorClass::Storage => "storage_error",
        ErrorClass::Internal => "internal_error",
    };
    if status.is_server_error() {
        warn!(context, error = %err, "Request failed");
    } else {
        debug!(context, error = %err, "Request rejected");
    }

    (
        status,
        Json(ApiErrorResponse {
            error: code.into(),
            message: err.to_string(),
            details: Some(context.to_string()),
        }),
    )
        .into_response()
}

// =============================================================================
// Handlers
// =============================================================================

/// Current pool status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response("status", e),
    }
}

/// Initial pool creation
async fn setup_pool(
    State(state): State<AppState>,
    Json(request): Json<SetupRequest>,
) -> impl IntoResponse {
    info!(devices = ?request.device_ids, raid_type = %request.raid_type, "Setup requested");
    let devices: Vec<DeviceId> = request.device_ids.iter().map(DeviceId::from).collect();

    match state.orchestrator.setup(&devices, request.raid_type).await {
        Ok(pool) => (
            StatusCode::OK,
            Json(SetupResponse {
                success: true,
                usable_space: pool.usable_space(),
                pool_name: pool.pool_name.unwrap_or_default(),
            }),
        )
            .into_response(),
        Err(e) => error_response("setup", e),
    }
}

/// Add a device to the pool
async fn add_device(
    State(state): State<AppState>,
    Json(request): Json<DeviceRequest>,
) -> impl IntoResponse {
    info!(device = %request.device_id, "Add device requested");
    match state
        .orchestrator
        .add_device(&DeviceId::from(request.device_id))
        .await
    {
        Ok(record) => (StatusCode::OK, Json(OperationResponse::from(record))).into_response(),
        Err(e) => error_response("add_device", e),
    }
}

/// Replace a pool member
async fn replace_device(
    State(state): State<AppState>,
    Json(request): Json<ReplaceRequest>,
) -> impl IntoResponse {
    info!(old = %request.old_device_id, new = %request.new_device_id, "Replace requested");
    match state
        .orchestrator
        .replace_device(
            &DeviceId::from(request.old_device_id),
            &DeviceId::from(request.new_device_id),
        )
        .await
    {
        Ok(record) => (StatusCode::OK, Json(OperationResponse::from(record))).into_response(),
        Err(e) => error_response("replace_device", e),
    }
}

/// Cancel the running replace
async fn cancel_replace(State(state): State<AppState>) -> impl IntoResponse {
    match state.orchestrator.cancel_replace().await {
        Ok(()) => (StatusCode::OK, Json(true)).into_response(),
        Err(e) => error_response("cancel_replace", e),
    }
}

/// Convert a single-device storage pool to failsafe
async fn transition_to_failsafe(
    State(state): State<AppState>,
    Json(request): Json<DeviceRequest>,
) -> impl IntoResponse {
    info!(device = %request.device_id, "Failsafe transition requested");
    match state
        .orchestrator
        .transition_to_failsafe(&DeviceId::from(request.device_id))
        .await
    {
        Ok(record) => (StatusCode::OK, Json(OperationResponse::from(record))).into_response(),
        Err(e) => error_response("transition_to_failsafe", e),
    }
}

/// First-boot setup status, callable before any account exists
async fn initial_setup_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.recovery.check_initial_raid_setup_status().await {
        Ok(done) => (StatusCode::OK, Json(done)).into_response(),
        Err(e) => error_response("initial_setup_status", e),
    }
}

/// Whether the pool failed to mount
async fn mount_failure(State(state): State<AppState>) -> impl IntoResponse {
    match state.recovery.check_mount_failure().await {
        Ok(failed) => (StatusCode::OK, Json(failed)).into_response(),
        Err(e) => error_response("mount_failure", e),
    }
}

/// Per-device presence for the recovery UI
async fn mount_failure_devices(State(state): State<AppState>) -> impl IntoResponse {
    match state.recovery.check_mount_failure_devices().await {
        Ok(devices) => (StatusCode::OK, Json(devices)).into_response(),
        Err(e) => error_response("mount_failure_devices", e),
    }
}

/// Devices currently in the bays
async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    match state.registry.list_devices().await {
        Ok(devices) => (StatusCode::OK, Json(devices)).into_response(),
        Err(e) => error_response("list_devices", e),
    }
}

/// Server-sent events for one progress topic
async fn subscribe_topic(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> impl IntoResponse {
    let topic: ProgressTopic = match topic.parse() {
        Ok(topic) => topic,
        Err(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiErrorResponse {
                    error: "not_found".into(),
                    message: format!("Unknown topic {}", topic),
                    details: None,
                }),
            )
                .into_response();
        }
    };

    debug!(%topic, "Progress subscriber connected");
    let stream = state
        .orchestrator
        .bus()
        .subscribe(topic)
        .into_stream()
        .map(move |event| Event::default().event(topic.as_str()).json_data(&event));

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Ready once the bays have been enumerated at least once
    if state.registry.last_refresh().is_some() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "devices not enumerated")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::metrics::RaidMetrics;
    use crate::controlplane::orchestrator::tests::{bays, Harness, FOUR_TB, TWO_TB};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router(h: &Harness) -> Router {
        let recovery = BootRecoveryChecker::new(
            h.orchestrator.clone(),
            h.registry.clone(),
            h.store.clone(),
            h.engine.clone(),
            h.host.clone(),
            RaidMetrics::new().unwrap(),
        );
        RestRouter::new(h.orchestrator.clone(), recovery, h.registry.clone()).build()
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(json) => Body::from(json.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_status_without_pool() {
        let h = Harness::new(bays(&[TWO_TB])).await;
        let app = router(&h);

        let (status, body) = call(&app, "GET", "/v1/raid/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["exists"], false);
        assert_eq!(body["usableSpace"], 0);

        let (status, body) = call(&app, "GET", "/v1/raid/initial-setup", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!(false));
    }

    #[tokio::test]
    async fn test_setup_and_add_over_http() {
        let h = Harness::new(bays(&[TWO_TB, FOUR_TB])).await;
        let app = router(&h);

        let (status, body) = call(
            &app,
            "POST",
            "/v1/raid/setup",
            Some(serde_json::json!({"deviceIds": ["nvme-DEV_1"], "raidType": "storage"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, body) = call(
            &app,
            "POST",
            "/v1/raid/devices",
            Some(serde_json::json!({"deviceId": "nvme-DEV_1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "device already in array");

        let (status, body) = call(
            &app,
            "POST",
            "/v1/raid/devices",
            Some(serde_json::json!({"deviceId": "nvme-DEV_2"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["kind"], "add-device");
        assert_eq!(body["progress"], 100);

        let (_, body) = call(&app, "GET", "/v1/raid/status", None).await;
        assert_eq!(body["raidType"], "storage");
        assert_eq!(body["devices"].as_array().unwrap().len(), 2);
        assert_eq!(body["expansion"]["state"], "finished");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let h = Harness::new(bays(&[TWO_TB])).await;
        let app = router(&h);

        let (status, _) = call(
            &app,
            "POST",
            "/v1/raid/devices",
            Some(serde_json::json!({"deviceId": "nvme-DEV_1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &app,
            "POST",
            "/v1/raid/setup",
            Some(serde_json::json!({"deviceIds": ["nvme-NOPE"], "raidType": "storage"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "POST", "/v1/raid/replace/cancel", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, "GET", "/v1/events/raid:unknown", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_devices_and_readiness() {
        let h = Harness::new(bays(&[TWO_TB, FOUR_TB])).await;
        let app = router(&h);

        let (status, body) = call(&app, "GET", "/v1/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        let devices = body.as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1]["sizeClass"], 4_000_000_000_000u64);

        let (status, _) = call(&app, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
