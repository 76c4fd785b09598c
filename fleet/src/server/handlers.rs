//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::FleetError;
use crate::models::image::{Checksum, UpdateImage};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "gridlink-fleet".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Fleet device list handler
pub async fn devices_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.coordinator.devices().await)
}

/// Single device handler
pub async fn device_handler(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.coordinator.device(&device_id).await {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError::from(FleetError::UnknownDevice(device_id))),
    }
}

/// Session history for one device
pub async fn device_sessions_handler(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    Json(state.coordinator.sessions_for(&device_id).await)
}

/// All non-terminal sessions
pub async fn active_sessions_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.coordinator.active_sessions().await)
}

/// Single session handler
pub async fn session_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.coordinator.session(&session_id).await {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError::from(FleetError::UnknownSession(session_id))),
    }
}

/// Start update request
#[derive(Debug, Deserialize)]
pub struct StartUpdateRequest {
    pub device_id: String,
    pub version: String,
    pub url: String,
    /// Algorithm-tagged digest string, e.g. `sha256:<hex>`
    pub checksum: String,
    pub size_bytes: Option<u64>,
    pub signature: Option<String>,
}

/// Start update response
#[derive(Debug, Serialize)]
pub struct StartUpdateResponse {
    pub session_id: String,
}

/// Start update handler
pub async fn start_update_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<StartUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let checksum: Checksum = request.checksum.parse().map_err(ApiError::from)?;

    let image = UpdateImage {
        version: request.version,
        source_url: request.url,
        checksum,
        size_bytes: request.size_bytes,
        signature: request.signature,
    };

    let session_id = state
        .coordinator
        .start_update(&request.device_id, image)
        .await
        .map_err(ApiError::from)?;

    Ok((StatusCode::CREATED, Json(StartUpdateResponse { session_id })))
}

/// Cancel response
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Cancel session handler
pub async fn cancel_session_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .coordinator
        .cancel_update(&session_id)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(CancelResponse { cancelled: true }))
}

/// Dispatch command request
#[derive(Debug, Deserialize)]
pub struct DispatchCommandRequest {
    pub command_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Dispatch command response
#[derive(Debug, Serialize)]
pub struct DispatchCommandResponse {
    pub correlation_id: String,
}

/// Dispatch command handler
pub async fn dispatch_command_handler(
    State(state): State<Arc<ServerState>>,
    Path(device_id): Path<String>,
    Json(request): Json<DispatchCommandRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let correlation_id = state
        .coordinator
        .dispatch_command(&device_id, &request.command_type, request.payload)
        .await
        .map_err(ApiError::from)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DispatchCommandResponse { correlation_id }),
    ))
}

/// Error body returned to operators
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub error: String,
}

/// HTTP mapping of fleet errors
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        let (status, code) = match &err {
            FleetError::SessionBusy(_) => (StatusCode::CONFLICT, "SESSION_BUSY"),
            FleetError::CancelTooLate(_) => (StatusCode::CONFLICT, "CANCEL_TOO_LATE"),
            FleetError::UnknownSession(_) => (StatusCode::NOT_FOUND, "UNKNOWN_SESSION"),
            FleetError::UnknownDevice(_) => (StatusCode::NOT_FOUND, "UNKNOWN_DEVICE"),
            FleetError::ValidationError(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            FleetError::TransportUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "TRANSPORT_UNAVAILABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        Self {
            status,
            body: ErrorBody {
                code,
                error: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}
