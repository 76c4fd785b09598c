//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::FleetError;
use crate::server::handlers::{
    active_sessions_handler, cancel_session_handler, device_handler, device_sessions_handler,
    devices_handler, dispatch_command_handler, health_handler, session_handler,
    start_update_handler, version_handler,
};
use crate::server::state::ServerState;

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), FleetError>>, FleetError> {
    let app = Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Fleet view
        .route("/devices", get(devices_handler))
        .route("/devices/{device_id}", get(device_handler))
        .route("/devices/{device_id}/sessions", get(device_sessions_handler))
        // Update sessions
        .route("/updates", post(start_update_handler))
        .route("/sessions", get(active_sessions_handler))
        .route("/sessions/{session_id}", get(session_handler))
        .route("/sessions/{session_id}/cancel", post(cancel_session_handler))
        // Commands
        .route("/devices/{device_id}/commands", post(dispatch_command_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| FleetError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| FleetError::ServerError(e.to_string()))
    });

    Ok(handle)
}
