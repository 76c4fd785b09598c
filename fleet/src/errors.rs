//! Error types for the GridLink fleet crate

use thiserror::Error;

/// Main error type for coordinator, router, and edge agent
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("session busy: device {0} already has a non-terminal session")]
    SessionBusy(String),

    #[error("cancel too late: session {0} is past the point of no return")]
    CancelTooLate(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("download error: {0}")]
    Download(String),

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("MQTT error: {0}")]
    MqttError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("shutdown error: {0}")]
    ShutdownError(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for FleetError {
    fn from(err: anyhow::Error) -> Self {
        FleetError::Internal(err.to_string())
    }
}
