//! Operational command models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An ad-hoc command addressed to a single device.
///
/// Stateless; not persisted beyond delivery acknowledgment. Delivery is
/// at-least-once, so the `correlation_id` is the device's deduplication key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub device_id: String,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub correlation_id: String,
}

impl CommandEnvelope {
    pub fn new(
        device_id: impl Into<String>,
        command_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            command_type: command_type.into(),
            payload,
            correlation_id: Uuid::new_v4().to_string(),
        }
    }
}

/// How the device disposed of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckResult {
    Applied,
    Duplicate,
    Rejected,
}

/// Acknowledgment published on the device's command-ack address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAck {
    pub device_id: String,
    pub correlation_id: String,
    pub result: AckResult,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl CommandAck {
    pub fn new(envelope: &CommandEnvelope, result: AckResult, detail: Option<String>) -> Self {
        Self {
            device_id: envelope.device_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            result,
            detail,
            timestamp: Utc::now(),
        }
    }
}
