//! Command fan-out layer.
//!
//! Delivers ad-hoc operational commands to individual devices through the
//! router's addressing discipline. Dispatch returns once the router accepts
//! the publish — delivery is fire-and-forget with at-least-once semantics,
//! and the device deduplicates on `correlation_id`.

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::errors::FleetError;
use crate::models::command::CommandEnvelope;
use crate::router::{Envelope, MessageRouter, TopicKind};

#[derive(Clone)]
pub struct CommandFanout {
    router: MessageRouter,
}

impl CommandFanout {
    pub fn new(router: MessageRouter) -> Self {
        Self { router }
    }

    /// Publish one command to one device, returning its correlation id
    pub async fn dispatch(
        &self,
        device_id: &str,
        command_type: &str,
        payload: serde_json::Value,
    ) -> Result<String, FleetError> {
        if device_id.trim().is_empty() {
            return Err(FleetError::ValidationError("device id is empty".to_string()));
        }
        if command_type.trim().is_empty() {
            return Err(FleetError::ValidationError("command type is empty".to_string()));
        }

        let envelope = CommandEnvelope::new(device_id, command_type, payload);
        let correlation_id = envelope.correlation_id.clone();

        self.router
            .publish_to(device_id, TopicKind::Command, serde_json::to_value(&envelope)?)
            .await?;

        info!(device_id, command_type, %correlation_id, "command dispatched");
        Ok(correlation_id)
    }

    /// Tap of every device's command acknowledgments
    pub async fn ack_stream(&self) -> UnboundedReceiver<Envelope> {
        self.router.subscribe_fleet(TopicKind::CommandAck).await
    }
}
