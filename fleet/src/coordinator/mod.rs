//! Update coordinator.
//!
//! Thin orchestration layer over the session tracker, registry, and router:
//! validates operator requests, publishes notifications, consumes status
//! events, and exposes aggregated read-only state. It proposes and observes;
//! it never writes a device's confirmed state directly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::FleetError;
use crate::fanout::CommandFanout;
use crate::models::device::DeviceRecord;
use crate::models::image::UpdateImage;
use crate::models::session::{SessionWindows, UpdateSession};
use crate::models::status::StatusEvent;
use crate::registry::DeviceRegistry;
use crate::router::{Envelope, MessageRouter, TopicKind};
use crate::session::SessionTracker;

/// Coordinator configuration
#[derive(Debug, Clone, Default)]
pub struct CoordinatorOptions {
    /// Hosts an image URL may point at; unrestricted when `None`
    pub allowed_image_hosts: Option<Vec<String>>,
}

pub struct Coordinator {
    registry: Arc<DeviceRegistry>,
    tracker: Arc<SessionTracker>,
    router: MessageRouter,
    fanout: CommandFanout,
    options: CoordinatorOptions,
}

impl Coordinator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        tracker: Arc<SessionTracker>,
        router: MessageRouter,
        options: CoordinatorOptions,
    ) -> Self {
        let fanout = CommandFanout::new(router.clone());
        Self {
            registry,
            tracker,
            router,
            fanout,
            options,
        }
    }

    /// Convenience constructor wiring fresh state onto a router
    pub fn with_defaults(router: MessageRouter, windows: SessionWindows) -> Self {
        Self::new(
            Arc::new(DeviceRegistry::new()),
            Arc::new(SessionTracker::new(windows)),
            router,
            CoordinatorOptions::default(),
        )
    }

    // ========================= OPERATOR SURFACE ========================== //

    /// Start an update session and publish its notification.
    ///
    /// Fails with `SessionBusy` when the device already has a non-terminal
    /// session. If the transport rejects the publish the just-created
    /// session is cancelled so the start is atomic from the operator's view.
    pub async fn start_update(
        &self,
        device_id: &str,
        image: UpdateImage,
    ) -> Result<String, FleetError> {
        self.validate_request(device_id, &image)?;

        let session = self.tracker.start_session(device_id, image).await?;
        let notice = session.notice();

        let payload = serde_json::to_value(&notice)?;
        if let Err(e) = self
            .router
            .publish_to(device_id, TopicKind::Update, payload)
            .await
        {
            warn!(
                session_id = %session.session_id,
                error = %e,
                "notification publish failed, cancelling session"
            );
            let _ = self.tracker.cancel_session(&session.session_id).await;
            return Err(e);
        }

        info!(
            device_id,
            session_id = %session.session_id,
            version = %session.target_version,
            "update published"
        );
        Ok(session.session_id)
    }

    /// Cancel a session. Accepted only before the device's point of no
    /// return; later requests fail with `CancelTooLate`.
    pub async fn cancel_update(&self, session_id: &str) -> Result<(), FleetError> {
        let session = self.tracker.cancel_session(session_id).await?;

        // Best effort: tell the device to stop downloading. If this is lost
        // the device's own report lands on a terminal session and is ignored.
        if let Err(e) = self
            .fanout
            .dispatch(&session.device_id, "cancel_update", serde_json::json!({}))
            .await
        {
            warn!(session_id, error = %e, "cancel command not delivered");
        }
        Ok(())
    }

    pub async fn session(&self, session_id: &str) -> Option<UpdateSession> {
        self.tracker.session(session_id).await
    }

    pub async fn sessions_for(&self, device_id: &str) -> Vec<UpdateSession> {
        self.tracker.sessions_for(device_id).await
    }

    pub async fn active_sessions(&self) -> Vec<UpdateSession> {
        self.tracker.active_sessions().await
    }

    pub async fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.registry.get(device_id).await
    }

    pub async fn devices(&self) -> Vec<DeviceRecord> {
        self.registry.snapshot().await
    }

    /// Dispatch a non-update command to one device
    pub async fn dispatch_command(
        &self,
        device_id: &str,
        command_type: &str,
        payload: serde_json::Value,
    ) -> Result<String, FleetError> {
        self.fanout.dispatch(device_id, command_type, payload).await
    }

    // ========================== EVENT HANDLING =========================== //

    /// Fold one routed status event into tracker and registry
    pub async fn handle_status(&self, envelope: Envelope) {
        let event: StatusEvent = match serde_json::from_value(envelope.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "malformed status event, dropping");
                return;
            }
        };

        // A report whose payload identity disagrees with the address it
        // arrived on is a spoof or a router defect; either way it must not
        // touch any device's state.
        if event.device_id != envelope.address.device_id {
            warn!(
                address = %envelope.address.device_id,
                claimed = %event.device_id,
                "status identity mismatch, dropping"
            );
            return;
        }

        self.registry.observe_status(&event).await;
        self.tracker.apply_status(&event).await;
    }

    /// Fold heartbeat/telemetry into the registry's last-seen view
    pub async fn handle_telemetry(&self, envelope: Envelope) {
        debug!(device_id = %envelope.address.device_id, "telemetry received");
        self.registry
            .touch(&envelope.address.device_id, envelope.published_at)
            .await;
    }

    /// Expire overdue sessions. Devices presumed failed silently are
    /// reported to the registry without waiting for further input.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let expired = self.tracker.sweep_expired(now).await;
        for session in &expired {
            self.registry
                .observe_timeout(&session.device_id, now)
                .await;
        }
        expired.len()
    }

    // ============================ VALIDATION ============================= //

    fn validate_request(&self, device_id: &str, image: &UpdateImage) -> Result<(), FleetError> {
        if device_id.trim().is_empty() {
            return Err(FleetError::ValidationError("device id is empty".to_string()));
        }
        if image.version.trim().is_empty() {
            return Err(FleetError::ValidationError("target version is empty".to_string()));
        }

        let url = Url::parse(&image.source_url).map_err(|e| {
            FleetError::ValidationError(format!("invalid image URL '{}': {e}", image.source_url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FleetError::ValidationError(format!(
                "image URL scheme '{}' not allowed",
                url.scheme()
            )));
        }

        if let Some(allowed) = &self.options.allowed_image_hosts {
            let host = url.host_str().unwrap_or_default();
            if !allowed.iter().any(|a| a == host) {
                return Err(FleetError::ValidationError(format!(
                    "image host '{}' not in allowed hosts",
                    host
                )));
            }
        }

        Ok(())
    }
}
