//! Device registry.
//!
//! Single-writer fleet view: the coordinator's status consumer is the only
//! writer, dashboards are readers. Device records are created on first
//! contact and mutated only in response to the device's own reports — the
//! cloud proposes updates and observes outcomes, it never writes a device's
//! confirmed state directly.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::FleetError;
use crate::models::device::DeviceRecord;
use crate::models::session::SessionState;
use crate::models::status::{StatusEvent, StatusKind};

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Fold one device status report into the registry view
    pub async fn observe_status(&self, event: &StatusEvent) -> DeviceRecord {
        let mut devices = self.devices.write().await;
        let record = devices
            .entry(event.device_id.clone())
            .or_insert_with(|| {
                info!(device_id = %event.device_id, "first contact, registering device");
                DeviceRecord::new(&event.device_id)
            });

        record.last_seen_at = Some(event.timestamp);
        if let Some(slot) = event.active_slot {
            record.active_slot = slot;
        }

        match event.status {
            StatusKind::Staged | StatusKind::Rebooting => {
                record.staged_slot = Some(record.active_slot.other());
            }
            StatusKind::UpdateSuccess => {
                if let Some(version) = &event.version {
                    record.confirmed_version = Some(version.clone());
                }
                record.staged_slot = None;
            }
            StatusKind::RollbackExecuted => {
                // The device reports the version it reverted to
                if let Some(version) = &event.version {
                    record.confirmed_version = Some(version.clone());
                }
                record.staged_slot = None;
            }
            StatusKind::RollbackFailed => {
                record.staged_slot = None;
                record.faulted = true;
            }
            _ => {}
        }

        if event.session_id.is_some() {
            if let Some(state) = session_state_for(event.status) {
                record.last_session_state = Some(state);
            }
        }

        debug!(device_id = %event.device_id, status = ?event.status, "registry updated");
        record.clone()
    }

    /// Record a coordinator-declared session timeout for a device that went
    /// silent mid-session
    pub async fn observe_timeout(&self, device_id: &str, at: DateTime<Utc>) {
        let mut devices = self.devices.write().await;
        let record = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRecord::new(device_id));
        record.last_session_state = Some(SessionState::SessionTimeout);
        // last_seen_at is deliberately untouched: the device did NOT report
        let _ = at;
    }

    /// Refresh last-seen from heartbeat/telemetry traffic
    pub async fn touch(&self, device_id: &str, at: DateTime<Utc>) {
        let mut devices = self.devices.write().await;
        let record = devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                info!(device_id, "first contact via telemetry, registering device");
                DeviceRecord::new(device_id)
            });
        record.last_seen_at = Some(at);
    }

    /// Devices are never deleted, only marked inactive
    pub async fn mark_inactive(&self, device_id: &str) -> Result<(), FleetError> {
        let mut devices = self.devices.write().await;
        let record = devices
            .get_mut(device_id)
            .ok_or_else(|| FleetError::UnknownDevice(device_id.to_string()))?;
        record.active = false;
        Ok(())
    }

    pub async fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.devices.read().await.contains_key(device_id)
    }

    /// Fleet snapshot, sorted by device id
    pub async fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.devices.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        records
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn session_state_for(kind: StatusKind) -> Option<SessionState> {
    match kind {
        StatusKind::Downloading => Some(SessionState::Downloading),
        StatusKind::Verified => Some(SessionState::Verified),
        StatusKind::Installing => Some(SessionState::Installing),
        StatusKind::Staged => Some(SessionState::Staged),
        StatusKind::Rebooting => Some(SessionState::AwaitingReboot),
        StatusKind::Healthcheck => Some(SessionState::HealthcheckPending),
        StatusKind::DownloadFailed => Some(SessionState::DownloadFailed),
        StatusKind::ChecksumFailed | StatusKind::SignatureFailed => Some(SessionState::ChecksumFailed),
        StatusKind::InstallFailed => Some(SessionState::InstallFailed),
        StatusKind::UpdateSuccess => Some(SessionState::UpdateSuccess),
        StatusKind::RollbackExecuted => Some(SessionState::RollbackExecuted),
        StatusKind::RollbackFailed => Some(SessionState::RollbackFailed),
        StatusKind::SessionTimeout => Some(SessionState::SessionTimeout),
        StatusKind::SessionBusy => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device::SlotId;

    #[tokio::test]
    async fn test_first_contact_creates_record() {
        let registry = DeviceRegistry::new();
        assert!(!registry.contains("bat-1").await);

        let event = StatusEvent::new("bat-1", None, StatusKind::Healthcheck);
        registry.observe_status(&event).await;

        let record = registry.get("bat-1").await.unwrap();
        assert!(record.active);
        assert!(record.confirmed_version.is_none());
        assert_eq!(record.last_seen_at, Some(event.timestamp));
    }

    #[tokio::test]
    async fn test_success_commits_version() {
        let registry = DeviceRegistry::new();
        let event = StatusEvent::new("bat-1", Some("s-1".into()), StatusKind::UpdateSuccess)
            .with_version("1.1.0")
            .with_active_slot(SlotId::B);
        registry.observe_status(&event).await;

        let record = registry.get("bat-1").await.unwrap();
        assert_eq!(record.confirmed_version.as_deref(), Some("1.1.0"));
        assert_eq!(record.active_slot, SlotId::B);
        assert_eq!(record.staged_slot, None);
        assert_eq!(record.last_session_state, Some(SessionState::UpdateSuccess));
    }

    #[tokio::test]
    async fn test_rollback_failure_latches_fault() {
        let registry = DeviceRegistry::new();
        let event = StatusEvent::new("bat-1", Some("s-1".into()), StatusKind::RollbackFailed);
        registry.observe_status(&event).await;

        let record = registry.get("bat-1").await.unwrap();
        assert!(record.faulted);
    }

    #[tokio::test]
    async fn test_mark_inactive_keeps_record() {
        let registry = DeviceRegistry::new();
        registry.touch("bat-1", Utc::now()).await;
        registry.mark_inactive("bat-1").await.unwrap();

        let record = registry.get("bat-1").await.unwrap();
        assert!(!record.active);
        assert!(matches!(
            registry.mark_inactive("ghost").await,
            Err(FleetError::UnknownDevice(_))
        ));
    }
}
