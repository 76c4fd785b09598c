//! Status events reported by devices

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::device::SlotId;

/// Closed set of status kinds a device may report.
///
/// Progress kinds narrate a session moving forward; terminal kinds end it.
/// Wire form is SCREAMING_SNAKE_CASE, e.g. `DOWNLOAD_FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    // Progress
    Downloading,
    Verified,
    Installing,
    Staged,
    Rebooting,
    Healthcheck,

    // Terminal
    DownloadFailed,
    ChecksumFailed,
    SignatureFailed,
    InstallFailed,
    UpdateSuccess,
    RollbackExecuted,
    RollbackFailed,
    SessionTimeout,
    SessionBusy,
}

impl StatusKind {
    /// Whether this kind ends the session it references
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StatusKind::DownloadFailed
                | StatusKind::ChecksumFailed
                | StatusKind::SignatureFailed
                | StatusKind::InstallFailed
                | StatusKind::UpdateSuccess
                | StatusKind::RollbackExecuted
                | StatusKind::RollbackFailed
                | StatusKind::SessionTimeout
                | StatusKind::SessionBusy
        )
    }
}

/// A status event published by a device on its status address. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub device_id: String,

    /// Absent for non-update events (e.g. a busy refusal with no session)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    pub status: StatusKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// The slot the device considers authoritative at report time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_slot: Option<SlotId>,

    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(device_id: impl Into<String>, session_id: Option<String>, status: StatusKind) -> Self {
        Self {
            device_id: device_id.into(),
            session_id,
            status,
            version: None,
            detail: None,
            active_slot: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_active_slot(mut self, slot: SlotId) -> Self {
        self.active_slot = Some(slot);
        self
    }
}
