//! Device models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::session::SessionState;

/// One of the two interchangeable storage slots on a gateway.
///
/// Exactly one slot is active (bootable/authoritative) at a time; the other
/// is scratch space for staging update candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    /// The opposite slot
    pub fn other(self) -> SlotId {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SlotId::A => "a",
            SlotId::B => "b",
        }
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The registry's record of one fleet device.
///
/// Created on first contact; mutated only in response to the device's own
/// status reports. Never deleted, only marked inactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Opaque, globally unique device identity
    pub device_id: String,

    /// Last version the device itself confirmed after a passing healthcheck
    pub confirmed_version: Option<String>,

    /// The slot the device reports as active
    pub active_slot: SlotId,

    /// Slot currently holding a staged-but-unconfirmed image, if any
    pub staged_slot: Option<SlotId>,

    /// Timestamp of the most recent status or telemetry message
    pub last_seen_at: Option<DateTime<Utc>>,

    /// Outcome of the most recent update session, as observed by the cloud
    pub last_session_state: Option<SessionState>,

    /// Device reported a dual-slot failure and needs manual recovery
    pub faulted: bool,

    /// Cleared instead of deleting the record
    pub active: bool,
}

impl DeviceRecord {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            confirmed_version: None,
            active_slot: SlotId::A,
            staged_slot: None,
            last_seen_at: None,
            last_session_state: None,
            faulted: false,
            active: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_other() {
        assert_eq!(SlotId::A.other(), SlotId::B);
        assert_eq!(SlotId::B.other(), SlotId::A);
        assert_eq!(SlotId::A.to_string(), "a");
    }
}
