//! Update session model and cloud-side state machine

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::image::{UpdateImage, UpdateNotice};
use crate::models::status::StatusKind;

/// Cloud-side view of one update session's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Pending,
    Downloading,
    Verified,
    Installing,
    Staged,
    AwaitingReboot,
    HealthcheckPending,

    // Terminal
    DownloadFailed,
    ChecksumFailed,
    InstallFailed,
    UpdateSuccess,
    RollbackExecuted,
    RollbackFailed,
    SessionTimeout,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::DownloadFailed
                | SessionState::ChecksumFailed
                | SessionState::InstallFailed
                | SessionState::UpdateSuccess
                | SessionState::RollbackExecuted
                | SessionState::RollbackFailed
                | SessionState::SessionTimeout
                | SessionState::Cancelled
        )
    }

    /// Operator cancellation is honored only before the point of no return
    pub fn accepts_cancel(self) -> bool {
        matches!(self, SessionState::Pending | SessionState::Downloading)
    }

    /// Next state for a reported status, or `None` when the report does not
    /// apply to the current state (logged upstream as an anomaly).
    ///
    /// Progress events ride QoS-0-adjacent paths and may be lost, so a
    /// later-phase report is accepted from any earlier non-terminal phase.
    pub fn on_status(self, kind: StatusKind) -> Option<SessionState> {
        use SessionState as S;
        use StatusKind as K;

        if self.is_terminal() {
            return None;
        }

        match (self, kind) {
            (S::Pending, K::Downloading) => Some(S::Downloading),
            (S::Pending | S::Downloading, K::DownloadFailed) => Some(S::DownloadFailed),
            (S::Pending | S::Downloading, K::Verified) => Some(S::Verified),
            (S::Pending | S::Downloading | S::Verified, K::ChecksumFailed | K::SignatureFailed) => {
                Some(S::ChecksumFailed)
            }
            (S::Pending | S::Downloading | S::Verified, K::Installing) => Some(S::Installing),
            (S::Verified | S::Installing, K::InstallFailed) => Some(S::InstallFailed),
            (S::Verified | S::Installing, K::Staged) => Some(S::Staged),
            (S::Installing | S::Staged, K::Rebooting) => Some(S::AwaitingReboot),
            (S::Staged | S::AwaitingReboot, K::Healthcheck) => Some(S::HealthcheckPending),
            (S::Staged | S::AwaitingReboot | S::HealthcheckPending, K::UpdateSuccess) => {
                Some(S::UpdateSuccess)
            }
            (S::Staged | S::AwaitingReboot | S::HealthcheckPending, K::RollbackExecuted) => {
                Some(S::RollbackExecuted)
            }
            (_, K::RollbackFailed) => Some(S::RollbackFailed),
            // The device refused before doing anything; the session is dead
            // and the operator retries later.
            (s, K::SessionBusy) if s.accepts_cancel() => Some(S::Cancelled),
            _ => None,
        }
    }
}

/// One recorded state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTransition {
    pub state: SessionState,
    pub at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The bounded lifecycle of one update attempt for one device.
///
/// Retained for audit after reaching a terminal state, at which point it is
/// no longer mutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSession {
    pub session_id: String,
    pub device_id: String,
    pub target_version: String,
    pub image: UpdateImage,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub history: Vec<SessionTransition>,
}

impl UpdateSession {
    pub fn new(device_id: impl Into<String>, image: UpdateImage, deadline_at: DateTime<Utc>) -> Self {
        let started_at = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            target_version: image.version.clone(),
            image,
            state: SessionState::Pending,
            started_at,
            deadline_at,
            history: vec![SessionTransition {
                state: SessionState::Pending,
                at: started_at,
                detail: None,
            }],
        }
    }

    /// Record a transition into `state`, appending to history
    pub fn transition(&mut self, state: SessionState, detail: Option<String>) {
        self.state = state;
        self.history.push(SessionTransition {
            state,
            at: Utc::now(),
            detail,
        });
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && now > self.deadline_at
    }

    /// The notification payload for this session
    pub fn notice(&self) -> UpdateNotice {
        UpdateNotice {
            session_id: self.session_id.clone(),
            version: self.image.version.clone(),
            url: self.image.source_url.clone(),
            checksum: self.image.checksum.clone(),
            size_bytes: self.image.size_bytes,
            signature: self.image.signature.clone(),
        }
    }
}

/// Independently bounded windows for each session phase.
///
/// Values are deployment-specific; override the defaults from configuration.
#[derive(Debug, Clone)]
pub struct SessionWindows {
    pub download: std::time::Duration,
    pub install: std::time::Duration,
    pub healthcheck: std::time::Duration,
}

impl Default for SessionWindows {
    fn default() -> Self {
        Self {
            download: std::time::Duration::from_secs(10 * 60),
            install: std::time::Duration::from_secs(5 * 60),
            healthcheck: std::time::Duration::from_secs(15 * 60),
        }
    }
}

impl SessionWindows {
    /// Session deadline measured from `started_at`
    pub fn deadline_from(&self, started_at: DateTime<Utc>) -> DateTime<Utc> {
        let total = self.download + self.install + self.healthcheck;
        started_at + ChronoDuration::milliseconds(total.as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::image::Checksum;

    fn image(version: &str) -> UpdateImage {
        UpdateImage {
            version: version.to_string(),
            source_url: "https://images.gridlink.energy/fw.img".to_string(),
            checksum: Checksum::sha256_of(b"fw"),
            size_bytes: None,
            signature: None,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = SessionState::Pending;
        for kind in [
            StatusKind::Downloading,
            StatusKind::Verified,
            StatusKind::Installing,
            StatusKind::Staged,
            StatusKind::Rebooting,
            StatusKind::Healthcheck,
            StatusKind::UpdateSuccess,
        ] {
            state = state.on_status(kind).unwrap();
        }
        assert_eq!(state, SessionState::UpdateSuccess);
        assert!(state.is_terminal());
    }

    #[test]
    fn test_skipped_progress_events_are_tolerated() {
        // VERIFIED lost in transit; INSTALLING still lands
        assert_eq!(
            SessionState::Downloading.on_status(StatusKind::Installing),
            Some(SessionState::Installing)
        );
        // Healthcheck progress lost; terminal success still lands
        assert_eq!(
            SessionState::AwaitingReboot.on_status(StatusKind::UpdateSuccess),
            Some(SessionState::UpdateSuccess)
        );
    }

    #[test]
    fn test_terminal_states_ignore_everything() {
        assert_eq!(
            SessionState::UpdateSuccess.on_status(StatusKind::RollbackExecuted),
            None
        );
        assert_eq!(
            SessionState::Cancelled.on_status(StatusKind::Downloading),
            None
        );
    }

    #[test]
    fn test_out_of_order_report_is_rejected() {
        assert_eq!(
            SessionState::HealthcheckPending.on_status(StatusKind::Downloading),
            None
        );
    }

    #[test]
    fn test_cancel_window() {
        assert!(SessionState::Pending.accepts_cancel());
        assert!(SessionState::Downloading.accepts_cancel());
        assert!(!SessionState::Installing.accepts_cancel());
        assert!(!SessionState::Staged.accepts_cancel());
    }

    #[test]
    fn test_session_history_and_expiry() {
        let windows = SessionWindows {
            download: std::time::Duration::from_secs(60),
            install: std::time::Duration::from_secs(60),
            healthcheck: std::time::Duration::from_secs(60),
        };
        let now = Utc::now();
        let mut session = UpdateSession::new("bat-1", image("1.1.0"), windows.deadline_from(now));

        session.transition(SessionState::Downloading, None);
        assert_eq!(session.history.len(), 2);
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + ChronoDuration::seconds(181)));

        session.transition(SessionState::DownloadFailed, Some("link flap".into()));
        // Terminal sessions never expire into SESSION_TIMEOUT
        assert!(!session.is_expired(now + ChronoDuration::seconds(181)));
    }
}
