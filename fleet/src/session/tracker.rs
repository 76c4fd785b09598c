//! Cloud-side session tracker.
//!
//! One independently lockable session slot per device (arena+index pattern):
//! the outer map lock is held only to fetch a slot handle, and all session
//! mutation happens under that device's own lock, so unrelated devices never
//! contend and one slow device cannot delay another's session.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::errors::FleetError;
use crate::models::image::UpdateImage;
use crate::models::session::{SessionState, SessionWindows, UpdateSession};
use crate::models::status::StatusEvent;

#[derive(Default)]
struct DeviceSessions {
    /// Most recent session; once terminal it stays for reads until the next
    /// start archives it
    current: Option<UpdateSession>,
    /// Terminated sessions, retained for audit
    archived: Vec<UpdateSession>,
}

pub struct SessionTracker {
    windows: SessionWindows,
    devices: RwLock<HashMap<String, Arc<Mutex<DeviceSessions>>>>,
    /// session id → device id, for O(1) session lookups
    index: RwLock<HashMap<String, String>>,
}

impl SessionTracker {
    pub fn new(windows: SessionWindows) -> Self {
        Self {
            windows,
            devices: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    async fn device_slot(&self, device_id: &str) -> Arc<Mutex<DeviceSessions>> {
        if let Some(slot) = self.devices.read().await.get(device_id) {
            return slot.clone();
        }
        let mut devices = self.devices.write().await;
        devices
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceSessions::default())))
            .clone()
    }

    /// Create a session in `PENDING`, enforcing at most one non-terminal
    /// session per device.
    pub async fn start_session(
        &self,
        device_id: &str,
        image: UpdateImage,
    ) -> Result<UpdateSession, FleetError> {
        let slot = self.device_slot(device_id).await;
        let mut sessions = slot.lock().await;

        if let Some(current) = &sessions.current {
            if !current.state.is_terminal() {
                return Err(FleetError::SessionBusy(device_id.to_string()));
            }
        }

        let deadline = self.windows.deadline_from(Utc::now());
        let session = UpdateSession::new(device_id, image, deadline);

        self.index
            .write()
            .await
            .insert(session.session_id.clone(), device_id.to_string());

        if let Some(finished) = sessions.current.take() {
            sessions.archived.push(finished);
        }
        sessions.current = Some(session.clone());

        info!(
            device_id,
            session_id = %session.session_id,
            target_version = %session.target_version,
            "session started"
        );
        Ok(session)
    }

    /// Apply a device status report to its session.
    ///
    /// Returns the new state on a transition, `None` when the event was
    /// ignored (no session reference, unknown/terminal session, or a report
    /// that does not apply to the current state — all logged as anomalies,
    /// never errors, because delivery is at-least-once).
    pub async fn apply_status(&self, event: &StatusEvent) -> Option<SessionState> {
        let session_id = event.session_id.as_deref()?;

        let Some(device_id) = self.index.read().await.get(session_id).cloned() else {
            warn!(session_id, device_id = %event.device_id, "status for unknown session, ignoring");
            return None;
        };

        // A session id can only ever transition state belonging to the
        // device it was issued for.
        if device_id != event.device_id {
            warn!(
                session_id,
                expected = %device_id,
                reported = %event.device_id,
                "status device identity does not match session owner, ignoring"
            );
            return None;
        }

        let slot = self.device_slot(&device_id).await;
        let mut sessions = slot.lock().await;

        let Some(current) = sessions.current.as_mut().filter(|s| s.session_id == session_id)
        else {
            warn!(session_id, device_id = %device_id, "status for archived session, ignoring");
            return None;
        };

        if current.state.is_terminal() {
            warn!(
                session_id,
                state = ?current.state,
                status = ?event.status,
                "status for terminal session, ignoring"
            );
            return None;
        }

        match current.state.on_status(event.status) {
            Some(next) => {
                current.transition(next, event.detail.clone());
                info!(session_id, device_id = %device_id, state = ?next, "session transition");
                Some(next)
            }
            None => {
                warn!(
                    session_id,
                    state = ?current.state,
                    status = ?event.status,
                    "status does not apply to session state, ignoring"
                );
                None
            }
        }
    }

    /// Operator cancellation. Accepted only before the point of no return.
    pub async fn cancel_session(&self, session_id: &str) -> Result<UpdateSession, FleetError> {
        let device_id = self
            .index
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| FleetError::UnknownSession(session_id.to_string()))?;

        let slot = self.device_slot(&device_id).await;
        let mut sessions = slot.lock().await;

        let current = sessions
            .current
            .as_mut()
            .filter(|s| s.session_id == session_id)
            .ok_or_else(|| FleetError::UnknownSession(session_id.to_string()))?;

        if !current.state.accepts_cancel() {
            return Err(FleetError::CancelTooLate(session_id.to_string()));
        }

        current.transition(SessionState::Cancelled, Some("operator cancel".to_string()));
        info!(session_id, device_id = %device_id, "session cancelled");
        Ok(current.clone())
    }

    pub async fn session(&self, session_id: &str) -> Option<UpdateSession> {
        let device_id = self.index.read().await.get(session_id).cloned()?;
        let slot = self.device_slot(&device_id).await;
        let sessions = slot.lock().await;

        if let Some(current) = sessions.current.as_ref().filter(|s| s.session_id == session_id) {
            return Some(current.clone());
        }
        sessions
            .archived
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned()
    }

    /// All sessions (current + archived) for one device, newest last
    pub async fn sessions_for(&self, device_id: &str) -> Vec<UpdateSession> {
        let slot = self.device_slot(device_id).await;
        let sessions = slot.lock().await;
        let mut all = sessions.archived.clone();
        if let Some(current) = &sessions.current {
            all.push(current.clone());
        }
        all
    }

    /// Every non-terminal session in the fleet
    pub async fn active_sessions(&self) -> Vec<UpdateSession> {
        let slots: Vec<Arc<Mutex<DeviceSessions>>> =
            self.devices.read().await.values().cloned().collect();

        let mut active = Vec::new();
        for slot in slots {
            let sessions = slot.lock().await;
            if let Some(current) = &sessions.current {
                if !current.state.is_terminal() {
                    active.push(current.clone());
                }
            }
        }
        active.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        active
    }

    /// Expire every non-terminal session past its deadline. The device is
    /// presumed to have failed silently; no further device input is awaited.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<UpdateSession> {
        let slots: Vec<Arc<Mutex<DeviceSessions>>> =
            self.devices.read().await.values().cloned().collect();

        let mut expired = Vec::new();
        for slot in slots {
            let mut sessions = slot.lock().await;
            if let Some(current) = sessions.current.as_mut() {
                if current.is_expired(now) {
                    current.transition(
                        SessionState::SessionTimeout,
                        Some("deadline exceeded with no terminal report".to_string()),
                    );
                    warn!(
                        session_id = %current.session_id,
                        device_id = %current.device_id,
                        "session timed out"
                    );
                    expired.push(current.clone());
                }
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::image::Checksum;
    use crate::models::status::StatusKind;
    use chrono::Duration as ChronoDuration;

    fn image(version: &str) -> UpdateImage {
        UpdateImage {
            version: version.to_string(),
            source_url: "https://images.gridlink.energy/fw.img".to_string(),
            checksum: Checksum::sha256_of(version.as_bytes()),
            size_bytes: Some(4),
            signature: None,
        }
    }

    fn tracker() -> SessionTracker {
        SessionTracker::new(SessionWindows::default())
    }

    fn status(session: &UpdateSession, kind: StatusKind) -> StatusEvent {
        StatusEvent::new(&session.device_id, Some(session.session_id.clone()), kind)
    }

    #[tokio::test]
    async fn test_at_most_one_session_per_device() {
        let tracker = tracker();
        let first = tracker.start_session("bat-1", image("1.1.0")).await.unwrap();

        let err = tracker.start_session("bat-1", image("1.2.0")).await.unwrap_err();
        assert!(matches!(err, FleetError::SessionBusy(_)));

        // The first session is untouched
        let unchanged = tracker.session(&first.session_id).await.unwrap();
        assert_eq!(unchanged.state, SessionState::Pending);
        assert_eq!(unchanged.target_version, "1.1.0");

        // A different device is unaffected
        tracker.start_session("bat-2", image("1.1.0")).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_session_frees_the_device() {
        let tracker = tracker();
        let first = tracker.start_session("bat-1", image("1.1.0")).await.unwrap();
        tracker
            .apply_status(&status(&first, StatusKind::DownloadFailed))
            .await
            .unwrap();

        let second = tracker.start_session("bat-1", image("1.1.0")).await.unwrap();
        assert_ne!(first.session_id, second.session_id);

        // The archived session remains readable
        let archived = tracker.session(&first.session_id).await.unwrap();
        assert_eq!(archived.state, SessionState::DownloadFailed);
    }

    #[tokio::test]
    async fn test_terminal_events_are_idempotent() {
        let tracker = tracker();
        let session = tracker.start_session("bat-1", image("1.1.0")).await.unwrap();

        assert!(tracker
            .apply_status(&status(&session, StatusKind::DownloadFailed))
            .await
            .is_some());
        // A replayed terminal report is ignored
        assert!(tracker
            .apply_status(&status(&session, StatusKind::DownloadFailed))
            .await
            .is_none());
        assert!(tracker
            .apply_status(&status(&session, StatusKind::UpdateSuccess))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_status_with_foreign_device_identity_is_ignored() {
        let tracker = tracker();
        let session = tracker.start_session("bat-1", image("1.1.0")).await.unwrap();

        let spoofed =
            StatusEvent::new("bat-2", Some(session.session_id.clone()), StatusKind::Downloading);
        assert!(tracker.apply_status(&spoofed).await.is_none());

        let untouched = tracker.session(&session.session_id).await.unwrap();
        assert_eq!(untouched.state, SessionState::Pending);
    }

    #[tokio::test]
    async fn test_cancel_before_and_after_point_of_no_return() {
        let tracker = tracker();

        let cancellable = tracker.start_session("bat-1", image("1.1.0")).await.unwrap();
        tracker
            .apply_status(&status(&cancellable, StatusKind::Downloading))
            .await;
        let cancelled = tracker.cancel_session(&cancellable.session_id).await.unwrap();
        assert_eq!(cancelled.state, SessionState::Cancelled);

        let committed = tracker.start_session("bat-2", image("1.1.0")).await.unwrap();
        for kind in [StatusKind::Downloading, StatusKind::Verified, StatusKind::Installing] {
            tracker.apply_status(&status(&committed, kind)).await;
        }
        let err = tracker.cancel_session(&committed.session_id).await.unwrap_err();
        assert!(matches!(err, FleetError::CancelTooLate(_)));

        assert!(matches!(
            tracker.cancel_session("no-such-session").await.unwrap_err(),
            FleetError::UnknownSession(_)
        ));
    }

    #[tokio::test]
    async fn test_sweep_expires_only_overdue_sessions() {
        let tracker = SessionTracker::new(SessionWindows {
            download: std::time::Duration::from_secs(10),
            install: std::time::Duration::from_secs(10),
            healthcheck: std::time::Duration::from_secs(10),
        });

        let stale = tracker.start_session("bat-1", image("1.1.0")).await.unwrap();
        let fresh = tracker.start_session("bat-2", image("1.1.0")).await.unwrap();

        // Nothing expires at the deadline boundary
        assert!(tracker.sweep_expired(Utc::now()).await.is_empty());

        let later = Utc::now() + ChronoDuration::seconds(31);
        let expired = tracker.sweep_expired(later).await;
        assert_eq!(expired.len(), 2);

        // Already-terminal sessions are not expired twice
        assert!(tracker.sweep_expired(later).await.is_empty());

        assert_eq!(
            tracker.session(&stale.session_id).await.unwrap().state,
            SessionState::SessionTimeout
        );
        assert_eq!(
            tracker.session(&fresh.session_id).await.unwrap().state,
            SessionState::SessionTimeout
        );
    }
}
