//! Finite State Machine for the device-local update lifecycle

use serde::{Deserialize, Serialize};

/// Agent state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// No update in progress
    Idle,

    /// Streaming the image into the inactive slot
    Downloading,

    /// Comparing the computed digest and signature against the notice
    Verifying,

    /// Writing slot metadata; the point of no return for cancellation
    Installing,

    /// Staged and scheduled to boot into the candidate slot
    AwaitingReboot,

    /// Booted into the candidate, running the bounded self-test
    Healthcheck,

    /// Self-test failed, reverting the boot selector
    RollingBack,

    /// Both slots unusable; automatic updates refused until manual reset
    Faulted,
}

/// Agent event
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Update notification accepted
    UpdateAccepted,

    /// Image fully streamed into the inactive slot
    DownloadComplete,

    /// Transport error while streaming
    DownloadFailed(String),

    /// Digest and signature both check out
    VerifyOk,

    /// Digest or signature mismatch
    VerifyFailed(String),

    /// Slot metadata written, boot counter reset
    StageComplete,

    /// Slot metadata could not be written
    InstallFailed(String),

    /// Booted into the candidate slot
    RebootObserved,

    /// Self-test passed within budget
    HealthPassed,

    /// Self-test failed or boot budget exhausted
    HealthFailed(String),

    /// Boot selector reverted to the previous slot
    RollbackOk,

    /// Previous slot also unusable
    RollbackFailed(String),

    /// Operator cancel before the point of no return
    Abort,

    /// Manual recovery after a dual-slot failure
    Reset,
}

/// Update FSM
#[derive(Debug, Clone)]
pub struct UpdateFsm {
    state: AgentState,
    error: Option<String>,
}

impl UpdateFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: AgentState::Idle,
            error: None,
        }
    }

    /// Restore an FSM at a known state (post-reboot resume)
    pub fn resume(state: AgentState) -> Self {
        Self { state, error: None }
    }

    /// Get current state
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Whether an update is in flight
    pub fn busy(&self) -> bool {
        !matches!(self.state, AgentState::Idle | AgentState::Faulted)
    }

    pub fn is_faulted(&self) -> bool {
        self.state == AgentState::Faulted
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: AgentEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            // From Idle
            (AgentState::Idle, AgentEvent::UpdateAccepted) => {
                self.error = None;
                AgentState::Downloading
            }

            // From Downloading
            (AgentState::Downloading, AgentEvent::DownloadComplete) => AgentState::Verifying,
            (AgentState::Downloading, AgentEvent::DownloadFailed(err)) => {
                self.error = Some(err.clone());
                AgentState::Idle
            }
            (AgentState::Downloading, AgentEvent::Abort) => AgentState::Idle,

            // From Verifying
            (AgentState::Verifying, AgentEvent::VerifyOk) => AgentState::Installing,
            (AgentState::Verifying, AgentEvent::VerifyFailed(err)) => {
                self.error = Some(err.clone());
                AgentState::Idle
            }
            (AgentState::Verifying, AgentEvent::Abort) => AgentState::Idle,

            // From Installing
            (AgentState::Installing, AgentEvent::StageComplete) => AgentState::AwaitingReboot,
            (AgentState::Installing, AgentEvent::InstallFailed(err)) => {
                self.error = Some(err.clone());
                AgentState::Idle
            }

            // From AwaitingReboot
            (AgentState::AwaitingReboot, AgentEvent::RebootObserved) => AgentState::Healthcheck,

            // From Healthcheck
            (AgentState::Healthcheck, AgentEvent::HealthPassed) => {
                self.error = None;
                AgentState::Idle
            }
            (AgentState::Healthcheck, AgentEvent::HealthFailed(err)) => {
                self.error = Some(err.clone());
                AgentState::RollingBack
            }

            // From RollingBack
            (AgentState::RollingBack, AgentEvent::RollbackOk) => AgentState::Idle,
            (AgentState::RollingBack, AgentEvent::RollbackFailed(err)) => {
                self.error = Some(err.clone());
                AgentState::Faulted
            }

            // From Faulted
            (AgentState::Faulted, AgentEvent::Reset) => {
                self.error = None;
                AgentState::Idle
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for UpdateFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_path() {
        let mut fsm = UpdateFsm::new();
        assert_eq!(fsm.state(), &AgentState::Idle);
        assert!(!fsm.busy());

        fsm.process(AgentEvent::UpdateAccepted).unwrap();
        assert!(fsm.busy());
        fsm.process(AgentEvent::DownloadComplete).unwrap();
        fsm.process(AgentEvent::VerifyOk).unwrap();
        fsm.process(AgentEvent::StageComplete).unwrap();
        fsm.process(AgentEvent::RebootObserved).unwrap();
        fsm.process(AgentEvent::HealthPassed).unwrap();

        assert_eq!(fsm.state(), &AgentState::Idle);
        assert!(fsm.error().is_none());
    }

    #[test]
    fn test_rollback_path() {
        let mut fsm = UpdateFsm::new();
        fsm.process(AgentEvent::UpdateAccepted).unwrap();
        fsm.process(AgentEvent::DownloadComplete).unwrap();
        fsm.process(AgentEvent::VerifyOk).unwrap();
        fsm.process(AgentEvent::StageComplete).unwrap();
        fsm.process(AgentEvent::RebootObserved).unwrap();
        fsm.process(AgentEvent::HealthFailed("control loop dead".to_string()))
            .unwrap();
        assert_eq!(fsm.state(), &AgentState::RollingBack);

        fsm.process(AgentEvent::RollbackOk).unwrap();
        assert_eq!(fsm.state(), &AgentState::Idle);
        assert_eq!(fsm.error(), Some("control loop dead"));
    }

    #[test]
    fn test_dual_failure_latches_faulted() {
        let mut fsm = UpdateFsm::resume(AgentState::RollingBack);
        fsm.process(AgentEvent::RollbackFailed("slot a corrupt".to_string()))
            .unwrap();
        assert_eq!(fsm.state(), &AgentState::Faulted);
        assert!(!fsm.busy());

        // Faulted refuses a new update
        assert!(fsm.process(AgentEvent::UpdateAccepted).is_err());

        // Manual reset recovers
        fsm.process(AgentEvent::Reset).unwrap();
        assert_eq!(fsm.state(), &AgentState::Idle);
    }

    #[test]
    fn test_verify_failure_returns_to_idle() {
        let mut fsm = UpdateFsm::new();
        fsm.process(AgentEvent::UpdateAccepted).unwrap();
        fsm.process(AgentEvent::DownloadComplete).unwrap();
        fsm.process(AgentEvent::VerifyFailed("digest mismatch".to_string()))
            .unwrap();

        assert_eq!(fsm.state(), &AgentState::Idle);
        assert_eq!(fsm.error(), Some("digest mismatch"));
    }

    #[test]
    fn test_abort_only_before_point_of_no_return() {
        let mut fsm = UpdateFsm::new();
        fsm.process(AgentEvent::UpdateAccepted).unwrap();
        fsm.process(AgentEvent::Abort).unwrap();
        assert_eq!(fsm.state(), &AgentState::Idle);

        let mut fsm = UpdateFsm::resume(AgentState::Installing);
        assert!(fsm.process(AgentEvent::Abort).is_err());
    }
}
