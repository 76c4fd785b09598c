//! The device-side update agent.
//!
//! A single cooperative actor per device: one driving loop owns the FSM, the
//! slot store, and the command stream, so there is never a concurrent
//! session to lock against. Every outcome is decided from local state —
//! the coordinator only ever observes.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::agent::fetch::ImageFetcher;
use crate::agent::fsm::{AgentEvent, AgentState, UpdateFsm};
use crate::agent::healthcheck::{Healthcheck, HealthcheckOptions, HealthProbe};
use crate::agent::safety::{MaintenanceWindow, SafetyPolicy, StateHandle};
use crate::agent::slots::{SlotStore, StagedImage};
use crate::models::command::{AckResult, CommandAck, CommandEnvelope};
use crate::models::image::UpdateNotice;
use crate::models::status::{StatusEvent, StatusKind};
use crate::router::{Envelope, MessageRouter, TopicKind};
use crate::signing::UpdateVerifier;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// This device's identity
    pub device_id: String,

    /// Operational thresholds gating update starts
    pub safety: SafetyPolicy,

    /// Post-boot self-test budget
    pub healthcheck: HealthcheckOptions,

    /// Optional local-hour window for update starts
    pub maintenance_window: Option<MaintenanceWindow>,

    /// Accept images without a signature (development only)
    pub allow_unsigned: bool,

    /// How many recent correlation ids to remember for deduplication
    pub command_dedup_capacity: usize,
}

impl AgentOptions {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            safety: SafetyPolicy::default(),
            healthcheck: HealthcheckOptions::default(),
            maintenance_window: None,
            allow_unsigned: true,
            command_dedup_capacity: 128,
        }
    }
}

/// The edge update agent
pub struct UpdateAgent {
    options: AgentOptions,
    fsm: UpdateFsm,
    slots: SlotStore,
    fetcher: Arc<dyn ImageFetcher>,
    probes: Vec<Arc<dyn HealthProbe>>,
    verifier: Option<UpdateVerifier>,
    router: MessageRouter,
    state: StateHandle,
    seen_commands: CommandDedup,
    cancel_requested: bool,
}

impl UpdateAgent {
    pub fn new(
        options: AgentOptions,
        slots: SlotStore,
        fetcher: Arc<dyn ImageFetcher>,
        router: MessageRouter,
        state: StateHandle,
    ) -> Self {
        let capacity = options.command_dedup_capacity;
        Self {
            options,
            fsm: UpdateFsm::new(),
            slots,
            fetcher,
            probes: Vec::new(),
            verifier: None,
            router,
            state,
            seen_commands: CommandDedup::new(capacity),
            cancel_requested: false,
        }
    }

    /// Register a self-test probe
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Require images to carry a valid signature from this key
    pub fn with_verifier(mut self, verifier: UpdateVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.options.device_id
    }

    /// Run the agent until the shutdown signal fires.
    ///
    /// Subscribes to this device's own update and command addresses; nothing
    /// else is observable by construction.
    pub async fn run(mut self, mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>) {
        let device_id = self.options.device_id.clone();
        let mut updates = self.router.subscribe_as(&device_id, TopicKind::Update).await;
        let mut commands = self.router.subscribe_as(&device_id, TopicKind::Command).await;

        info!(%device_id, "update agent starting");

        // Post-reboot path: a staged-but-unconfirmed image means the previous
        // run rebooted into the candidate and the confirming healthcheck is
        // still owed.
        if !self.slots.is_faulted() {
            if let Some(staged) = self.slots.staged().cloned() {
                info!(
                    %device_id,
                    version = %staged.version,
                    "staged image found at boot, resuming healthcheck"
                );
                self.fsm = UpdateFsm::resume(AgentState::AwaitingReboot);
                self.reboot_and_validate(&staged).await;
            }
        }

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!(%device_id, "update agent shutting down");
                    return;
                }
                notice = updates.recv() => {
                    match notice {
                        Some(envelope) => self.handle_update(envelope, &mut commands).await,
                        None => return,
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(envelope) => self.handle_command(envelope).await,
                        None => return,
                    }
                }
            }
        }
    }

    // ============================ UPDATE FLOW ============================ //

    async fn handle_update(&mut self, envelope: Envelope, commands: &mut UnboundedReceiver<Envelope>) {
        let notice: UpdateNotice = match serde_json::from_value(envelope.payload) {
            Ok(notice) => notice,
            Err(e) => {
                warn!(error = %e, "malformed update notice, ignoring");
                return;
            }
        };

        info!(
            session_id = %notice.session_id,
            version = %notice.version,
            "update notification received"
        );

        if self.fsm.is_faulted() {
            self.refuse(&notice, "dual-slot fault latched; manual reset required")
                .await;
            return;
        }
        if self.fsm.busy() || self.slots.staged().is_some() {
            self.refuse(&notice, "an install is already in progress").await;
            return;
        }

        let operational = self.state.snapshot().await;
        if let Err(reason) = self.options.safety.clearance(&operational) {
            self.refuse(&notice, &reason).await;
            return;
        }

        if let Some(window) = &self.options.maintenance_window {
            let now = chrono::Local::now();
            if !window.contains(now) {
                let wait = window.seconds_until_open(now);
                self.refuse(
                    &notice,
                    &format!("outside maintenance window, opens in {}s", wait),
                )
                .await;
                return;
            }
        }

        self.cancel_requested = false;
        self.run_update(notice, commands).await;
    }

    async fn run_update(&mut self, notice: UpdateNotice, commands: &mut UnboundedReceiver<Envelope>) {
        let session_id = notice.session_id.clone();
        self.advance(AgentEvent::UpdateAccepted);
        self.publish_status(&session_id, StatusKind::Downloading, Some(&notice.version), None)
            .await;

        // Stream into the inactive slot, staying responsive to commands so a
        // cancel can abort the download.
        let fetched = {
            let fetcher = self.fetcher.clone();
            let url = notice.url.clone();
            let dest = self.slots.scratch_path();
            let fetch_fut = async move { fetcher.fetch(&url, &dest).await };
            tokio::pin!(fetch_fut);

            loop {
                tokio::select! {
                    result = &mut fetch_fut => break result,
                    command = commands.recv() => {
                        if let Some(envelope) = command {
                            self.handle_command(envelope).await;
                            if self.cancel_requested {
                                info!(%session_id, "download aborted by cancel");
                                let _ = self.slots.discard_scratch().await;
                                self.advance(AgentEvent::Abort);
                                return;
                            }
                        }
                    }
                }
            }
        };

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                // The inactive slot was scratch space; the active slot is
                // untouched.
                let _ = self.slots.discard_scratch().await;
                self.advance(AgentEvent::DownloadFailed(e.to_string()));
                self.publish_status(
                    &session_id,
                    StatusKind::DownloadFailed,
                    Some(&notice.version),
                    Some(e.to_string()),
                )
                .await;
                return;
            }
        };
        self.advance(AgentEvent::DownloadComplete);

        // Digest check. A mismatch must never leave the device bootable into
        // the downloaded bytes.
        if !notice.checksum.matches_hex(&fetched.digest) {
            let detail = format!(
                "expected {}, computed sha256:{}",
                notice.checksum, fetched.digest
            );
            error!(%session_id, %detail, "checksum mismatch");
            let _ = self.slots.discard_scratch().await;
            self.advance(AgentEvent::VerifyFailed(detail.clone()));
            self.publish_status(
                &session_id,
                StatusKind::ChecksumFailed,
                Some(&notice.version),
                Some(detail),
            )
            .await;
            return;
        }

        if let Err(detail) = self.verify_signature(&notice).await {
            error!(%session_id, %detail, "signature rejected");
            let _ = self.slots.discard_scratch().await;
            self.advance(AgentEvent::VerifyFailed(detail.clone()));
            self.publish_status(
                &session_id,
                StatusKind::SignatureFailed,
                Some(&notice.version),
                Some(detail),
            )
            .await;
            return;
        }

        self.publish_status(&session_id, StatusKind::Verified, Some(&notice.version), None)
            .await;

        // Last cancellation checkpoint before the point of no return
        if self.cancel_requested {
            info!(%session_id, "cancelled before install");
            let _ = self.slots.discard_scratch().await;
            self.advance(AgentEvent::Abort);
            return;
        }

        self.advance(AgentEvent::VerifyOk);
        self.publish_status(&session_id, StatusKind::Installing, Some(&notice.version), None)
            .await;

        if let Err(e) = self
            .slots
            .stage(&session_id, &notice.version, &fetched.digest)
            .await
        {
            let _ = self.slots.discard_scratch().await;
            self.advance(AgentEvent::InstallFailed(e.to_string()));
            self.publish_status(
                &session_id,
                StatusKind::InstallFailed,
                Some(&notice.version),
                Some(e.to_string()),
            )
            .await;
            return;
        }

        self.advance(AgentEvent::StageComplete);
        self.publish_status(&session_id, StatusKind::Staged, Some(&notice.version), None)
            .await;
        self.publish_status(&session_id, StatusKind::Rebooting, Some(&notice.version), None)
            .await;

        let staged = StagedImage {
            slot: self.slots.inactive(),
            version: notice.version.clone(),
            session_id: session_id.clone(),
        };
        self.reboot_and_validate(&staged).await;
    }

    /// Post-boot: run the bounded self-test, then commit or roll back. The
    /// decision is made entirely from local state — the device may be
    /// unreachable while unhealthy, so no coordinator round-trip is allowed.
    async fn reboot_and_validate(&mut self, staged: &StagedImage) {
        let session_id = staged.session_id.clone();
        self.advance(AgentEvent::RebootObserved);
        self.publish_status(&session_id, StatusKind::Healthcheck, Some(&staged.version), None)
            .await;

        let checker = Healthcheck::new(self.probes.clone(), self.options.healthcheck.clone());
        let budget = self.options.healthcheck.max_boot_attempts;

        let failure: String = loop {
            let attempts = match self.slots.record_boot_attempt().await {
                Ok(attempts) => attempts,
                Err(e) => break format!("boot counter unwritable: {e}"),
            };
            if attempts > budget {
                break format!("unconfirmed-boot budget exhausted ({budget})");
            }

            match checker.attempt().await {
                Ok(()) => match self.slots.commit().await {
                    Ok(version) => {
                        self.advance(AgentEvent::HealthPassed);
                        info!(%session_id, %version, "update committed");
                        self.publish_status(
                            &session_id,
                            StatusKind::UpdateSuccess,
                            Some(&version),
                            None,
                        )
                        .await;
                        return;
                    }
                    Err(e) => break format!("commit failed: {e}"),
                },
                Err(probe) => {
                    debug!(%session_id, attempts, %probe, "healthcheck attempt failed");
                    tokio::time::sleep(self.options.healthcheck.retry_delay).await;
                }
            }
        };

        warn!(%session_id, %failure, "healthcheck failed, rolling back");
        self.advance(AgentEvent::HealthFailed(failure.clone()));

        match self.slots.rollback().await {
            Ok(previous) => {
                self.advance(AgentEvent::RollbackOk);
                self.publish_status(
                    &session_id,
                    StatusKind::RollbackExecuted,
                    Some(&previous),
                    Some(failure),
                )
                .await;
            }
            Err(e) => {
                self.advance(AgentEvent::RollbackFailed(e.to_string()));
                self.publish_status(
                    &session_id,
                    StatusKind::RollbackFailed,
                    Some(&staged.version),
                    Some(e.to_string()),
                )
                .await;
            }
        }
    }

    async fn verify_signature(&self, notice: &UpdateNotice) -> Result<(), String> {
        let Some(verifier) = &self.verifier else {
            if self.options.allow_unsigned {
                return Ok(());
            }
            return Err("no verifying key configured and unsigned images are not allowed".to_string());
        };

        let Some(signature) = &notice.signature else {
            if self.options.allow_unsigned {
                warn!("accepting unsigned image; never enable allow_unsigned in production");
                return Ok(());
            }
            return Err("image carries no signature".to_string());
        };

        let image = tokio::fs::read(self.slots.scratch_path())
            .await
            .map_err(|e| format!("staged bytes unreadable: {e}"))?;
        verifier
            .verify(&image, signature)
            .map_err(|e| e.to_string())
    }

    async fn refuse(&self, notice: &UpdateNotice, reason: &str) {
        warn!(session_id = %notice.session_id, reason, "update refused");
        self.publish_status(
            &notice.session_id,
            StatusKind::SessionBusy,
            Some(&notice.version),
            Some(reason.to_string()),
        )
        .await;
    }

    // ============================= COMMANDS ============================== //

    async fn handle_command(&mut self, envelope: Envelope) {
        let command: CommandEnvelope = match serde_json::from_value(envelope.payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "malformed command, ignoring");
                return;
            }
        };

        // The router already scopes delivery; a payload tagged with a
        // different identity is a spoof attempt, not ours to act on.
        if command.device_id != self.options.device_id {
            warn!(
                addressed_to = %command.device_id,
                "command payload identity does not match this device, ignoring"
            );
            return;
        }

        if !self.seen_commands.insert(&command.correlation_id) {
            debug!(correlation_id = %command.correlation_id, "duplicate command");
            self.publish_ack(&command, AckResult::Duplicate, None).await;
            return;
        }

        let power = command
            .payload
            .get("power_kw")
            .and_then(|value| value.as_f64())
            .unwrap_or(0.0);

        let (result, detail) = match command.command_type.as_str() {
            "charge" => {
                self.state
                    .apply(|state| {
                        state.mode = crate::agent::safety::OperatingMode::Charge;
                        state.power_kw = power.abs();
                    })
                    .await;
                (AckResult::Applied, None)
            }
            "discharge" => {
                self.state
                    .apply(|state| {
                        state.mode = crate::agent::safety::OperatingMode::Discharge;
                        state.power_kw = -power.abs();
                    })
                    .await;
                (AckResult::Applied, None)
            }
            "idle" => {
                self.state
                    .apply(|state| {
                        state.mode = crate::agent::safety::OperatingMode::Idle;
                        state.power_kw = 0.0;
                    })
                    .await;
                (AckResult::Applied, None)
            }
            "cancel_update" => {
                self.cancel_requested = true;
                let detail = matches!(
                    self.fsm.state(),
                    AgentState::Installing
                        | AgentState::AwaitingReboot
                        | AgentState::Healthcheck
                        | AgentState::RollingBack
                )
                .then(|| "past point of no return; no effect until next safe checkpoint".to_string());
                (AckResult::Applied, detail)
            }
            "reset" => {
                if self.fsm.is_faulted() {
                    match self.slots.clear_fault().await {
                        Ok(()) => {
                            self.advance(AgentEvent::Reset);
                            (AckResult::Applied, None)
                        }
                        Err(e) => (AckResult::Rejected, Some(e.to_string())),
                    }
                } else {
                    (AckResult::Rejected, Some("device is not faulted".to_string()))
                }
            }
            other => (
                AckResult::Rejected,
                Some(format!("unsupported command type: {other}")),
            ),
        };

        info!(
            command_type = %command.command_type,
            correlation_id = %command.correlation_id,
            result = ?result,
            "command handled"
        );
        self.publish_ack(&command, result, detail).await;
    }

    // ============================== HELPERS ============================== //

    fn advance(&mut self, event: AgentEvent) {
        if let Err(e) = self.fsm.process(event) {
            warn!(error = %e, "unexpected agent transition");
        }
    }

    async fn publish_status(
        &self,
        session_id: &str,
        kind: StatusKind,
        version: Option<&str>,
        detail: Option<String>,
    ) {
        let mut event = StatusEvent::new(
            &self.options.device_id,
            Some(session_id.to_string()),
            kind,
        )
        .with_active_slot(self.slots.active());
        if let Some(version) = version {
            event = event.with_version(version);
        }
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }

        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "unserializable status event");
                return;
            }
        };

        if let Err(e) = self
            .router
            .publish_to(&self.options.device_id, TopicKind::Status, payload)
            .await
        {
            // At-least-once: the coordinator's deadline sweep covers us if
            // the report never lands.
            warn!(error = %e, status = ?kind, "could not report status");
        }
    }

    async fn publish_ack(&self, command: &CommandEnvelope, result: AckResult, detail: Option<String>) {
        let ack = CommandAck::new(command, result, detail);
        let payload = match serde_json::to_value(&ack) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "unserializable command ack");
                return;
            }
        };
        if let Err(e) = self
            .router
            .publish_to(&self.options.device_id, TopicKind::CommandAck, payload)
            .await
        {
            warn!(error = %e, "could not publish command ack");
        }
    }
}

/// Bounded memory of recently seen correlation ids
struct CommandDedup {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl CommandDedup {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns `false` when the id was already seen
    fn insert(&mut self, correlation_id: &str) -> bool {
        if self.seen.contains(correlation_id) {
            return false;
        }
        self.seen.insert(correlation_id.to_string());
        self.order.push_back(correlation_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}
