//! Dual-slot storage.
//!
//! Two interchangeable slots hold full images; exactly one is active
//! (authoritative). An update streams into the inactive slot as scratch,
//! becomes *staged* once verified, and only becomes active at commit after
//! a passing healthcheck. Until commit the previous slot remains the
//! rollback target, so the rollback decision needs nothing but local state.
//!
//! Layout under `base_dir`:
//!
//! ```text
//! slot-a/image.bin   slot-a/meta.json
//! slot-b/image.bin   slot-b/meta.json
//! slots.json         (active marker, staged tag, boot counter, fault latch)
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, warn};

use crate::errors::FleetError;
use crate::models::device::SlotId;
use crate::utils::sha256_file;

/// Filesystem layout of the slot store
#[derive(Debug, Clone)]
pub struct SlotLayout {
    pub base_dir: PathBuf,
}

impl SlotLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn slot_dir(&self, slot: SlotId) -> PathBuf {
        self.base_dir.join(format!("slot-{}", slot))
    }

    pub fn image_file(&self, slot: SlotId) -> PathBuf {
        self.slot_dir(slot).join("image.bin")
    }

    pub fn meta_file(&self, slot: SlotId) -> PathBuf {
        self.slot_dir(slot).join("meta.json")
    }

    pub fn state_file(&self) -> PathBuf {
        self.base_dir.join("slots.json")
    }

    async fn setup(&self) -> Result<(), FleetError> {
        fs::create_dir_all(self.slot_dir(SlotId::A)).await?;
        fs::create_dir_all(self.slot_dir(SlotId::B)).await?;
        Ok(())
    }
}

/// Per-slot metadata written at stage/provision time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotMeta {
    pub version: String,
    /// Hex sha256 of the slot's image file
    pub digest: String,
}

/// A verified image waiting for its confirming healthcheck
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedImage {
    pub slot: SlotId,
    pub version: String,
    pub session_id: String,
}

/// Persistent boot-selection state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotState {
    pub active: SlotId,
    pub staged: Option<StagedImage>,
    pub confirmed_version: Option<String>,
    pub boot_attempts: u32,
    pub faulted: bool,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            active: SlotId::A,
            staged: None,
            confirmed_version: None,
            boot_attempts: 0,
            faulted: false,
        }
    }
}

/// The device's dual-slot store
pub struct SlotStore {
    layout: SlotLayout,
    state: SlotState,
}

impl SlotStore {
    /// Open an existing store, or initialize an empty one
    pub async fn open(layout: SlotLayout) -> Result<Self, FleetError> {
        layout.setup().await?;

        let state_file = layout.state_file();
        let state = if fs::metadata(&state_file).await.is_ok() {
            let raw = fs::read_to_string(&state_file).await?;
            serde_json::from_str(&raw)?
        } else {
            let state = SlotState::default();
            write_json_atomic(&state_file, &state).await?;
            state
        };

        Ok(Self { layout, state })
    }

    /// Initialize a store with a known-good image in slot A (factory
    /// provisioning and test setup)
    pub async fn provision(
        layout: SlotLayout,
        version: &str,
        image: &[u8],
    ) -> Result<Self, FleetError> {
        layout.setup().await?;

        fs::write(layout.image_file(SlotId::A), image).await?;
        let meta = SlotMeta {
            version: version.to_string(),
            digest: crate::utils::sha256_hex(image),
        };
        write_json_atomic(&layout.meta_file(SlotId::A), &meta).await?;

        let state = SlotState {
            active: SlotId::A,
            staged: None,
            confirmed_version: Some(version.to_string()),
            boot_attempts: 0,
            faulted: false,
        };
        write_json_atomic(&layout.state_file(), &state).await?;

        Ok(Self { layout, state })
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn active(&self) -> SlotId {
        self.state.active
    }

    pub fn inactive(&self) -> SlotId {
        self.state.active.other()
    }

    pub fn confirmed_version(&self) -> Option<&str> {
        self.state.confirmed_version.as_deref()
    }

    pub fn staged(&self) -> Option<&StagedImage> {
        self.state.staged.as_ref()
    }

    pub fn boot_attempts(&self) -> u32 {
        self.state.boot_attempts
    }

    pub fn is_faulted(&self) -> bool {
        self.state.faulted
    }

    /// Where a download streams to. Scratch space, not yet authoritative.
    pub fn scratch_path(&self) -> PathBuf {
        self.layout.image_file(self.inactive())
    }

    /// Throw away whatever is in the inactive slot
    pub async fn discard_scratch(&mut self) -> Result<(), FleetError> {
        let inactive = self.inactive();
        for path in [self.layout.image_file(inactive), self.layout.meta_file(inactive)] {
            if fs::metadata(&path).await.is_ok() {
                fs::remove_file(&path).await?;
            }
        }
        if self.state.staged.is_some() {
            self.state.staged = None;
            self.persist().await?;
        }
        Ok(())
    }

    /// Mark the verified scratch image as staged: write the slot metadata,
    /// tag it with the target version, and zero the unconfirmed-boot counter.
    pub async fn stage(
        &mut self,
        session_id: &str,
        version: &str,
        digest: &str,
    ) -> Result<(), FleetError> {
        let inactive = self.inactive();

        if fs::metadata(self.layout.image_file(inactive)).await.is_err() {
            return Err(FleetError::StorageError(format!(
                "no scratch image in slot {} to stage",
                inactive
            )));
        }

        let meta = SlotMeta {
            version: version.to_string(),
            digest: digest.to_string(),
        };
        write_json_atomic(&self.layout.meta_file(inactive), &meta).await?;

        self.state.staged = Some(StagedImage {
            slot: inactive,
            version: version.to_string(),
            session_id: session_id.to_string(),
        });
        self.state.boot_attempts = 0;
        self.persist().await?;

        info!(slot = %inactive, version, "image staged");
        Ok(())
    }

    /// Count one unconfirmed boot into the staged slot
    pub async fn record_boot_attempt(&mut self) -> Result<u32, FleetError> {
        self.state.boot_attempts += 1;
        self.persist().await?;
        Ok(self.state.boot_attempts)
    }

    /// Commit the staged image: flip slot roles and persist the confirmed
    /// version. Only called after a passing healthcheck.
    pub async fn commit(&mut self) -> Result<String, FleetError> {
        let staged = self
            .state
            .staged
            .take()
            .ok_or_else(|| FleetError::StorageError("commit without a staged image".to_string()))?;

        self.state.active = staged.slot;
        self.state.confirmed_version = Some(staged.version.clone());
        self.state.boot_attempts = 0;
        self.persist().await?;

        info!(slot = %staged.slot, version = %staged.version, "update committed");
        Ok(staged.version)
    }

    /// Revert the boot selector to the previous slot after a failed
    /// healthcheck. Verifies the previous slot's image still matches its
    /// recorded digest; if it does not, both slots are unusable — the fault
    /// latch is set and the store refuses further automatic updates.
    ///
    /// Returns the version reverted to.
    pub async fn rollback(&mut self) -> Result<String, FleetError> {
        let staged = self
            .state
            .staged
            .take()
            .ok_or_else(|| FleetError::StorageError("rollback without a staged image".to_string()))?;

        let previous = self.state.active;
        match self.verify_slot(previous).await {
            Ok(meta) => {
                self.state.boot_attempts = 0;
                self.persist().await?;
                warn!(
                    from_version = %staged.version,
                    to_version = %meta.version,
                    slot = %previous,
                    "rollback executed"
                );
                Ok(meta.version)
            }
            Err(reason) => {
                self.state.faulted = true;
                self.persist().await?;
                error!(slot = %previous, %reason, "rollback target unusable, manual recovery required");
                Err(FleetError::RollbackFailed(format!(
                    "slot {} unusable: {}",
                    previous, reason
                )))
            }
        }
    }

    /// Manual recovery after a dual-slot failure
    pub async fn clear_fault(&mut self) -> Result<(), FleetError> {
        self.state.faulted = false;
        self.state.boot_attempts = 0;
        self.persist().await?;
        Ok(())
    }

    /// Full contents of the active slot's image
    pub async fn read_active_image(&self) -> Result<Vec<u8>, FleetError> {
        Ok(fs::read(self.layout.image_file(self.state.active)).await?)
    }

    async fn verify_slot(&self, slot: SlotId) -> Result<SlotMeta, String> {
        let meta_path = self.layout.meta_file(slot);
        let raw = fs::read_to_string(&meta_path)
            .await
            .map_err(|e| format!("meta unreadable: {e}"))?;
        let meta: SlotMeta =
            serde_json::from_str(&raw).map_err(|e| format!("meta corrupt: {e}"))?;

        let actual = sha256_file(&self.layout.image_file(slot))
            .await
            .map_err(|e| format!("image unreadable: {e}"))?;

        if !actual.eq_ignore_ascii_case(&meta.digest) {
            return Err(format!(
                "image digest mismatch: recorded {}, computed {}",
                meta.digest, actual
            ));
        }
        Ok(meta)
    }

    async fn persist(&self) -> Result<(), FleetError> {
        write_json_atomic(&self.layout.state_file(), &self.state).await
    }
}

/// Atomic write using a temporary file and rename
async fn write_json_atomic<T: Serialize>(path: &PathBuf, value: &T) -> Result<(), FleetError> {
    let temp_path = path.with_extension("tmp");
    let contents = serde_json::to_string_pretty(value)?;
    fs::write(&temp_path, contents).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}
