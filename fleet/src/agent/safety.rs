//! Update safety gating.
//!
//! A gateway must never reboot into a new image while it is doing real work:
//! mid-discharge, islanded during a blackout, alarmed, or too low on charge
//! to survive the reboot. The control loop keeps [`OperationalState`] fresh
//! through a shared handle; the updater consults it before accepting a
//! notification.

use std::sync::Arc;

use chrono::Timelike;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// What the gateway is currently doing with its battery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Idle,
    Charge,
    Discharge,
}

/// Live operational state of the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalState {
    pub mode: OperatingMode,
    pub soc_percent: f64,
    pub power_kw: f64,
    pub island_mode: bool,
    pub critical_alarm: bool,
}

impl Default for OperationalState {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Idle,
            soc_percent: 100.0,
            power_kw: 0.0,
            island_mode: false,
            critical_alarm: false,
        }
    }
}

/// Shared handle to the operational state. The control loop writes, the
/// updater and heartbeat read.
#[derive(Clone, Default)]
pub struct StateHandle {
    inner: Arc<RwLock<OperationalState>>,
}

impl StateHandle {
    pub fn new(initial: OperationalState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn snapshot(&self) -> OperationalState {
        self.inner.read().await.clone()
    }

    pub async fn apply<F: FnOnce(&mut OperationalState)>(&self, mutate: F) {
        let mut state = self.inner.write().await;
        mutate(&mut state);
    }
}

/// Thresholds below/above which an update is refused
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    /// Minimum state of charge needed to survive a reboot
    pub min_soc_percent: f64,

    /// Absolute charge/discharge power above which the gateway counts as
    /// mid-operation
    pub max_active_power_kw: f64,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            min_soc_percent: 20.0,
            max_active_power_kw: 1.0,
        }
    }
}

impl SafetyPolicy {
    /// Return `Err(reason)` when an update must not start now
    pub fn clearance(&self, state: &OperationalState) -> Result<(), String> {
        if state.critical_alarm {
            return Err("critical alarm active".to_string());
        }
        if state.island_mode {
            return Err("island mode (blackout) active".to_string());
        }
        if state.soc_percent < self.min_soc_percent {
            return Err(format!(
                "SOC too low ({:.0}%), need >={:.0}% for reboot",
                state.soc_percent, self.min_soc_percent
            ));
        }
        if state.power_kw.abs() > self.max_active_power_kw {
            return Err(format!(
                "active charge/discharge operation ({:.1} kW)",
                state.power_kw
            ));
        }
        Ok(())
    }
}

/// Optional local-hour window in which updates are allowed. Wrap-around
/// windows (e.g. 22:00-02:00) are supported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl MaintenanceWindow {
    pub fn contains_hour(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            self.start_hour <= hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }

    pub fn contains(&self, at: chrono::DateTime<chrono::Local>) -> bool {
        self.contains_hour(at.hour())
    }

    /// Seconds until the window next opens, from the given local time
    pub fn seconds_until_open(&self, at: chrono::DateTime<chrono::Local>) -> u64 {
        if self.contains(at) {
            return 0;
        }
        let current_minutes = at.hour() * 60 + at.minute();
        let target_minutes = self.start_hour * 60;

        let mut diff = target_minutes as i64 - current_minutes as i64;
        if diff <= 0 {
            diff += 24 * 60;
        }
        diff as u64 * 60
    }
}
