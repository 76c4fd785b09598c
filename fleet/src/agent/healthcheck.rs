//! Post-boot self-test.
//!
//! After booting into a staged slot the agent runs its probes under a
//! watchdog: every probe must answer within `attempt_timeout`, so a hung
//! self-test can never prevent rollback.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// One local subsystem check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    /// `true` when the subsystem is operational
    async fn check(&self) -> bool;
}

/// Healthcheck budget. All values are deployment-specific configuration.
#[derive(Debug, Clone)]
pub struct HealthcheckOptions {
    /// Watchdog per probe attempt
    pub attempt_timeout: Duration,

    /// Delay between failed attempts
    pub retry_delay: Duration,

    /// Unconfirmed-boot budget before rollback
    pub max_boot_attempts: u32,
}

impl Default for HealthcheckOptions {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(15),
            max_boot_attempts: 3,
        }
    }
}

/// Runs the configured probes as one attempt
pub struct Healthcheck {
    probes: Vec<Arc<dyn HealthProbe>>,
    options: HealthcheckOptions,
}

impl Healthcheck {
    pub fn new(probes: Vec<Arc<dyn HealthProbe>>, options: HealthcheckOptions) -> Self {
        Self { probes, options }
    }

    pub fn options(&self) -> &HealthcheckOptions {
        &self.options
    }

    /// Run every probe once, each under the watchdog.
    ///
    /// Returns `Err(probe name)` on the first failure or timeout.
    pub async fn attempt(&self) -> Result<(), String> {
        for probe in &self.probes {
            match tokio::time::timeout(self.options.attempt_timeout, probe.check()).await {
                Ok(true) => {
                    debug!(probe = probe.name(), "probe ok");
                }
                Ok(false) => {
                    warn!(probe = probe.name(), "probe failed");
                    return Err(probe.name().to_string());
                }
                Err(_) => {
                    warn!(probe = probe.name(), "probe watchdog expired");
                    return Err(format!("{} (watchdog)", probe.name()));
                }
            }
        }
        Ok(())
    }
}

/// Probe backed by an externally settable flag. The control loop, Modbus
/// poller, and broker link each flip one of these as their liveness signal.
pub struct FlagProbe {
    name: String,
    healthy: Arc<AtomicBool>,
}

impl FlagProbe {
    pub fn new(name: impl Into<String>, initially_healthy: bool) -> Self {
        Self {
            name: name.into(),
            healthy: Arc::new(AtomicBool::new(initially_healthy)),
        }
    }

    /// Handle for the subsystem that owns this signal
    pub fn handle(&self) -> Arc<AtomicBool> {
        self.healthy.clone()
    }
}

#[async_trait]
impl HealthProbe for FlagProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Probe that requires a file to exist and be non-empty (e.g. the booted
/// slot's image, or a pid file the control loop maintains)
pub struct FileProbe {
    name: String,
    path: PathBuf,
}

impl FileProbe {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for FileProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len() > 0,
            Err(_) => false,
        }
    }
}
