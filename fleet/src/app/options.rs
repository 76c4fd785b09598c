//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::agent::healthcheck::HealthcheckOptions;
use crate::agent::safety::{MaintenanceWindow, SafetyPolicy};
use crate::coordinator::CoordinatorOptions;
use crate::models::session::SessionWindows;
use crate::workers::{heartbeat, mqtt, sweeper};

/// Lifecycle options shared by both roles
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Operator HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Options for the cloud-side fleet coordinator
#[derive(Debug, Clone, Default)]
pub struct FleetOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Operator HTTP server
    pub server: ServerOptions,

    /// Enable the operator HTTP server
    pub enable_server: bool,

    /// MQTT bridge to the broker
    pub mqtt: mqtt::Options,

    /// Enable the MQTT bridge (disabled for in-process embedding)
    pub enable_mqtt_bridge: bool,

    /// Per-phase session windows
    pub windows: SessionWindows,

    /// Coordinator validation options
    pub coordinator: CoordinatorOptions,

    /// Timeout sweeper options
    pub sweeper: sweeper::Options,
}

impl FleetOptions {
    pub fn new() -> Self {
        Self {
            enable_server: true,
            enable_mqtt_bridge: true,
            ..Default::default()
        }
    }
}

/// Options for the device-side gateway agent
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// This device's identity
    pub device_id: String,

    /// Base directory of the dual-slot store
    pub data_dir: PathBuf,

    /// MQTT bridge to the broker
    pub mqtt: mqtt::Options,

    /// Heartbeat publishing
    pub heartbeat: heartbeat::Options,

    /// Operational thresholds gating update starts
    pub safety: SafetyPolicy,

    /// Post-boot self-test budget
    pub healthcheck: HealthcheckOptions,

    /// Optional local-hour update window
    pub maintenance_window: Option<MaintenanceWindow>,

    /// Accept images without a signature (development only)
    pub allow_unsigned: bool,

    /// Hex-encoded Ed25519 verifying key for image signatures
    pub verify_key_hex: Option<String>,

    /// Hosts an image URL may point at
    pub allowed_image_hosts: Option<Vec<String>>,
}

impl GatewayOptions {
    pub fn new(device_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            device_id: device_id.into(),
            data_dir: data_dir.into(),
            mqtt: mqtt::Options::default(),
            heartbeat: heartbeat::Options::default(),
            safety: SafetyPolicy::default(),
            healthcheck: HealthcheckOptions::default(),
            maintenance_window: None,
            allow_unsigned: true,
            verify_key_hex: None,
            allowed_image_hosts: None,
        }
    }
}
