//! GridLink Fleet - Entry Point
//!
//! One binary, two roles: `fleet` runs the cloud-side coordinator with the
//! operator API, `gateway` runs the device-side update agent. The role and
//! everything else comes from a JSON settings file.

use std::collections::HashMap;
use std::env;

use serde::Deserialize;
use tracing::{error, info};

use gridlink::app::options::{FleetOptions, GatewayOptions, ServerOptions};
use gridlink::app::run::{run_fleet, run_gateway};
use gridlink::logs::{init_logging, LogLevel, LogOptions};
use gridlink::models::session::SessionWindows;
use gridlink::mqtt::client::MqttAddress;
use gridlink::utils::version_info;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Settings {
    /// "fleet" or "gateway"
    mode: String,
    log_level: LogLevel,
    json_logs: bool,

    server_host: String,
    server_port: u16,

    mqtt_host: String,
    mqtt_port: u16,
    mqtt_tls: bool,
    mqtt_ca_cert_path: Option<String>,

    // Fleet role
    download_window_secs: u64,
    install_window_secs: u64,
    healthcheck_window_secs: u64,
    allowed_image_hosts: Option<Vec<String>>,

    // Gateway role
    device_id: String,
    data_dir: String,
    allow_unsigned: bool,
    verify_key_hex: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let windows = SessionWindows::default();
        Self {
            mode: "fleet".to_string(),
            log_level: LogLevel::Info,
            json_logs: false,
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            mqtt_host: "".to_string(),
            mqtt_port: 8883,
            mqtt_tls: true,
            mqtt_ca_cert_path: None,
            download_window_secs: windows.download.as_secs(),
            install_window_secs: windows.install.as_secs(),
            healthcheck_window_secs: windows.healthcheck.as_secs(),
            allowed_image_hosts: None,
            device_id: "".to_string(),
            data_dir: "/var/lib/gridlink".to_string(),
            allow_unsigned: false,
            verify_key_hex: None,
        }
    }
}

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(rendered) => println!("{}", rendered),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    // Load settings
    let settings = match cli_args.get("config") {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Settings>(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    eprintln!("Unable to parse settings file {path}: {e}");
                    return;
                }
            },
            Err(e) => {
                eprintln!("Unable to read settings file {path}: {e}");
                return;
            }
        },
        None => Settings::default(),
    };

    // CLI mode override
    let mode = cli_args
        .get("mode")
        .cloned()
        .unwrap_or_else(|| settings.mode.clone());

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.json_logs,
    };
    if let Err(e) = init_logging(log_options) {
        println!("Failed to initialize logging: {e}");
    }

    let mqtt = gridlink::workers::mqtt::Options {
        broker_address: MqttAddress {
            host: settings.mqtt_host.clone(),
            port: settings.mqtt_port,
            use_tls: settings.mqtt_tls,
            ca_cert_path: settings.mqtt_ca_cert_path.clone(),
        },
        ..Default::default()
    };

    let result = match mode.as_str() {
        "fleet" => {
            let options = FleetOptions {
                server: ServerOptions {
                    host: settings.server_host.clone(),
                    port: settings.server_port,
                },
                enable_server: true,
                enable_mqtt_bridge: !settings.mqtt_host.is_empty(),
                mqtt,
                windows: SessionWindows {
                    download: std::time::Duration::from_secs(settings.download_window_secs),
                    install: std::time::Duration::from_secs(settings.install_window_secs),
                    healthcheck: std::time::Duration::from_secs(settings.healthcheck_window_secs),
                },
                coordinator: gridlink::coordinator::CoordinatorOptions {
                    allowed_image_hosts: settings.allowed_image_hosts.clone(),
                },
                ..Default::default()
            };
            info!("Running GridLink fleet coordinator");
            run_fleet(options, await_shutdown_signal()).await
        }
        "gateway" => {
            if settings.device_id.is_empty() {
                error!("Gateway mode requires device_id in the settings file");
                return;
            }
            let mut options = GatewayOptions::new(&settings.device_id, &settings.data_dir);
            options.mqtt = mqtt;
            options.allow_unsigned = settings.allow_unsigned;
            options.verify_key_hex = settings.verify_key_hex.clone();
            options.allowed_image_hosts = settings.allowed_image_hosts.clone();
            info!("Running GridLink gateway agent");
            run_gateway(options, await_shutdown_signal()).await
        }
        other => {
            error!("Unknown mode '{}', expected 'fleet' or 'gateway'", other);
            return;
        }
    };

    if let Err(e) = result {
        error!("Failed to run: {e}");
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("Failed to listen for Ctrl+C");
        }
        info!("Ctrl+C received, shutting down...");
    }
}
