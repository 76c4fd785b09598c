//! Main application run loops for both roles

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::agent::fetch::HttpImageFetcher;
use crate::agent::healthcheck::FileProbe;
use crate::agent::safety::StateHandle;
use crate::agent::slots::{SlotLayout, SlotStore};
use crate::agent::updater::{AgentOptions, UpdateAgent};
use crate::app::options::{FleetOptions, GatewayOptions};
use crate::coordinator::{Coordinator, CoordinatorOptions};
use crate::errors::FleetError;
use crate::registry::DeviceRegistry;
use crate::router::MessageRouter;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::session::SessionTracker;
use crate::signing::UpdateVerifier;
use crate::workers::{heartbeat, mqtt, status, sweeper};

/// Run the cloud-side fleet coordinator
pub async fn run_fleet(
    options: FleetOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), FleetError> {
    info!("Initializing GridLink fleet coordinator...");

    let router = MessageRouter::new();
    let coordinator = Arc::new(Coordinator::new(
        Arc::new(DeviceRegistry::new()),
        Arc::new(SessionTracker::new(options.windows.clone())),
        router.clone(),
        CoordinatorOptions {
            allowed_image_hosts: options.coordinator.allowed_image_hosts.clone(),
        },
    ));

    let mut workers = WorkerSet::new();

    {
        let coordinator = coordinator.clone();
        let router = router.clone();
        let signal = workers.shutdown_future();
        workers.register(
            "status",
            tokio::spawn(async move {
                status::run(coordinator, router, signal).await;
            }),
        );
    }

    {
        let coordinator = coordinator.clone();
        let sweeper_options = options.sweeper.clone();
        let signal = workers.shutdown_future();
        workers.register(
            "sweeper",
            tokio::spawn(async move {
                sweeper::run(&sweeper_options, coordinator, tokio::time::sleep, signal).await;
            }),
        );
    }

    if options.enable_mqtt_bridge {
        let mqtt_options = options.mqtt.clone();
        let router = router.clone();
        let signal = workers.shutdown_future();
        workers.register(
            "fleet-bridge",
            tokio::spawn(async move {
                mqtt::run_fleet_bridge(&mqtt_options, router, tokio::time::sleep, signal).await;
            }),
        );
    }

    if options.enable_server {
        let state = Arc::new(ServerState::new(coordinator.clone()));
        let signal = workers.shutdown_future();
        let server_handle = serve(&options.server, state, signal).await?;
        workers.register(
            "server",
            tokio::spawn(async move {
                match server_handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("HTTP server failed: {}", e),
                    Err(e) => error!("HTTP server panicked: {}", e),
                }
            }),
        );
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");
    workers.shutdown(options.lifecycle.max_shutdown_delay).await
}

/// Run the device-side gateway agent
pub async fn run_gateway(
    options: GatewayOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), FleetError> {
    info!(device_id = %options.device_id, "Initializing GridLink gateway agent...");

    let router = MessageRouter::new();
    let layout = SlotLayout::new(&options.data_dir);
    let slots = SlotStore::open(layout.clone()).await?;
    let state = StateHandle::default();
    let fetcher = Arc::new(HttpImageFetcher::new(options.allowed_image_hosts.clone()));

    let agent_options = AgentOptions {
        device_id: options.device_id.clone(),
        safety: options.safety.clone(),
        healthcheck: options.healthcheck.clone(),
        maintenance_window: options.maintenance_window,
        allow_unsigned: options.allow_unsigned,
        command_dedup_capacity: 128,
    };

    let mut agent = UpdateAgent::new(
        agent_options,
        slots,
        fetcher,
        router.clone(),
        state.clone(),
    )
    .with_probe(Arc::new(FileProbe::new("slot_store", layout.state_file())));

    if let Some(hex_key) = &options.verify_key_hex {
        agent = agent.with_verifier(UpdateVerifier::from_hex(hex_key)?);
    }

    let mut workers = WorkerSet::new();

    {
        let signal = workers.shutdown_future();
        workers.register(
            "agent",
            tokio::spawn(async move {
                agent.run(signal).await;
            }),
        );
    }

    {
        let heartbeat_options = options.heartbeat.clone();
        let device_id = options.device_id.clone();
        let state = state.clone();
        let router = router.clone();
        let signal = workers.shutdown_future();
        workers.register(
            "heartbeat",
            tokio::spawn(async move {
                heartbeat::run(
                    &heartbeat_options,
                    device_id,
                    state,
                    router,
                    tokio::time::sleep,
                    signal,
                )
                .await;
            }),
        );
    }

    {
        let mqtt_options = options.mqtt.clone();
        let device_id = options.device_id.clone();
        let router = router.clone();
        let signal = workers.shutdown_future();
        workers.register(
            "device-bridge",
            tokio::spawn(async move {
                mqtt::run_device_bridge(&mqtt_options, &device_id, router, tokio::time::sleep, signal)
                    .await;
            }),
        );
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");
    workers.shutdown(options.lifecycle.max_shutdown_delay).await
}

// ================================= SHUTDOWN ===================================== //

struct WorkerSet {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerSet {
    fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// A future that resolves when shutdown begins
    fn shutdown_future(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let mut rx = self.shutdown_tx.subscribe();
        Box::pin(async move {
            let _ = rx.recv().await;
        })
    }

    fn register(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.handles.push((name, handle));
    }

    async fn shutdown(mut self, max_delay: Duration) -> Result<(), FleetError> {
        let _ = self.shutdown_tx.send(());

        let join_all =
            futures::future::join_all(self.handles.drain(..).map(|(name, handle)| async move {
                if let Err(e) = handle.await {
                    error!(worker = name, "worker join failed: {}", e);
                }
            }));

        match tokio::time::timeout(max_delay, join_all).await {
            Ok(_) => {
                info!("Shutdown complete");
                Ok(())
            }
            Err(_) => {
                error!("Shutdown timed out after {:?}", max_delay);
                Err(FleetError::ShutdownError(format!(
                    "workers did not stop within {:?}",
                    max_delay
                )))
            }
        }
    }
}
