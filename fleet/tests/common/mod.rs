//! Shared harness: an in-process fleet with real coordinator, router, and
//! device agents backed by temp-dir slot stores.
#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use gridlink::agent::fetch::{ImageFetcher, MemoryImageFetcher};
use gridlink::agent::healthcheck::{FlagProbe, HealthcheckOptions};
use gridlink::agent::safety::StateHandle;
use gridlink::agent::slots::{SlotLayout, SlotStore};
use gridlink::agent::updater::{AgentOptions, UpdateAgent};
use gridlink::coordinator::Coordinator;
use gridlink::models::image::{Checksum, UpdateImage};
use gridlink::models::session::{SessionState, SessionWindows, UpdateSession};
use gridlink::router::MessageRouter;
use gridlink::signing::UpdateVerifier;
use gridlink::workers::status;

pub fn short_windows() -> SessionWindows {
    SessionWindows {
        download: Duration::from_secs(5),
        install: Duration::from_secs(5),
        healthcheck: Duration::from_secs(5),
    }
}

pub fn fast_healthcheck() -> HealthcheckOptions {
    HealthcheckOptions {
        attempt_timeout: Duration::from_millis(200),
        retry_delay: Duration::from_millis(10),
        max_boot_attempts: 2,
    }
}

/// Coordinator with its status worker running
pub async fn spawn_coordinator(router: &MessageRouter) -> Arc<Coordinator> {
    let coordinator = Arc::new(Coordinator::with_defaults(router.clone(), short_windows()));
    let worker = coordinator.clone();
    let worker_router = router.clone();
    tokio::spawn(async move {
        status::run(worker, worker_router, Box::pin(std::future::pending::<()>())).await;
    });
    // Let the freshly spawned status worker finish subscribing to the fleet
    // taps before any caller publishes, so early events are not missed.
    settle().await;
    coordinator
}

pub struct TestDevice {
    pub device_id: String,
    pub layout: SlotLayout,
    pub state: StateHandle,
    pub fetcher: Arc<MemoryImageFetcher>,
    pub health: Arc<AtomicBool>,
    pub handle: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl TestDevice {
    /// Reopen the on-disk slot store (safe once the agent is idle)
    pub async fn reopen_store(&self) -> SlotStore {
        SlotStore::open(self.layout.clone()).await.unwrap()
    }
}

pub struct DeviceConfig {
    pub initial_version: String,
    pub allow_unsigned: bool,
    pub verifier: Option<UpdateVerifier>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            initial_version: "1.0.0".to_string(),
            allow_unsigned: true,
            verifier: None,
        }
    }
}

/// Provision a device on disk and run its agent against the router
pub async fn spawn_device(router: &MessageRouter, device_id: &str, config: DeviceConfig) -> TestDevice {
    let dir = tempfile::tempdir().unwrap();
    let layout = SlotLayout::new(dir.path());
    let initial_image = format!("image-v{}", config.initial_version);
    let slots = SlotStore::provision(layout.clone(), &config.initial_version, initial_image.as_bytes())
        .await
        .unwrap();

    let fetcher = Arc::new(MemoryImageFetcher::new());
    let state = StateHandle::default();
    let probe = FlagProbe::new("selftest", true);
    let health = probe.handle();

    let mut options = AgentOptions::new(device_id);
    options.healthcheck = fast_healthcheck();
    options.allow_unsigned = config.allow_unsigned;

    let dyn_fetcher: Arc<dyn ImageFetcher> = fetcher.clone();
    let mut agent = UpdateAgent::new(options, slots, dyn_fetcher, router.clone(), state.clone())
        .with_probe(Arc::new(probe));
    if let Some(verifier) = config.verifier {
        agent = agent.with_verifier(verifier);
    }

    let handle = tokio::spawn(async move {
        agent.run(Box::pin(std::future::pending::<()>())).await;
    });

    TestDevice {
        device_id: device_id.to_string(),
        layout,
        state,
        fetcher,
        health,
        handle,
        _dir: dir,
    }
}

/// Register image bytes with a device's fetcher and build the matching
/// (correct-checksum) update image
pub fn publish_image(device: &TestDevice, version: &str, bytes: &[u8]) -> UpdateImage {
    let url = format!("https://images.gridlink.energy/fw-{version}.img");
    device.fetcher.insert(url.clone(), bytes.to_vec());
    UpdateImage {
        version: version.to_string(),
        source_url: url,
        checksum: Checksum::sha256_of(bytes),
        size_bytes: Some(bytes.len() as u64),
        signature: None,
    }
}

/// Let freshly spawned agents finish subscribing
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Poll until the session reaches a terminal state
pub async fn wait_terminal(coordinator: &Coordinator, session_id: &str) -> UpdateSession {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(session) = coordinator.session(session_id).await {
            if session.state.is_terminal() {
                return session;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {session_id} did not reach a terminal state"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the session reaches the given state
pub async fn wait_state(coordinator: &Coordinator, session_id: &str, state: SessionState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(session) = coordinator.session(session_id).await {
            if session.state == state {
                return;
            }
            assert!(
                !session.state.is_terminal(),
                "session {session_id} terminated in {:?} while waiting for {state:?}",
                session.state
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {session_id} never reached {state:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
