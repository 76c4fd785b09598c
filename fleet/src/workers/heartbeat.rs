//! Device heartbeat worker.
//!
//! Publishes gateway telemetry on the device's own telemetry address at a
//! fixed cadence. Fire-and-forget: a missed beat costs nothing, the
//! registry's last-seen view just ages until the next one.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{info, warn};

use crate::agent::safety::StateHandle;
use crate::router::{MessageRouter, TopicKind};
use crate::telemetry::{collect_metrics, HeartbeatPayload};
use crate::utils::version_info;

/// Heartbeat worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Publish interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Run the heartbeat worker
pub async fn run<S, F>(
    options: &Options,
    device_id: String,
    state: StateHandle,
    router: MessageRouter,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!(%device_id, "Heartbeat worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!(%device_id, "Heartbeat worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let operational = state.snapshot().await;
        let payload = HeartbeatPayload {
            device_id: device_id.clone(),
            agent_version: version_info().version,
            mode: operational.mode,
            soc_percent: operational.soc_percent,
            power_kw: operational.power_kw,
            metrics: collect_metrics(),
            timestamp: chrono::Utc::now(),
        };

        let payload = match serde_json::to_value(&payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "unserializable heartbeat");
                continue;
            }
        };

        if let Err(e) = router
            .publish_to(&device_id, TopicKind::Telemetry, payload)
            .await
        {
            warn!(error = %e, "heartbeat not published");
        }
    }
}
