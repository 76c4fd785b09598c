//! Status consumer worker.
//!
//! The coordinator's single writer path: drains the fleet-wide status and
//! telemetry taps and folds each event into tracker and registry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::info;

use crate::coordinator::Coordinator;
use crate::router::{MessageRouter, TopicKind};

/// Run the status consumer
pub async fn run(
    coordinator: Arc<Coordinator>,
    router: MessageRouter,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Status worker starting...");

    let mut status_rx = router.subscribe_fleet(TopicKind::Status).await;
    let mut telemetry_rx = router.subscribe_fleet(TopicKind::Telemetry).await;

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Status worker shutting down...");
                return;
            }
            event = status_rx.recv() => {
                match event {
                    Some(envelope) => coordinator.handle_status(envelope).await,
                    None => return,
                }
            }
            event = telemetry_rx.recv() => {
                match event {
                    Some(envelope) => coordinator.handle_telemetry(envelope).await,
                    None => return,
                }
            }
        }
    }
}
