//! Session timeout sweeper.
//!
//! Recurring sweep independent of any device-specific I/O: a device that
//! fails silently mid-session is expired by deadline, not by waiting on it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::coordinator::Coordinator;

/// Sweeper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
        }
    }
}

/// Run the sweeper worker
pub async fn run<S, F>(
    options: &Options,
    coordinator: Arc<Coordinator>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Sweeper worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Sweeper worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let expired = coordinator.sweep_once(Utc::now()).await;
        if expired > 0 {
            info!(expired, "sessions timed out");
        } else {
            debug!("sweep found nothing overdue");
        }
    }
}
