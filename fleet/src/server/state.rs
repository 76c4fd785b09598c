//! Server state

use std::sync::Arc;

use crate::coordinator::Coordinator;

/// Shared state for HTTP handlers
pub struct ServerState {
    pub coordinator: Arc<Coordinator>,
}

impl ServerState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}
