//! GridLink Fleet Library
//!
//! Fleet update coordination and per-device command isolation for
//! battery-storage edge gateways: a cloud-side coordinator that tracks one
//! update session per device, a device-side agent that stages verified
//! images into the inactive slot and self-validates before committing, and
//! an address-scoped router that keeps every device's traffic its own.

pub mod agent;
pub mod app;
pub mod coordinator;
pub mod errors;
pub mod fanout;
pub mod logs;
pub mod models;
pub mod mqtt;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod signing;
pub mod telemetry;
pub mod utils;
pub mod workers;
