//! Edge update agent

pub mod fetch;
pub mod fsm;
pub mod healthcheck;
pub mod safety;
pub mod slots;
pub mod updater;
