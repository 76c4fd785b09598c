//! Update session tracking

pub mod tracker;

pub use tracker::SessionTracker;
