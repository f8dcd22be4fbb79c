//! AutoNav bridge library
//! This is the main library for driving the AutoNav car over BLE: scanning,
//! connection management, command dispatch, and session coordination.

// Module declarations
pub mod config;
pub mod core;
pub mod state;

pub use crate::config::LinkConfig;
pub use crate::core::{BridgeError, BridgeEvent, EventBus};
pub use crate::state::BridgeState;

// Initialize logging
pub fn setup_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Logging initialized");
}
