//! Core functionality for the AutoNav bridge
//! This module contains the core functionality for driving the car over BLE.

pub mod bluetooth;
pub mod error;
pub mod events;
pub mod gesture;
pub mod session;

// Re-export commonly used types
pub use bluetooth::{CarCommand, CommandDispatcher, ConnectionManager, PeripheralScanner};
pub use error::BridgeError;
pub use events::{BridgeEvent, EventBus};
pub use session::{OperationMode, SessionCoordinator, SessionState};
