//! Bluetooth functionality for the car bridge
//! This module handles all bluetooth operations: scanning for the car,
//! connecting to its command characteristic, and dispatching drive commands.

pub mod codec;
pub mod connection;
pub mod constants;
pub mod dispatcher;
pub mod scanner;
pub mod types;

#[cfg(test)]
pub mod test_support;

// Re-export types that should be publicly accessible
pub use codec::{CarCommand, Direction, DriveMode, SpeedLevel, Waypoint};
pub use connection::{BluestCommandLink, CommandLink, ConnectionManager, LinkSlot};
pub use dispatcher::CommandDispatcher;
pub use scanner::PeripheralScanner;
pub use types::{ConnectionState, DiscoveredPeripheral};
