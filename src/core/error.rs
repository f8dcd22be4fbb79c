//! Error taxonomy for the bridge core
//! Transport-level failures are wrapped with a human-readable reason at the
//! lowest layer that can decide what to do with them; no raw bluest error
//! reaches the session coordinator or the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The radio capability is unavailable (adapter missing or powered off).
    #[error("bluetooth permission denied: {0}")]
    PermissionDenied(String),

    /// Transport-level scan failure. Scanning stops; a fresh scan can be
    /// started manually.
    #[error("scan failed: {0}")]
    Scan(String),

    /// Connect or service/characteristic discovery failure. The connection
    /// state is back at `Disconnected` when this is returned.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A single characteristic write was rejected. Transient; the connection
    /// stays up and any active repeat loop keeps running.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Dispatch was attempted with no active connection.
    #[error("no active connection")]
    NotConnected,

    /// Missing or unparsable startup configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
