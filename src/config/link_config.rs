//! GATT link configuration
//! The car exposes one service with one command characteristic; both
//! identifiers come from the environment at process start. Missing or
//! malformed identifiers are a startup configuration error, never a runtime
//! BLE error.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::BridgeError;

pub const SERVICE_UUID_VAR: &str = "SERVICE_UUID";
pub const CHARACTERISTIC_UUID_VAR: &str = "CHARACTERISTIC_UUID";

/// Identifies the command channel on the car.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// The GATT service the command characteristic lives under.
    pub service_uuid: Uuid,
    /// The single characteristic every command is written to.
    pub characteristic_uuid: Uuid,
}

impl LinkConfig {
    pub fn new(service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            characteristic_uuid,
        }
    }

    /// Reads both identifiers from the environment.
    pub fn from_env() -> Result<Self, BridgeError> {
        Ok(Self {
            service_uuid: parse_uuid_var(SERVICE_UUID_VAR)?,
            characteristic_uuid: parse_uuid_var(CHARACTERISTIC_UUID_VAR)?,
        })
    }
}

fn parse_uuid_var(name: &str) -> Result<Uuid, BridgeError> {
    let raw = std::env::var(name)
        .map_err(|_| BridgeError::Config(format!("{} is not set", name)))?;
    parse_uuid(name, &raw)
}

fn parse_uuid(name: &str, raw: &str) -> Result<Uuid, BridgeError> {
    Uuid::parse_str(raw.trim())
        .map_err(|e| BridgeError::Config(format!("{} is not a valid UUID ({}): {}", name, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_uuid() {
        let uuid = parse_uuid("SERVICE_UUID", "0000ffe0-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(uuid, Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb));
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert!(parse_uuid("SERVICE_UUID", " 0000ffe0-0000-1000-8000-00805f9b34fb\n").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_uuid("CHARACTERISTIC_UUID", "not-a-uuid").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
