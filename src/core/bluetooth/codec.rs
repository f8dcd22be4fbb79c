//! Car command codec
//! This module is the single place that knows the wire tokens the car
//! firmware dispatches on. The firmware does a plain character switch, so
//! tokens are deliberately minimal; everything above the dispatcher talks in
//! `CarCommand` values and never hardcodes a token.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::MAX_SPEED_LEVEL;

/// Directional intent while driving manually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// Firmware drive mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveMode {
    /// Direct manual control.
    Manual,
    /// Autonomous waypoint traversal.
    Auto,
}

/// A validated speed level, 0..=10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedLevel(u8);

impl SpeedLevel {
    /// Clamps the raw level into the range the firmware accepts.
    pub fn new(level: u8) -> Self {
        Self(level.min(MAX_SPEED_LEVEL))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// One waypoint on the planned route.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub lat: f64,
    pub lng: f64,
}

impl Waypoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Commands the bridge can put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum CarCommand {
    /// Held or stepped movement: forward, backward, left, right.
    Direction(Direction),
    /// Edge-triggered turn; the firmware latches it, so it is never repeated.
    Turn(Direction),
    /// Speed level written as decimal ASCII.
    Speed(SpeedLevel),
    /// Mode select so firmware state agrees with session state.
    Mode(DriveMode),
    Stop,
    /// Drop the route accumulated on the car.
    ClearWaypoints,
    /// The full route, committed as one list.
    Waypoints(Vec<Waypoint>),
    // LED tokens are reserved by the firmware but not wired to any intent.
    LedOn,
    LedOff,
}

impl CarCommand {
    /// The ASCII token for this command. Total: every command maps to
    /// exactly one token, always the same one.
    pub fn token(&self) -> String {
        match self {
            Self::Direction(Direction::Up) => "F".to_string(),
            Self::Direction(Direction::Down) => "B".to_string(),
            Self::Direction(Direction::Left) | Self::Turn(Direction::Left) => "L".to_string(),
            Self::Direction(Direction::Right) | Self::Turn(Direction::Right) => "R".to_string(),
            // A turn token is the same letter whichever path dispatches it.
            Self::Turn(Direction::Up) => "F".to_string(),
            Self::Turn(Direction::Down) => "B".to_string(),
            Self::Speed(level) => level.get().to_string(),
            Self::Mode(DriveMode::Manual) => "M".to_string(),
            Self::Mode(DriveMode::Auto) => "A".to_string(),
            Self::Stop => "S".to_string(),
            Self::ClearWaypoints => "C".to_string(),
            Self::Waypoints(points) => encode_waypoints(points),
            Self::LedOn => "P".to_string(),
            Self::LedOff => "L".to_string(),
        }
    }

    /// The bytes actually written to the characteristic: the base64 of the
    /// ASCII token, as the firmware's serial shim expects.
    pub fn payload(&self) -> Vec<u8> {
        BASE64.encode(self.token()).into_bytes()
    }
}

/// Formats the accumulated route as the `(lat,lng),(lat,lng),...` literal
/// the firmware parses, in insertion order.
fn encode_waypoints(points: &[Waypoint]) -> String {
    points
        .iter()
        .map(|p| format!("({},{})", p.lat, p.lng))
        .collect::<Vec<_>>()
        .join(",")
}
