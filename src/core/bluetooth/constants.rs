//! Constants used throughout the bridge
//! This module contains the timing policy and default values for scanning,
//! connection handling, and command dispatch.

use std::time::Duration;

/// How long a discovered peripheral stays in the result set without being
/// re-sighted before it is evicted.
pub const STALENESS_WINDOW: Duration = Duration::from_secs(10);

/// Period of the background sweep that evicts stale discovery records.
pub const STALENESS_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Platform scan sessions can silently stall; the underlying scan primitive
/// is restarted at this period without clearing already-discovered records.
pub const SCAN_RESTART_PERIOD: Duration = Duration::from_secs(5);

/// Default duration of a bounded scan session (device picker).
pub const DEFAULT_BOUNDED_SCAN: Duration = Duration::from_secs(10);

/// Maximum number of connection attempts per connect() call.
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// Delay between connection retries.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Budget for a whole connect() call, retries included. A connect that has
/// not produced a usable characteristic by then reports a failure instead of
/// hanging.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll period of the link supervisor that detects silent link loss.
pub const LINK_SUPERVISOR_PERIOD: Duration = Duration::from_secs(1);

/// Re-send period of a continuous directional command while a control is
/// held. The link is lossy; re-asserting at this rate keeps the car's
/// actuator state in sync even when individual writes are dropped.
pub const CONTINUOUS_REPEAT_PERIOD: Duration = Duration::from_millis(100);

/// How long a short-press forward/backward burst keeps asserting the
/// direction before the dispatcher writes a stop on its own.
pub const SHORT_PRESS_BURST: Duration = Duration::from_millis(600);

/// Press duration at and beyond which a directional press counts as a long
/// press (continuous assert until release).
pub const LONG_PRESS_THRESHOLD: Duration = Duration::from_millis(600);

/// Trailing-edge debounce for speed slider changes; only the latest level
/// observed within this window is written to the wire.
pub const SPEED_DEBOUNCE: Duration = Duration::from_millis(100);

/// Highest speed level accepted by the firmware.
pub const MAX_SPEED_LEVEL: u8 = 10;
