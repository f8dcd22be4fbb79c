//! Command dispatch onto the car's single command characteristic
//! One-shot writes, the repeating keep-alive loop for held directional
//! input, and the two-write waypoint commit all funnel through one write
//! gate so payloads never interleave on the wire.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::codec::{CarCommand, Direction, DriveMode, Waypoint};
use crate::core::bluetooth::connection::LinkSlot;
use crate::core::bluetooth::constants::{CONTINUOUS_REPEAT_PERIOD, SHORT_PRESS_BURST};
use crate::core::error::BridgeError;
use crate::core::events::{BridgeEvent, EventBus};

struct ContinuousLoop {
    id: u64,
    token: CancellationToken,
}

/// Serializes every write to the car and owns the at-most-one continuous
/// repeat loop.
pub struct CommandDispatcher {
    link_slot: LinkSlot,
    /// Single-outstanding-write discipline. Also held across the two writes
    /// of a waypoint commit.
    write_gate: Arc<Mutex<()>>,
    active_loop: Arc<Mutex<Option<ContinuousLoop>>>,
    next_loop_id: AtomicU64,
    events: EventBus,
}

impl CommandDispatcher {
    pub fn new(link_slot: LinkSlot, events: EventBus) -> Self {
        Self {
            link_slot,
            write_gate: Arc::new(Mutex::new(())),
            active_loop: Arc::new(Mutex::new(None)),
            next_loop_id: AtomicU64::new(1),
            events,
        }
    }

    /// Writes the command exactly once.
    pub async fn send_once(&self, command: &CarCommand) -> Result<(), BridgeError> {
        let _gate = self.write_gate.lock().await;
        write_payload(&self.link_slot, &self.events, &command.payload(), true).await
    }

    /// Turns are edge-triggered on the firmware side, so they go through a
    /// dedicated one-shot path and are never repeated.
    pub async fn send_turn(&self, direction: Direction) -> Result<(), BridgeError> {
        let _gate = self.write_gate.lock().await;
        write_payload(
            &self.link_slot,
            &self.events,
            &CarCommand::Turn(direction).payload(),
            true,
        )
        .await
    }

    /// Starts re-sending the command on a fixed period until cancelled.
    /// Any previously running loop is cancelled first; at most one loop is
    /// ever active.
    pub async fn send_continuous(&self, command: CarCommand) {
        self.start_loop(command).await;
    }

    /// A short-press forward/backward step: the command is asserted
    /// continuously for the burst window, then the dispatcher writes a stop
    /// on its own. Superseding the burst (new loop, cancel, emergency stop)
    /// skips the trailing stop.
    pub async fn send_burst(&self, command: CarCommand) {
        let (id, token) = self.start_loop(command).await;
        let active_loop = self.active_loop.clone();
        let link_slot = self.link_slot.clone();
        let write_gate = self.write_gate.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(SHORT_PRESS_BURST) => {
                    if cancel_if_current(&active_loop, id).await {
                        let _gate = write_gate.lock().await;
                        let _ = write_payload(
                            &link_slot,
                            &events,
                            &CarCommand::Stop.payload(),
                            true,
                        )
                        .await;
                    }
                }
            }
        });
    }

    /// Cancels the active continuous loop, if any. Cancellation is
    /// cooperative: an in-flight write finishes, future ticks do not run.
    pub async fn cancel_continuous(&self) -> bool {
        let mut active = self.active_loop.lock().await;
        match active.take() {
            Some(running) => {
                running.token.cancel();
                debug!("Cancelled continuous loop {}", running.id);
                true
            }
            None => false,
        }
    }

    /// Commits the whole route: the waypoint-list write followed by the
    /// auto-mode token, with the gate held so no unrelated write lands
    /// between them.
    pub async fn send_waypoints(&self, points: &[Waypoint]) -> Result<(), BridgeError> {
        let _gate = self.write_gate.lock().await;
        write_payload(
            &self.link_slot,
            &self.events,
            &CarCommand::Waypoints(points.to_vec()).payload(),
            true,
        )
        .await?;
        write_payload(
            &self.link_slot,
            &self.events,
            &CarCommand::Mode(DriveMode::Auto).payload(),
            true,
        )
        .await
    }

    async fn start_loop(&self, command: CarCommand) -> (u64, CancellationToken) {
        // Cancel any prior loop before the new one gets its first tick.
        let mut active = self.active_loop.lock().await;
        if let Some(previous) = active.take() {
            previous.token.cancel();
            debug!("Superseding continuous loop {}", previous.id);
        }

        let id = self.next_loop_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let task_token = token.clone();
        let link_slot = self.link_slot.clone();
        let write_gate = self.write_gate.clone();
        let events = self.events.clone();
        let payload = command.payload();

        tokio::spawn(async move {
            let mut ticker = interval(CONTINUOUS_REPEAT_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let _gate = write_gate.lock().await;
                        // A tick selected just before cancellation can reach
                        // this point after the cancelling stop took the gate;
                        // its stale token must not land after that stop.
                        if task_token.is_cancelled() {
                            break;
                        }
                        // Held input goes without response; one lost packet
                        // is repaired by the next tick.
                        if let Err(e) =
                            write_payload(&link_slot, &events, &payload, false).await
                        {
                            warn!("Continuous write failed, keeping loop alive: {}", e);
                        }
                    }
                }
            }
            debug!("Continuous loop {} exited", id);
        });

        *active = Some(ContinuousLoop {
            id,
            token: token.clone(),
        });
        (id, token)
    }
}

/// Cancels the active loop only if it is still the one identified by `id`.
async fn cancel_if_current(active_loop: &Mutex<Option<ContinuousLoop>>, id: u64) -> bool {
    let mut active = active_loop.lock().await;
    match active.as_ref() {
        Some(running) if running.id == id => {
            let running = active.take().expect("checked above");
            running.token.cancel();
            true
        }
        _ => false,
    }
}

/// Performs one characteristic write against the current link. Holding the
/// slot's read guard across the await means a disconnect teardown waits for
/// this write's result handling.
async fn write_payload(
    link_slot: &LinkSlot,
    events: &EventBus,
    payload: &[u8],
    with_response: bool,
) -> Result<(), BridgeError> {
    let slot = link_slot.read().await;
    let Some(link) = slot.as_ref() else {
        events.emit(BridgeEvent::CommandFailed {
            reason: BridgeError::NotConnected.to_string(),
        });
        return Err(BridgeError::NotConnected);
    };
    match link.write(payload, with_response).await {
        Ok(()) => Ok(()),
        Err(e) => {
            events.emit(BridgeEvent::CommandFailed {
                reason: e.to_string(),
            });
            Err(e)
        }
    }
}
