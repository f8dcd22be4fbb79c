//! Mode/session coordination
//! The application-level state machine above the dispatcher: it gates which
//! intents are legal in the current operation mode, owns the session state
//! (speed, run/paused, route queue), and resets everything the moment the
//! connection goes away.

use std::sync::{Arc, Mutex as StdMutex};

use log::{info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::codec::{CarCommand, Direction, DriveMode, SpeedLevel, Waypoint};
use crate::core::bluetooth::constants::SPEED_DEBOUNCE;
use crate::core::bluetooth::dispatcher::CommandDispatcher;
use crate::core::bluetooth::types::ConnectionState;
use crate::core::error::BridgeError;
use crate::core::events::{BridgeEvent, EventBus};
use crate::core::gesture::PressKind;

/// What the session is currently doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Disconnected,
    Manual,
    Waypoint,
}

/// Session state owned by the coordinator. Everything else reads snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub mode: OperationMode,
    pub is_running: bool,
    pub speed: u8,
    pub current_direction: Option<Direction>,
    pub waypoints: Vec<Waypoint>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            mode: OperationMode::Disconnected,
            is_running: false,
            speed: 0,
            current_direction: None,
            waypoints: Vec::new(),
        }
    }
}

/// Routes UI intents to the dispatcher when (and only when) they are legal
/// in the current mode.
pub struct SessionCoordinator {
    dispatcher: Arc<CommandDispatcher>,
    state: Arc<StdMutex<SessionState>>,
    /// Last speed level actually written, for duplicate suppression.
    last_sent_speed: Arc<StdMutex<Option<u8>>>,
    /// Token of the pending debounced speed write, if any.
    speed_debounce: StdMutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
    events: EventBus,
}

impl SessionCoordinator {
    /// Builds the coordinator and starts watching the connection state so a
    /// disconnect from any source resets the session.
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        connection_state: watch::Receiver<ConnectionState>,
        events: EventBus,
    ) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            dispatcher,
            state: Arc::new(StdMutex::new(SessionState::default())),
            last_sent_speed: Arc::new(StdMutex::new(None)),
            speed_debounce: StdMutex::new(None),
            shutdown: CancellationToken::new(),
            events,
        });
        coordinator.spawn_connection_watcher(connection_state);
        coordinator
    }

    pub fn session(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    /// Stops the watcher and any timed work. Used on bridge teardown.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.cancel_pending_speed();
        self.dispatcher.cancel_continuous().await;
    }

    /// Explicit user mode switch. Writes the matching mode token so the
    /// firmware agrees with the session.
    pub async fn set_mode(&self, mode: OperationMode) -> Result<(), BridgeError> {
        let drive_mode = match mode {
            OperationMode::Manual => DriveMode::Manual,
            OperationMode::Waypoint => DriveMode::Auto,
            OperationMode::Disconnected => {
                return Err(BridgeError::Connection(
                    "disconnected is not a selectable mode".into(),
                ));
            }
        };
        {
            let state = self.state.lock().unwrap();
            if state.mode == OperationMode::Disconnected {
                return Err(BridgeError::NotConnected);
            }
            if state.mode == mode {
                return Ok(());
            }
        }
        // Leaving manual must not keep asserting a held direction.
        if mode != OperationMode::Manual {
            self.dispatcher.cancel_continuous().await;
        }
        self.dispatcher
            .send_once(&CarCommand::Mode(drive_mode))
            .await?;
        self.enter_mode(mode);
        Ok(())
    }

    /// Directional press intent from the UI.
    ///
    /// Up/down: short presses fire a burst that stops on its own, long
    /// presses assert continuously, release cancels and writes a stop.
    /// Left/right turns are edge-triggered on the firmware, so every press
    /// kind maps to a single turning write. Exactly one dispatch per
    /// gesture.
    pub async fn press_direction(
        &self,
        direction: Direction,
        kind: PressKind,
    ) -> Result<(), BridgeError> {
        {
            let state = self.state.lock().unwrap();
            match state.mode {
                OperationMode::Disconnected => return Err(BridgeError::NotConnected),
                OperationMode::Waypoint => {
                    warn!("Ignoring directional press while in waypoint mode");
                    return Ok(());
                }
                OperationMode::Manual => {}
            }
        }

        match direction {
            Direction::Left | Direction::Right => {
                if kind == PressKind::Release {
                    return Ok(());
                }
                self.note_direction(direction, true);
                self.dispatcher.send_turn(direction).await
            }
            Direction::Up | Direction::Down => match kind {
                PressKind::Short => {
                    self.note_direction(direction, true);
                    self.dispatcher
                        .send_burst(CarCommand::Direction(direction))
                        .await;
                    Ok(())
                }
                PressKind::Long => {
                    self.note_direction(direction, true);
                    self.dispatcher
                        .send_continuous(CarCommand::Direction(direction))
                        .await;
                    Ok(())
                }
                PressKind::Release => {
                    self.dispatcher.cancel_continuous().await;
                    self.state.lock().unwrap().is_running = false;
                    self.dispatcher.send_once(&CarCommand::Stop).await
                }
            },
        }
    }

    /// Slider-driven speed change. The session state updates immediately;
    /// the wire write is debounced so a fast drag delivers only the final
    /// level, and re-sending an already-delivered level is skipped.
    pub fn set_speed(&self, level: u8) -> Result<(), BridgeError> {
        let level = SpeedLevel::new(level).get();
        {
            let mut state = self.state.lock().unwrap();
            if state.mode == OperationMode::Disconnected {
                return Err(BridgeError::NotConnected);
            }
            state.speed = level;
        }

        let token = CancellationToken::new();
        {
            let mut pending = self.speed_debounce.lock().unwrap();
            if let Some(previous) = pending.take() {
                previous.cancel();
            }
            *pending = Some(token.clone());
        }

        let dispatcher = self.dispatcher.clone();
        let state = self.state.clone();
        let last_sent = self.last_sent_speed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(SPEED_DEBOUNCE) => {
                    let latest = state.lock().unwrap().speed;
                    if *last_sent.lock().unwrap() == Some(latest) {
                        return;
                    }
                    let command = CarCommand::Speed(SpeedLevel::new(latest));
                    if dispatcher.send_once(&command).await.is_ok() {
                        *last_sent.lock().unwrap() = Some(latest);
                    }
                }
            }
        });
        Ok(())
    }

    /// Pause always writes a stop; resume re-asserts the last known
    /// direction instead of a generic "go" token.
    pub async fn toggle_running(&self) -> Result<(), BridgeError> {
        let (was_running, direction) = {
            let state = self.state.lock().unwrap();
            if state.mode == OperationMode::Disconnected {
                return Err(BridgeError::NotConnected);
            }
            (state.is_running, state.current_direction)
        };

        if was_running {
            self.dispatcher.cancel_continuous().await;
            self.dispatcher.send_once(&CarCommand::Stop).await?;
            self.state.lock().unwrap().is_running = false;
            info!("Mission paused");
        } else {
            if let Some(direction) = direction {
                self.dispatcher
                    .send_once(&CarCommand::Direction(direction))
                    .await?;
            }
            self.state.lock().unwrap().is_running = true;
            info!("Mission resumed");
        }
        Ok(())
    }

    /// Priority action: pre-empts any in-flight continuous command
    /// unconditionally. The loop is cancelled before the stop is written,
    /// so the stop token is the last thing on the wire.
    pub async fn emergency_stop(&self) -> Result<(), BridgeError> {
        self.dispatcher.cancel_continuous().await;
        self.cancel_pending_speed();
        {
            let mut state = self.state.lock().unwrap();
            state.is_running = false;
            state.speed = 0;
            state.current_direction = None;
        }
        *self.last_sent_speed.lock().unwrap() = None;
        warn!("Emergency stop");
        self.dispatcher.send_once(&CarCommand::Stop).await
    }

    /// Queues a waypoint. The route only reaches the car on commit.
    pub fn add_waypoint(&self, lat: f64, lng: f64) -> Result<(), BridgeError> {
        let mut state = self.state.lock().unwrap();
        match state.mode {
            OperationMode::Disconnected => Err(BridgeError::NotConnected),
            OperationMode::Manual => {
                warn!("Ignoring waypoint while in manual mode");
                Ok(())
            }
            OperationMode::Waypoint => {
                state.waypoints.push(Waypoint::new(lat, lng));
                Ok(())
            }
        }
    }

    /// Drops the queued route, on the car and locally.
    pub async fn clear_waypoints(&self) -> Result<(), BridgeError> {
        {
            let state = self.state.lock().unwrap();
            if state.mode == OperationMode::Disconnected {
                return Err(BridgeError::NotConnected);
            }
        }
        self.dispatcher.send_once(&CarCommand::ClearWaypoints).await?;
        self.state.lock().unwrap().waypoints.clear();
        Ok(())
    }

    /// Sends the whole accumulated route, then the auto-mode token; the
    /// firmware expects the full route before it starts traversing.
    pub async fn commit_waypoints(&self) -> Result<(), BridgeError> {
        let route = {
            let state = self.state.lock().unwrap();
            match state.mode {
                OperationMode::Disconnected => return Err(BridgeError::NotConnected),
                OperationMode::Manual => {
                    warn!("Ignoring route commit while in manual mode");
                    return Ok(());
                }
                OperationMode::Waypoint => state.waypoints.clone(),
            }
        };
        if route.is_empty() {
            warn!("No waypoints queued, nothing to commit");
            return Ok(());
        }
        self.dispatcher.send_waypoints(&route).await?;
        self.state.lock().unwrap().is_running = true;
        info!("Committed route with {} waypoint(s)", route.len());
        Ok(())
    }

    fn note_direction(&self, direction: Direction, running: bool) {
        let mut state = self.state.lock().unwrap();
        state.current_direction = Some(direction);
        state.is_running = running;
    }

    fn enter_mode(&self, mode: OperationMode) {
        {
            let mut state = self.state.lock().unwrap();
            if state.mode == mode {
                return;
            }
            state.mode = mode;
        }
        info!("Operation mode is now {:?}", mode);
        self.events.emit(BridgeEvent::ModeChanged(mode));
    }

    fn cancel_pending_speed(&self) {
        if let Some(token) = self.speed_debounce.lock().unwrap().take() {
            token.cancel();
        }
    }

    /// Connection transitions drive the outer mode machine: the first
    /// successful connection auto-enters manual; any transition away from
    /// connected resets the session and kills every timed task.
    fn spawn_connection_watcher(self: &Arc<Self>, mut rx: watch::Receiver<ConnectionState>) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connection = rx.borrow_and_update().clone();
                        let Some(coordinator) = weak.upgrade() else {
                            break;
                        };
                        coordinator.on_connection_change(connection).await;
                    }
                }
            }
        });
    }

    async fn on_connection_change(&self, connection: ConnectionState) {
        match connection {
            ConnectionState::Connected(id) => {
                let disconnected =
                    self.state.lock().unwrap().mode == OperationMode::Disconnected;
                if disconnected {
                    info!("Connected to {}, entering manual mode", id);
                    self.enter_mode(OperationMode::Manual);
                }
            }
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Failed(_) => {
                self.reset_session().await;
            }
        }
    }

    /// Back to the initial state: no mode, not running, no stale motion
    /// still being asserted.
    async fn reset_session(&self) {
        self.dispatcher.cancel_continuous().await;
        self.cancel_pending_speed();
        let was_connected = {
            let mut state = self.state.lock().unwrap();
            let was = state.mode != OperationMode::Disconnected;
            *state = SessionState::default();
            was
        };
        *self.last_sent_speed.lock().unwrap() = None;
        if was_connected {
            info!("Connection gone, session reset");
            self.events
                .emit(BridgeEvent::ModeChanged(OperationMode::Disconnected));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::test_support::{connected_slot, settle};
    use std::time::Duration;
    use tokio::time::advance;

    struct Harness {
        coordinator: Arc<SessionCoordinator>,
        link: Arc<crate::core::bluetooth::test_support::RecordingLink>,
        state_tx: watch::Sender<ConnectionState>,
        events: EventBus,
    }

    fn harness() -> Harness {
        let (slot, link) = connected_slot();
        let events = EventBus::new();
        let dispatcher = Arc::new(CommandDispatcher::new(slot, events.clone()));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let coordinator = SessionCoordinator::new(dispatcher, state_rx, events.clone());
        Harness {
            coordinator,
            link,
            state_tx,
            events,
        }
    }

    async fn connect(harness: &Harness) {
        harness
            .state_tx
            .send_replace(ConnectionState::Connected("AA:BB".into()));
        settle().await;
    }

    #[tokio::test]
    async fn first_connection_auto_enters_manual() {
        let h = harness();
        let mut rx = h.events.subscribe();
        assert_eq!(h.coordinator.session().mode, OperationMode::Disconnected);

        connect(&h).await;
        assert_eq!(h.coordinator.session().mode, OperationMode::Manual);
        assert!(matches!(
            rx.try_recv().unwrap(),
            BridgeEvent::ModeChanged(OperationMode::Manual)
        ));
    }

    #[tokio::test]
    async fn intents_are_rejected_while_disconnected() {
        let h = harness();
        assert!(matches!(
            h.coordinator.set_speed(5),
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(
            h.coordinator
                .press_direction(Direction::Up, PressKind::Short)
                .await,
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(
            h.coordinator.toggle_running().await,
            Err(BridgeError::NotConnected)
        ));
        assert!(h.link.tokens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_session_and_stops_motion() {
        let h = harness();
        connect(&h).await;
        h.coordinator
            .press_direction(Direction::Up, PressKind::Long)
            .await
            .unwrap();
        settle().await;
        advance(Duration::from_millis(300)).await;
        settle().await;
        assert!(h.coordinator.session().is_running);

        h.state_tx.send_replace(ConnectionState::Disconnected);
        settle().await;
        let written = h.link.tokens().len();
        advance(Duration::from_millis(500)).await;
        settle().await;

        let session = h.coordinator.session();
        assert_eq!(session.mode, OperationMode::Disconnected);
        assert!(!session.is_running);
        assert_eq!(h.link.tokens().len(), written, "loop cancelled on disconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn long_press_asserts_until_release_then_stops() {
        let h = harness();
        connect(&h).await;
        h.coordinator
            .press_direction(Direction::Up, PressKind::Long)
            .await
            .unwrap();
        settle().await;
        // Step the clock one repeat period at a time so every tick fires.
        for _ in 0..10 {
            advance(Duration::from_millis(100)).await;
            settle().await;
        }
        h.coordinator
            .press_direction(Direction::Up, PressKind::Release)
            .await
            .unwrap();
        settle().await;

        let written = h.link.tokens();
        assert!(
            (9..=12).contains(&written.len().saturating_sub(1)),
            "~one assert per 100ms while held: {:?}",
            written.len()
        );
        assert_eq!(written.last().map(String::as_str), Some("S"));
        assert!(written[..written.len() - 1].iter().all(|t| t == "F"));

        let count = written.len();
        advance(Duration::from_millis(500)).await;
        settle().await;
        assert_eq!(h.link.tokens().len(), count, "nothing after release");
    }

    #[tokio::test(start_paused = true)]
    async fn short_press_bursts_and_stops_on_its_own() {
        let h = harness();
        connect(&h).await;
        h.coordinator
            .press_direction(Direction::Down, PressKind::Short)
            .await
            .unwrap();
        settle().await;
        advance(Duration::from_millis(700)).await;
        settle().await;

        let written = h.link.tokens();
        assert_eq!(written.last().map(String::as_str), Some("S"));
        assert!(written[..written.len() - 1].iter().all(|t| t == "B"));
    }

    #[tokio::test]
    async fn turns_are_single_edge_triggered_writes() {
        let h = harness();
        connect(&h).await;
        h.coordinator
            .press_direction(Direction::Left, PressKind::Short)
            .await
            .unwrap();
        h.coordinator
            .press_direction(Direction::Right, PressKind::Long)
            .await
            .unwrap();
        h.coordinator
            .press_direction(Direction::Left, PressKind::Release)
            .await
            .unwrap();
        assert_eq!(h.link.tokens(), vec!["L", "R"]);
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_stop_always_wins() {
        let h = harness();
        connect(&h).await;
        h.coordinator
            .press_direction(Direction::Up, PressKind::Long)
            .await
            .unwrap();
        settle().await;
        advance(Duration::from_millis(300)).await;
        settle().await;

        h.coordinator.emergency_stop().await.unwrap();
        settle().await;
        let at_stop = h.link.tokens();
        assert_eq!(at_stop.last().map(String::as_str), Some("S"));

        advance(Duration::from_millis(500)).await;
        settle().await;
        let after = h.link.tokens();
        assert_eq!(after.len(), at_stop.len(), "no forward token after the stop");

        let session = h.coordinator.session();
        assert!(!session.is_running);
        assert_eq!(session.speed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_speed_changes_coalesce_to_the_latest() {
        let h = harness();
        connect(&h).await;
        h.coordinator.set_speed(3).unwrap();
        h.coordinator.set_speed(5).unwrap();
        h.coordinator.set_speed(7).unwrap();
        settle().await;
        advance(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(h.link.tokens(), vec!["7"]);

        // The same level again is not re-sent.
        h.coordinator.set_speed(7).unwrap();
        settle().await;
        advance(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(h.link.tokens(), vec!["7"]);
    }

    #[tokio::test]
    async fn speed_level_is_clamped_to_the_firmware_range() {
        let h = harness();
        connect(&h).await;
        h.coordinator.set_speed(200).unwrap();
        assert_eq!(h.coordinator.session().speed, 10);
    }

    #[tokio::test]
    async fn waypoint_flow_commits_route_then_auto_token() {
        let h = harness();
        connect(&h).await;
        h.coordinator
            .set_mode(OperationMode::Waypoint)
            .await
            .unwrap();
        h.coordinator.add_waypoint(1.0, 2.0).unwrap();
        h.coordinator.add_waypoint(3.0, 4.0).unwrap();
        h.coordinator.commit_waypoints().await.unwrap();

        // Mode select first, then the route, then the auto assert.
        assert_eq!(h.link.tokens(), vec!["A", "(1,2),(3,4)", "A"]);
        assert!(h.coordinator.session().is_running);
    }

    #[tokio::test]
    async fn clearing_waypoints_tells_the_car_and_empties_the_queue() {
        let h = harness();
        connect(&h).await;
        h.coordinator
            .set_mode(OperationMode::Waypoint)
            .await
            .unwrap();
        h.coordinator.add_waypoint(1.0, 2.0).unwrap();
        h.coordinator.clear_waypoints().await.unwrap();
        assert!(h.coordinator.session().waypoints.is_empty());
        assert_eq!(h.link.tokens().last().map(String::as_str), Some("C"));
    }

    #[tokio::test]
    async fn empty_route_commit_is_a_noop() {
        let h = harness();
        connect(&h).await;
        h.coordinator
            .set_mode(OperationMode::Waypoint)
            .await
            .unwrap();
        let before = h.link.tokens();
        h.coordinator.commit_waypoints().await.unwrap();
        assert_eq!(h.link.tokens(), before);
    }

    #[tokio::test]
    async fn pause_stops_resume_reasserts_last_direction() {
        let h = harness();
        connect(&h).await;
        h.coordinator
            .press_direction(Direction::Left, PressKind::Short)
            .await
            .unwrap();
        assert!(h.coordinator.session().is_running);

        h.coordinator.toggle_running().await.unwrap();
        assert!(!h.coordinator.session().is_running);
        assert_eq!(h.link.tokens().last().map(String::as_str), Some("S"));

        h.coordinator.toggle_running().await.unwrap();
        assert!(h.coordinator.session().is_running);
        assert_eq!(h.link.tokens().last().map(String::as_str), Some("L"));
    }
}
