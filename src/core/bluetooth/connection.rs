//! Connection lifecycle for the single active car link
//! This module owns connect/retry/disconnect and the resolution of the
//! command characteristic. Nothing else creates or destroys the peripheral
//! handle; the dispatcher only borrows the installed [`CommandLink`].

use std::collections::HashMap;
use std::sync::Arc;

use bluest::{Adapter, Characteristic, Device};
use log::{error, info, warn};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::LinkConfig;
use crate::core::bluetooth::constants::{
    CONNECT_RETRY_DELAY, CONNECT_TIMEOUT, LINK_SUPERVISOR_PERIOD, MAX_CONNECT_RETRIES,
};
use crate::core::bluetooth::types::ConnectionState;
use crate::core::error::BridgeError;
use crate::core::events::{BridgeEvent, EventBus};

/// Write access to the car's command characteristic.
///
/// The dispatcher depends only on this shape, not on a specific BLE binding,
/// so dispatch and session logic run against a recording fake in tests.
#[async_trait::async_trait]
pub trait CommandLink: Send + Sync {
    /// Writes one payload to the command characteristic.
    async fn write(&self, payload: &[u8], with_response: bool) -> Result<(), BridgeError>;
}

/// Shared slot holding the link of the current connection, if any.
///
/// The connection manager installs and clears it; the dispatcher holds a
/// read guard for the duration of each write, so clearing the slot on
/// disconnect waits for any in-flight write to finish its result handling.
pub type LinkSlot = Arc<RwLock<Option<Arc<dyn CommandLink>>>>;

/// [`CommandLink`] over a resolved bluest characteristic.
pub struct BluestCommandLink {
    characteristic: Characteristic,
}

impl BluestCommandLink {
    pub fn new(characteristic: Characteristic) -> Self {
        Self { characteristic }
    }
}

#[async_trait::async_trait]
impl CommandLink for BluestCommandLink {
    async fn write(&self, payload: &[u8], with_response: bool) -> Result<(), BridgeError> {
        let result = if with_response {
            self.characteristic.write(payload).await
        } else {
            self.characteristic.write_without_response(payload).await
        };
        result.map_err(|e| BridgeError::WriteFailed(e.to_string()))
    }
}

struct Supervisor {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Manages the lifecycle of the one active connection.
pub struct ConnectionManager {
    adapter: Adapter,
    config: LinkConfig,
    /// Peripheral handles keyed by id, shared with the scanner that
    /// discovered them.
    devices: Arc<Mutex<HashMap<String, Device>>>,
    link_slot: LinkSlot,
    active_device: Mutex<Option<Device>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Held for the duration of a connect() call; a second call while an
    /// attempt is in flight is rejected, not queued.
    connect_guard: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    events: EventBus,
}

impl ConnectionManager {
    pub fn new(
        adapter: Adapter,
        config: LinkConfig,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        events: EventBus,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            adapter,
            config,
            devices,
            link_slot: Arc::new(RwLock::new(None)),
            active_device: Mutex::new(None),
            supervisor: Mutex::new(None),
            connect_guard: Mutex::new(()),
            state_tx,
            events,
        }
    }

    /// The slot the dispatcher reads its link from.
    pub fn link_slot(&self) -> LinkSlot {
        self.link_slot.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Observe state transitions. `watch` keeps only the latest value, so a
    /// receiver that lags can miss the transient `Failed` and observe just
    /// the `Disconnected` it settles into; the event bus carries both, so
    /// failure reasons belong there, not here.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Connects to a previously discovered peripheral and resolves the
    /// command characteristic. `Connected` is only reported once the
    /// characteristic is usable; anything less is a failure.
    pub async fn connect(self: &Arc<Self>, peripheral_id: &str) -> Result<(), BridgeError> {
        let _guard = self.connect_guard.try_lock().map_err(|_| {
            BridgeError::Connection("another connection attempt is already in flight".into())
        })?;
        if self.state().is_connected() {
            return Err(BridgeError::Connection(
                "already connected; disconnect first".into(),
            ));
        }

        let device = {
            let devices = self.devices.lock().await;
            devices.get(peripheral_id).cloned().ok_or_else(|| {
                BridgeError::Connection(format!("unknown peripheral id: {}", peripheral_id))
            })?
        };

        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {}...", peripheral_id);

        let characteristic = match timeout(CONNECT_TIMEOUT, self.connect_with_retry(&device)).await
        {
            Ok(Ok(characteristic)) => characteristic,
            Ok(Err(reason)) => return Err(self.fail(reason)),
            Err(_) => {
                return Err(self.fail(format!(
                    "connection attempt timed out after {:?}",
                    CONNECT_TIMEOUT
                )));
            }
        };

        *self.link_slot.write().await = Some(Arc::new(BluestCommandLink::new(characteristic)));
        *self.active_device.lock().await = Some(device.clone());
        self.set_state(ConnectionState::Connected(peripheral_id.to_string()));
        self.spawn_supervisor(device).await;
        info!("Connected to {} and command characteristic resolved", peripheral_id);
        Ok(())
    }

    /// Tears the connection down. Always ends in `Disconnected`; a failing
    /// platform teardown call is logged, not retried and not surfaced.
    pub async fn disconnect(&self) {
        self.stop_supervisor().await;
        // Waits for an in-flight write holding a read guard to finish.
        *self.link_slot.write().await = None;

        if let Some(device) = self.active_device.lock().await.take() {
            if device.is_connected().await {
                if let Err(e) = self.adapter.disconnect_device(&device).await {
                    warn!("Teardown of device link failed (ignored): {}", e);
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected");
    }

    async fn connect_with_retry(&self, device: &Device) -> Result<Characteristic, String> {
        let mut last_error = String::from("no connection attempt made");
        for attempt in 1..=MAX_CONNECT_RETRIES {
            match self.try_connect(device).await {
                Ok(characteristic) => return Ok(characteristic),
                Err(reason) => {
                    warn!("Connection attempt {} failed: {}", attempt, reason);
                    last_error = reason;
                    if attempt < MAX_CONNECT_RETRIES {
                        sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn try_connect(&self, device: &Device) -> Result<Characteristic, String> {
        if !device.is_connected().await {
            self.adapter
                .connect_device(device)
                .await
                .map_err(|e| format!("peripheral unreachable: {}", e))?;
        }

        info!("Link up, resolving command service {}...", self.config.service_uuid);
        let services = device
            .services()
            .await
            .map_err(|e| format!("service discovery failed: {}", e))?;
        let service = services
            .iter()
            .find(|s| s.uuid() == self.config.service_uuid)
            .ok_or_else(|| {
                for service in &services {
                    info!("Available service: {}", service.uuid());
                }
                format!("command service {} not found", self.config.service_uuid)
            })?;

        let characteristics = service
            .characteristics()
            .await
            .map_err(|e| format!("characteristic discovery failed: {}", e))?;
        characteristics
            .into_iter()
            .find(|c| c.uuid() == self.config.characteristic_uuid)
            .ok_or_else(|| {
                format!(
                    "command characteristic {} not found",
                    self.config.characteristic_uuid
                )
            })
    }

    /// Reports the failure transiently, settles on `Disconnected`, and hands
    /// back the error for the caller.
    fn fail(&self, reason: String) -> BridgeError {
        error!("Connection failed: {}", reason);
        self.set_state(ConnectionState::Failed(reason.clone()));
        self.set_state(ConnectionState::Disconnected);
        BridgeError::Connection(reason)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state.clone());
        self.events.emit(BridgeEvent::ConnectionStatusChanged(state));
    }

    /// Polls the platform link so a silently dropped connection surfaces as
    /// a state transition instead of a string of failed writes.
    async fn spawn_supervisor(self: &Arc<Self>, device: Device) {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = sleep(LINK_SUPERVISOR_PERIOD) => {
                        if !device.is_connected().await {
                            warn!("Link to {} lost", device.id());
                            manager.handle_link_loss().await;
                            break;
                        }
                    }
                }
            }
        });
        *self.supervisor.lock().await = Some(Supervisor { token, handle });
    }

    async fn stop_supervisor(&self) {
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor.token.cancel();
            supervisor.handle.abort();
        }
    }

    async fn handle_link_loss(&self) {
        *self.link_slot.write().await = None;
        *self.active_device.lock().await = None;
        *self.supervisor.lock().await = None;
        self.set_state(ConnectionState::Disconnected);
    }
}
