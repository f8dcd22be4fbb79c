//! Bridge state management
//! This module assembles the scanner, connection manager, dispatcher, and
//! session coordinator into one service object a frontend talks to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bluest::{Adapter, Device};
use log::info;
use tokio::sync::{Mutex, watch};

use crate::config::LinkConfig;
use crate::core::bluetooth::types::{ConnectionState, DiscoveredPeripheral};
use crate::core::bluetooth::{CommandDispatcher, ConnectionManager, PeripheralScanner};
use crate::core::error::BridgeError;
use crate::core::events::{BridgeEvent, EventBus};
use crate::core::session::SessionCoordinator;

/// The assembled bridge. One per application.
pub struct BridgeState {
    events: EventBus,
    scanner: Mutex<PeripheralScanner>,
    connection: Arc<ConnectionManager>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub session: Arc<SessionCoordinator>,
}

impl BridgeState {
    /// Acquires the platform adapter and wires the whole stack together.
    pub async fn new(config: LinkConfig) -> Result<Self, BridgeError> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| BridgeError::Scan("no Bluetooth adapter found".into()))?;
        adapter
            .wait_available()
            .await
            .map_err(|e| BridgeError::PermissionDenied(e.to_string()))?;
        info!("Bluetooth adapter is available");

        let events = EventBus::new();
        let devices: Arc<Mutex<HashMap<String, Device>>> = Arc::new(Mutex::new(HashMap::new()));

        let scanner = PeripheralScanner::new(adapter.clone(), devices.clone(), events.clone());
        let connection = Arc::new(ConnectionManager::new(
            adapter,
            config,
            devices,
            events.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            connection.link_slot(),
            events.clone(),
        ));
        let session =
            SessionCoordinator::new(dispatcher.clone(), connection.subscribe_state(), events.clone());

        Ok(Self {
            events,
            scanner: Mutex::new(scanner),
            connection,
            dispatcher,
            session,
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub async fn start_scan(&self) -> Result<(), BridgeError> {
        self.scanner.lock().await.start_scan().await
    }

    /// Scan that stops itself after `duration`.
    pub async fn scan_for(&self, duration: Duration) -> Result<(), BridgeError> {
        self.scanner.lock().await.scan_for(duration).await
    }

    pub async fn stop_scan(&self) {
        self.scanner.lock().await.stop_scan().await;
    }

    pub async fn discovered(&self) -> Vec<DiscoveredPeripheral> {
        self.scanner.lock().await.snapshot()
    }

    /// Connects to a peripheral from the discovery set. Scanning is stopped
    /// first; the platform radio does not serve both well at once.
    pub async fn connect_to(&self, peripheral_id: &str) -> Result<(), BridgeError> {
        self.stop_scan().await;
        self.connection.connect(peripheral_id).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe_state()
    }

    /// Orderly teardown: stop the car, drop the link, stop scanning.
    pub async fn dispose(&self) {
        if self.connection_state().is_connected() {
            let _ = self.session.emergency_stop().await;
        }
        self.session.shutdown().await;
        self.disconnect().await;
        self.stop_scan().await;
        info!("Bridge disposed");
    }
}
