//! Bridge events
//! The core owns all state; a UI subscribes here and renders. Events are
//! broadcast fire-and-forget: a slow or absent subscriber never blocks
//! scanning, connection handling, or dispatch.

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::bluetooth::types::{ConnectionState, DiscoveredPeripheral};
use crate::core::session::OperationMode;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Everything the core reports to the outside.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum BridgeEvent {
    ScanStarted,
    ScanStopped,
    /// The live discovery set changed (sighting, update, or eviction).
    ScanResultsChanged(Vec<DiscoveredPeripheral>),
    /// The scan stream failed at the transport level; scanning stopped and
    /// can be retried manually.
    ScanFailed { reason: String },
    ConnectionStatusChanged(ConnectionState),
    /// A single command did not make it onto the wire. Transient.
    CommandFailed { reason: String },
    ModeChanged(OperationMode),
}

/// Broadcast fan-out for [`BridgeEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.tx.subscribe()
    }

    /// Emits an event. Having no subscribers is not an error.
    pub fn emit(&self, event: BridgeEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!("No subscribers for event: {:?}", event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
