//! Peripheral discovery
//! Owns the scan lifecycle: deduplicated sighting records, staleness
//! eviction, and the periodic restart of the platform scan primitive. The
//! restart is a liveness measure against silently stalled scan sessions,
//! not a reset; discovered records survive it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::constants::{
    SCAN_RESTART_PERIOD, STALENESS_SWEEP_PERIOD, STALENESS_WINDOW,
};
use crate::core::bluetooth::types::{DiscoveredPeripheral, DiscoverySet};
use crate::core::error::BridgeError;
use crate::core::events::{BridgeEvent, EventBus};

/// Scans for peripherals and maintains the live discovery set.
pub struct PeripheralScanner {
    adapter: Adapter,
    /// Peripheral handles keyed by id, shared with the connection manager
    /// so a discovered id can be connected to.
    devices: Arc<Mutex<HashMap<String, Device>>>,
    records: Arc<StdMutex<DiscoverySet>>,
    cancel_token: CancellationToken,
    scan_task: Option<JoinHandle<()>>,
    events: EventBus,
}

impl PeripheralScanner {
    pub fn new(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        events: EventBus,
    ) -> Self {
        Self {
            adapter,
            devices,
            records: Arc::new(StdMutex::new(DiscoverySet::new(STALENESS_WINDOW))),
            cancel_token: CancellationToken::new(),
            scan_task: None,
            events,
        }
    }

    /// Starts an unbounded scan session. Only proceeds once the radio is
    /// actually available; otherwise nothing starts and the caller gets a
    /// permission-denied condition.
    pub async fn start_scan(&mut self) -> Result<(), BridgeError> {
        if self.scan_task.is_some() {
            self.stop_scan().await;
        }
        self.adapter
            .wait_available()
            .await
            .map_err(|e| BridgeError::PermissionDenied(e.to_string()))?;

        // Fresh session, fresh result set.
        self.records.lock().unwrap().clear();
        self.devices.lock().await.clear();

        self.cancel_token = CancellationToken::new();
        let token = self.cancel_token.clone();
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let records = self.records.clone();
        let events = self.events.clone();

        self.scan_task = Some(tokio::spawn(async move {
            scan_task(adapter, devices, records, events.clone(), token).await;
            events.emit(BridgeEvent::ScanStopped);
        }));

        self.events.emit(BridgeEvent::ScanStarted);
        info!("Peripheral scan started");
        Ok(())
    }

    /// Bounded scan session for the device picker: auto-stops after
    /// `duration` regardless of results.
    pub async fn scan_for(&mut self, duration: std::time::Duration) -> Result<(), BridgeError> {
        self.start_scan().await?;
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(duration) => {
                    info!("Bounded scan session over after {:?}", duration);
                    token.cancel();
                }
            }
        });
        Ok(())
    }

    /// Stops scanning. Idempotent; calling with no scan active does nothing.
    pub async fn stop_scan(&mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.scan_task.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Scan task ended with a join error: {:?}", e);
                }
            }
            info!("Peripheral scan stopped");
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Current discovery set, sorted by id.
    pub fn snapshot(&self) -> Vec<DiscoveredPeripheral> {
        self.records.lock().unwrap().snapshot()
    }
}

async fn scan_task(
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    records: Arc<StdMutex<DiscoverySet>>,
    events: EventBus,
    token: CancellationToken,
) {
    let mut sweep = interval(STALENESS_SWEEP_PERIOD);
    'session: loop {
        let mut stream = match adapter.scan(&[]).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scan stream: {}", e);
                events.emit(BridgeEvent::ScanFailed {
                    reason: BridgeError::Scan(e.to_string()).to_string(),
                });
                return;
            }
        };
        debug!("Scan stream (re)started");
        let restart = sleep(SCAN_RESTART_PERIOD);
        tokio::pin!(restart);

        loop {
            tokio::select! {
                _ = token.cancelled() => break 'session,
                // Platform scans can stall silently; recreate the stream on
                // a fixed period while keeping the records.
                _ = &mut restart => continue 'session,
                _ = sweep.tick() => {
                    let evicted = records.lock().unwrap().sweep(Instant::now());
                    if !evicted.is_empty() {
                        let mut devices = devices.lock().await;
                        for id in &evicted {
                            devices.remove(id);
                        }
                        drop(devices);
                        debug!("Evicted {} stale peripheral(s)", evicted.len());
                        let snapshot = records.lock().unwrap().snapshot();
                        events.emit(BridgeEvent::ScanResultsChanged(snapshot));
                    }
                }
                sighting = stream.next() => {
                    match sighting {
                        Some(discovered) => {
                            record_sighting(&devices, &records, &events, discovered).await;
                        }
                        None => {
                            warn!("Scan stream ended unexpectedly, restarting");
                            continue 'session;
                        }
                    }
                }
            }
        }
    }
}

async fn record_sighting(
    devices: &Mutex<HashMap<String, Device>>,
    records: &StdMutex<DiscoverySet>,
    events: &EventBus,
    discovered: bluest::AdvertisingDevice,
) {
    let device = discovered.device;
    let rssi = discovered.rssi;
    let id = device.id().to_string();
    let name = device.name().ok();
    debug!("Sighted peripheral {} ({:?}, rssi {:?})", id, name, rssi);

    let changed = {
        let mut records = records.lock().unwrap();
        records.upsert(&id, name, extract_mac_address(&id), rssi, Instant::now())
    };
    devices.lock().await.insert(id, device);

    if changed {
        let snapshot = records.lock().unwrap().snapshot();
        events.emit(BridgeEvent::ScanResultsChanged(snapshot));
    }
}

/// Pulls a display MAC address out of the platform's opaque peripheral id,
/// when it contains one (it does not on macOS).
fn extract_mac_address(peripheral_id: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").expect("valid pattern");
    re.find_iter(peripheral_id)
        .last()
        .map(|m| m.as_str().to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_trailing_mac_from_platform_id() {
        assert_eq!(
            extract_mac_address("dev_12:34:56:78:9a:bc"),
            Some("12:34:56:78:9A:BC".to_string())
        );
    }

    #[test]
    fn opaque_id_without_mac_yields_none() {
        assert_eq!(extract_mac_address("6D49F1F2-0AE3-47BC"), None);
    }
}
