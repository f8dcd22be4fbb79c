//! Shared data structures for the Bluetooth module.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

/// A peripheral sighted during discovery.
///
/// Unique by `id` within the discovery set; refreshed in place on every
/// re-sighting and evicted once it has not been seen for the staleness
/// window.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPeripheral {
    /// Platform-specific opaque identifier (the connect key).
    pub id: String,
    /// Advertised name, if the advertisement carried one.
    pub name: Option<String>,
    /// Display address extracted from the id (MAC on most platforms,
    /// may be absent on macOS).
    pub address: Option<String>,
    /// Signal strength at the last sighting.
    pub rssi: Option<i16>,
    /// When this peripheral was last sighted.
    #[serde(skip)]
    pub last_seen: Instant,
}

/// Lifecycle of the single active connection. Only the connection manager
/// transitions it; everything else observes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected and the command characteristic is resolved.
    Connected(String),
    /// Published transiently on a failed attempt, before settling back on
    /// `Disconnected`.
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// Deduplicating discovery set with staleness eviction.
///
/// Pure bookkeeping, separated from the scan task so the dedup and eviction
/// rules can be exercised without a radio.
#[derive(Debug)]
pub struct DiscoverySet {
    records: HashMap<String, DiscoveredPeripheral>,
    staleness_window: Duration,
}

impl DiscoverySet {
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            records: HashMap::new(),
            staleness_window,
        }
    }

    /// Records a sighting. A known id is refreshed in place; a new id gets a
    /// fresh record. Returns true when the visible set changed in a way a
    /// UI would care about (new entry, or name/rssi update).
    pub fn upsert(
        &mut self,
        id: &str,
        name: Option<String>,
        address: Option<String>,
        rssi: Option<i16>,
        now: Instant,
    ) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                let changed = record.name != name || record.rssi != rssi;
                record.name = name;
                record.rssi = rssi;
                record.last_seen = now;
                changed
            }
            None => {
                self.records.insert(
                    id.to_string(),
                    DiscoveredPeripheral {
                        id: id.to_string(),
                        name,
                        address,
                        rssi,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Evicts every record not re-sighted within the staleness window.
    /// Returns the ids of the evicted records.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let window = self.staleness_window;
        let evicted: Vec<String> = self
            .records
            .values()
            .filter(|record| now.duration_since(record.last_seen) > window)
            .map(|record| record.id.clone())
            .collect();
        for id in &evicted {
            self.records.remove(id);
        }
        evicted
    }

    /// Drops every record (scan-session teardown).
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Current records, sorted by id for a stable presentation order.
    pub fn snapshot(&self) -> Vec<DiscoveredPeripheral> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    #[test]
    fn resighting_updates_in_place() {
        let mut set = DiscoverySet::new(WINDOW);
        let t0 = Instant::now();
        set.upsert("AA:BB", Some("car".into()), None, Some(-60), t0);
        for i in 1..=4u64 {
            set.upsert(
                "AA:BB",
                Some("car".into()),
                None,
                Some(-60),
                t0 + Duration::from_secs(i),
            );
        }
        assert_eq!(set.len(), 1);
        let record = &set.snapshot()[0];
        assert_eq!(record.last_seen, t0 + Duration::from_secs(4));
    }

    #[test]
    fn sweep_evicts_only_stale_records() {
        let mut set = DiscoverySet::new(WINDOW);
        let t0 = Instant::now();
        set.upsert("old", None, None, None, t0);
        set.upsert("fresh", None, None, None, t0 + Duration::from_secs(5));
        let evicted = set.sweep(t0 + Duration::from_secs(11));
        assert_eq!(evicted, vec!["old"]);
        let ids: Vec<_> = set.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["fresh"]);
    }

    #[test]
    fn record_at_exact_window_boundary_survives() {
        let mut set = DiscoverySet::new(WINDOW);
        let t0 = Instant::now();
        set.upsert("edge", None, None, None, t0);
        assert!(set.sweep(t0 + WINDOW).is_empty());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn upsert_reports_visible_changes() {
        let mut set = DiscoverySet::new(WINDOW);
        let t0 = Instant::now();
        assert!(set.upsert("AA", None, None, Some(-70), t0));
        // Same name and rssi: only last_seen moved, nothing to re-render.
        assert!(!set.upsert("AA", None, None, Some(-70), t0 + Duration::from_secs(1)));
        assert!(set.upsert("AA", Some("car".into()), None, Some(-70), t0 + Duration::from_secs(2)));
    }
}
