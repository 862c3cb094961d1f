use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;

/// Set by the Ctrl+C handler. Doubles as the capture loop's stop predicate and
/// the liveness check enrichment tasks consult before touching shared state.
pub type ShutdownFlag = Arc<AtomicBool>;

/// The four behaviours the classifier can recognise in a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Outbound DNS question, readable by anyone on the path.
    DnsQuery,
    /// Cleartext HTTP on port 80.
    PlaintextHttp,
    /// SSDP or mDNS announcement leaking device identity to the LAN.
    ServiceBroadcast,
    /// Any other flow to an external address. Feeds the map, never the ledger.
    GenericExternalFlow,
}

impl SignalKind {
    /// Broadcasts re-announce constantly and get the long cooldown.
    pub fn uses_broadcast_cooldown(self) -> bool {
        matches!(self, SignalKind::ServiceBroadcast)
    }

    /// Whether an external destination of this kind should be geolocated.
    ///
    /// Broadcasts go to multicast groups, which the prefix heuristic would
    /// otherwise count as external.
    pub fn locates_destination(self) -> bool {
        !matches!(self, SignalKind::ServiceBroadcast)
    }
}

/// One classified, scoring-eligible observation taken from a single packet.
///
/// Built by the classifier, consumed once by the deduplicator and then the
/// ledger, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub source:      String,
    pub destination: String,
    pub kind:        SignalKind,
    /// What was observed. Together with `source` this is the dedup key and the
    /// ledger's activity key.
    pub activity:    String,
    pub weight:      f32,
    pub name:        Option<String>,
    /// Log line presented for this observation.
    pub message:     String,
}

/// Read-only copy of a device handed to the event sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub address:    String,
    pub name:       Option<String>,
    pub activities: Vec<String>,
    pub risk:       f32,
}

/// Successful geolocation result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoPoint {
    pub lat:  f64,
    pub lon:  f64,
    pub city: String,
}

/// Running counters reported in the shutdown summary.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub packets_total:      AtomicU64,
    pub signals_accepted:   AtomicU64,
    pub signals_suppressed: AtomicU64,
    pub devices_seen:       AtomicU64,
    pub locations_resolved: AtomicU64,
    pub lookups_failed:     AtomicU64,
}

pub type SharedStats = Arc<SessionStats>;

impl SessionStats {
    pub fn new() -> SharedStats {
        Arc::new(Self::default())
    }
}
