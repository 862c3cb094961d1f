//! Best-effort geolocation and reverse-DNS enrichment.
//!
//! Lookups are external network calls with a short timeout. Every failure is
//! final for the session: a failed geolocation is never retried and a failed
//! reverse lookup is memoized as the bare address.

use crate::monitor::classifier::is_external;
use crate::monitor::types::GeoPoint;
use crossbeam::channel;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("lookup timed out")]
    Timeout,
    #[error("invalid address '{0}'")]
    Address(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("lookup rejected: {0}")]
    Status(String),
    #[error("reverse lookup failed: {0}")]
    Resolve(#[from] std::io::Error),
}

/// External geolocation service.
pub trait GeoLookup: Send + Sync {
    fn locate(&self, addr: &str) -> Result<GeoPoint, EnrichError>;
}

/// External reverse-DNS service.
pub trait ReverseDns: Send + Sync {
    fn reverse(&self, addr: &str) -> Result<String, EnrichError>;
}

// ── ip-api.com backend ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status:  String,
    city:    Option<String>,
    lat:     Option<f64>,
    lon:     Option<f64>,
    message: Option<String>,
}

/// JSON geolocation over HTTP. `endpoint` contains an `{ip}` placeholder.
pub struct IpApi {
    client:   reqwest::blocking::Client,
    endpoint: String,
}

impl IpApi {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, EnrichError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client, endpoint: endpoint.to_string() })
    }
}

impl GeoLookup for IpApi {
    fn locate(&self, addr: &str) -> Result<GeoPoint, EnrichError> {
        let url  = self.endpoint.replace("{ip}", addr);
        let resp = self.client.get(&url).send()?.json::<IpApiResponse>()?;

        if resp.status != "success" {
            return Err(EnrichError::Status(resp.message.unwrap_or(resp.status)));
        }
        match (resp.lat, resp.lon, resp.city) {
            (Some(lat), Some(lon), Some(city)) => Ok(GeoPoint { lat, lon, city }),
            _ => Err(EnrichError::Status("incomplete response".to_string())),
        }
    }
}

// ── System resolver backend ──────────────────────────────────────────────────

/// `getnameinfo`-based reverse lookup bounded by `timeout`.
///
/// The libc call itself cannot be cancelled, so it runs on a helper thread
/// and is abandoned when the deadline passes.
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ReverseDns for SystemResolver {
    fn reverse(&self, addr: &str) -> Result<String, EnrichError> {
        let ip: IpAddr = addr.parse().map_err(|_| EnrichError::Address(addr.to_string()))?;
        let (tx, rx) = channel::bounded(1);
        thread::Builder::new()
            .name("netscan-getnameinfo".to_string())
            .spawn(move || {
                let _ = tx.send(dns_lookup::lookup_addr(&ip));
            })?;
        match rx.recv_timeout(self.timeout) {
            Ok(result) => Ok(result?),
            Err(_)     => Err(EnrichError::Timeout),
        }
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────────

/// Map marker emitted once per newly located address.
#[derive(Debug, Clone, PartialEq)]
pub struct MapMarker {
    pub address: String,
    pub point:   GeoPoint,
    /// Addresses located in this city so far, including this one.
    pub count:   u32,
    pub label:   String,
}

/// Location cache, in-flight set and city aggregate. Kept under one lock so
/// the check-and-mark in [`Enricher::claim`] is atomic with respect to all three.
#[derive(Debug, Default)]
struct GeoState {
    locations: HashMap<String, GeoPoint>,
    pending:   HashSet<String>,
    failed:    HashSet<String>,
    cities:    HashMap<String, u32>,
}

pub struct Enricher {
    geo:       Box<dyn GeoLookup>,
    dns:       Box<dyn ReverseDns>,
    enabled:   bool,
    state:     Mutex<GeoState>,
    hostnames: DashMap<String, String>,
}

impl Enricher {
    pub fn new(geo: Box<dyn GeoLookup>, dns: Box<dyn ReverseDns>) -> Self {
        Self {
            geo,
            dns,
            enabled:   true,
            state:     Mutex::new(GeoState::default()),
            hostnames: DashMap::new(),
        }
    }

    /// An enricher that never performs external calls.
    pub fn disabled() -> Self {
        struct Offline;
        impl GeoLookup for Offline {
            fn locate(&self, _: &str) -> Result<GeoPoint, EnrichError> {
                Err(EnrichError::Status("enrichment disabled".to_string()))
            }
        }
        impl ReverseDns for Offline {
            fn reverse(&self, addr: &str) -> Result<String, EnrichError> {
                Ok(addr.to_string())
            }
        }

        Self { enabled: false, ..Self::new(Box::new(Offline), Box::new(Offline)) }
    }

    /// Marks `addr` as in flight if it is external and has never been
    /// looked up. Returns `false` when no lookup should be issued.
    pub fn claim(&self, addr: &str) -> bool {
        if !self.enabled || !is_external(addr) {
            return false;
        }
        let Ok(mut state) = self.state.lock() else { return false };
        if state.locations.contains_key(addr)
            || state.failed.contains(addr)
            || state.pending.contains(addr)
        {
            return false;
        }
        state.pending.insert(addr.to_string());
        true
    }

    /// Gives back a claim whose lookup never started.
    pub fn release(&self, addr: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.pending.remove(addr);
        }
    }

    /// Performs the lookup for an address previously [`claim`](Self::claim)ed.
    ///
    /// Nothing is recorded if `shutdown` was raised while the call was in
    /// flight.
    pub fn complete_lookup(&self, addr: &str, shutdown: &AtomicBool) -> Option<MapMarker> {
        let result = self.geo.locate(addr);

        let Ok(mut state) = self.state.lock() else { return None };
        state.pending.remove(addr);

        if shutdown.load(Ordering::Relaxed) {
            return None;
        }

        let point = match result {
            Ok(p)  => p,
            Err(_) => {
                state.failed.insert(addr.to_string());
                return None;
            }
        };

        if state.locations.contains_key(addr) {
            return None;
        }
        state.locations.insert(addr.to_string(), point.clone());

        let count = {
            let c = state.cities.entry(point.city.clone()).or_insert(0);
            *c += 1;
            *c
        };
        let label = if count == 1 {
            format!("{} ({})", point.city, addr)
        } else {
            format!("{} ({} Nodes)", point.city, count)
        };

        Some(MapMarker { address: addr.to_string(), point, count, label })
    }

    /// Hostname for `addr` if already known. Never blocks.
    pub fn cached_hostname(&self, addr: &str) -> Option<String> {
        if !self.enabled {
            return Some(addr.to_string());
        }
        self.hostnames.get(addr).map(|n| n.value().clone())
    }

    /// Memoized reverse lookup. Failures are cached as the address itself.
    pub fn resolve_hostname(&self, addr: &str) -> String {
        if let Some(name) = self.cached_hostname(addr) {
            return name;
        }
        let name = self.dns.reverse(addr).unwrap_or_else(|_| addr.to_string());
        self.hostnames
            .entry(addr.to_string())
            .or_insert(name)
            .value()
            .clone()
    }

    #[cfg(test)]
    pub fn location(&self, addr: &str) -> Option<GeoPoint> {
        self.state.lock().ok()?.locations.get(addr).cloned()
    }

    #[cfg(test)]
    pub fn city_count(&self, city: &str) -> u32 {
        self.state
            .lock()
            .map(|s| s.cities.get(city).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}
