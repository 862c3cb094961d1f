use std::time::Duration;

/// BPF expression handed to libpcap for live capture.
///
/// Restricts the stream to the four protocols the classifier understands:
/// DNS, SSDP, mDNS and plaintext HTTP. Everything else is dropped in-kernel
/// before it ever reaches the packet loop.
pub const CAPTURE_FILTER: &str = "udp port 53 or udp port 1900 or udp port 5353 or tcp port 80";

pub const DNS_PORT:  u16 = 53;
pub const HTTP_PORT: u16 = 80;
pub const SSDP_PORT: u16 = 1900;
pub const MDNS_PORT: u16 = 5353;

/// Cooldown applied to a repeated `(address, activity)` pair.
///
/// Two seconds absorbs retransmissions and the burst of identical lookups a
/// browser fires while loading one page.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);

/// Cooldown for SSDP / mDNS announcements.
///
/// Discovery protocols re-announce on a timer, often several times a second
/// during startup, so they get a longer quiet period than request traffic.
pub const BROADCAST_COOLDOWN: Duration = Duration::from_secs(10);

/// Upper bound on a single reverse-DNS or geolocation call.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_millis(2000);

/// Geolocation endpoint. `{ip}` is replaced with the address being located.
pub const GEO_ENDPOINT: &str = "http://ip-api.com/json/{ip}?fields=status,city,lat,lon";

/// Address prefixes treated as local.
///
/// This is a string-prefix heuristic, not CIDR arithmetic: `172.16.` stands in
/// for the whole `172.16.0.0/12` block and therefore misses `172.17`–`172.31`.
pub const PRIVATE_PREFIXES: [&str; 4] = ["10.", "192.168.", "172.16.", "127."];

/// Per-kind score increments applied by the ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskWeights {
    pub dns:        f32,
    pub http_get:   f32,
    pub http_other: f32,
    pub broadcast:  f32,
}

impl RiskWeights {
    /// Conservative table: lookups barely register, broadcasts are near-free.
    pub const CLASSIC: RiskWeights = RiskWeights {
        dns:        0.01,
        http_get:   0.08,
        http_other: 0.04,
        broadcast:  0.005,
    };

    /// Aggressive table used by default.
    pub const FINAL: RiskWeights = RiskWeights {
        dns:        0.05,
        http_get:   0.2,
        http_other: 0.1,
        broadcast:  0.03,
    };
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self::FINAL
    }
}

/// Upper (exclusive) bounds of the global threat bands.
///
/// Anything at or above `elevated` is critical.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreatBands {
    pub nominal:  f32,
    pub low:      f32,
    pub caution:  f32,
    pub elevated: f32,
}

impl Default for ThreatBands {
    fn default() -> Self {
        Self {
            nominal:  0.1,
            low:      0.4,
            caution:  0.7,
            elevated: 0.9,
        }
    }
}

/// Cooldowns and enrichment knobs resolved from the command line.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub weights:            RiskWeights,
    pub bands:              ThreatBands,
    pub cooldown:           Duration,
    pub broadcast_cooldown: Duration,
    pub lookup_timeout:     Duration,
    pub geo_endpoint:       String,
    /// When `false`, no external lookups are issued at all.
    pub enrich:             bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            weights:            RiskWeights::default(),
            bands:              ThreatBands::default(),
            cooldown:           DEFAULT_COOLDOWN,
            broadcast_cooldown: BROADCAST_COOLDOWN,
            lookup_timeout:     LOOKUP_TIMEOUT,
            geo_endpoint:       GEO_ENDPOINT.to_string(),
            enrich:             true,
        }
    }
}

impl EngineSettings {
    /// Largest cooldown in effect; dedup entries older than this can never
    /// suppress anything and are safe to evict.
    pub fn max_cooldown(&self) -> Duration {
        self.cooldown.max(self.broadcast_cooldown)
    }
}
