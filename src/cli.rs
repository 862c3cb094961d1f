use clap::{Parser, ValueEnum};

/// Longest accepted cooldown.
const MAX_COOLDOWN_SECS: f32 = 86_400.0;

/// Risk-weight table to score signals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WeightProfile {
    /// DNS 0.01, HTTP GET 0.08, other HTTP 0.04, broadcast 0.005.
    Classic,
    /// DNS 0.05, HTTP GET 0.2, other HTTP 0.1, broadcast 0.03.
    Final,
}

/// netscan: passive LAN visibility from unencrypted metadata.
///
/// Listens for DNS lookups, plaintext HTTP and SSDP/mDNS announcements,
/// attributes each to the device that sent it, and keeps a running exposure
/// score per device.
#[derive(Parser, Debug, Clone)]
#[command(
    name    = "netscan",
    version = "0.2.0",
    about   = "Passive network visibility and exposure scoring",
    long_about = None,
)]
pub struct Cli {
    // ── Interface ────────────────────────────────────────────────────────────

    /// Network interface to capture on.
    ///
    /// If omitted, netscan selects the first non-loopback IPv4 interface
    /// automatically, falling back to libpcap's default device.
    #[arg(short = 'i', long = "interface", value_name = "IFACE")]
    pub interface: Option<String>,

    // ── Logging ──────────────────────────────────────────────────────────────

    /// Write log output to this file in addition to stdout.
    #[arg(short = 'o', long = "log-file", value_name = "PATH")]
    pub log_file: Option<String>,

    /// Emit events as newline-delimited JSON (NDJSON).
    #[arg(short = 'j', long = "json")]
    pub json: bool,

    // ── PCAP Replay ──────────────────────────────────────────────────────────

    /// Read packets from a saved PCAP file instead of a live interface.
    #[arg(short = 'r', long = "read", value_name = "FILE")]
    pub pcap_file: Option<String>,

    // ── Scoring ──────────────────────────────────────────────────────────────

    /// Base risk-weight table.
    #[arg(long = "profile", value_enum, default_value_t = WeightProfile::Final)]
    pub profile: WeightProfile,

    /// Override the DNS query weight.
    #[arg(long = "dns-weight", value_name = "W", value_parser = parse_weight)]
    pub dns_weight: Option<f32>,

    /// Override the HTTP GET weight.
    #[arg(long = "http-get-weight", value_name = "W", value_parser = parse_weight)]
    pub http_get_weight: Option<f32>,

    /// Override the weight of non-GET port-80 traffic.
    #[arg(long = "http-other-weight", value_name = "W", value_parser = parse_weight)]
    pub http_other_weight: Option<f32>,

    /// Override the SSDP/mDNS broadcast weight.
    #[arg(long = "broadcast-weight", value_name = "W", value_parser = parse_weight)]
    pub broadcast_weight: Option<f32>,

    // ── Deduplication ────────────────────────────────────────────────────────

    /// Seconds before an identical (device, activity) pair is accepted again.
    #[arg(long = "cooldown", value_name = "SECS", default_value_t = 2.0, value_parser = parse_secs)]
    pub cooldown: f32,

    /// Cooldown for SSDP/mDNS announcements, which repeat constantly.
    #[arg(long = "broadcast-cooldown", value_name = "SECS", default_value_t = 10.0, value_parser = parse_secs)]
    pub broadcast_cooldown: f32,

    /// How often (in seconds) stale dedup entries are swept.
    #[arg(long = "evict-interval", value_name = "SECS", default_value_t = 10)]
    pub evict_interval: u64,

    // ── Enrichment ───────────────────────────────────────────────────────────

    /// Disable geolocation and reverse-DNS lookups entirely.
    #[arg(long = "no-enrich")]
    pub no_enrich: bool,

    /// Geolocation endpoint; `{ip}` is replaced with the address.
    #[arg(long = "geo-endpoint", value_name = "URL")]
    pub geo_endpoint: Option<String>,

    /// Timeout for each external lookup, in milliseconds.
    #[arg(long = "lookup-timeout-ms", value_name = "MS", default_value_t = 2000)]
    pub lookup_timeout_ms: u64,
}

/// A finite risk weight in `[0, 1]`.
fn parse_weight(s: &str) -> Result<f32, String> {
    let w: f32 = s.parse().map_err(|e| format!("{}", e))?;
    if !w.is_finite() || !(0.0..=1.0).contains(&w) {
        return Err(format!("weight must be between 0 and 1, got {}", s));
    }
    Ok(w)
}

/// A finite, non-negative number of seconds no larger than a day.
fn parse_secs(s: &str) -> Result<f32, String> {
    let secs: f32 = s.parse().map_err(|e| format!("{}", e))?;
    if !secs.is_finite() || !(0.0..=MAX_COOLDOWN_SECS).contains(&secs) {
        return Err(format!("seconds must be between 0 and {}, got {}", MAX_COOLDOWN_SECS, s));
    }
    Ok(secs)
}
