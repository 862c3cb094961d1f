//! Structured event output for netscan.
//!
//! Provides a [`Logger`] that writes events to stdout and optionally to a log
//! file. Output can be formatted as human-readable plain text or as
//! newline-delimited JSON (NDJSON), making it easy to feed a dashboard or a
//! log shipper.
//!
//! The engine never talks to `Logger` directly; it emits through the
//! [`EventSink`] trait so the presentation layer can be swapped out.

use crate::monitor::risk::ThreatLevel;
use crate::monitor::types::DeviceSnapshot;
use chrono::Local;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex};

// ── Severity ─────────────────────────────────────────────────────────────────

/// Presentation category of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Danger,
    Warning,
    Safe,
    Info,
}

impl Severity {
    /// Derives the category from what the message talks about.
    pub fn of_message(message: &str) -> Self {
        if ["UNSECURED", "CRITICAL", "ERROR"].iter().any(|k| message.contains(k)) {
            Severity::Danger
        } else if (message.contains("DNS") && !message.contains("mDNS")) || message.contains("RESOLVED") {
            Severity::Warning
        } else if ["IDENTITY", "BROADCAST", "mDNS"].iter().any(|k| message.contains(k)) {
            Severity::Safe
        } else {
            Severity::Info
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Severity::Danger  => "DANGER",
            Severity::Warning => "WARNING",
            Severity::Safe    => "SAFE",
            Severity::Info    => "INFO",
        }
    }
}

// ── Event types ──────────────────────────────────────────────────────────────

/// All distinct event kinds that netscan can emit.
///
/// The `#[serde(tag = "event")]` attribute ensures JSON output includes an
/// `"event"` key so consumers can filter by type without inspecting structure.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    /// Informational startup / status message.
    Info { message: &'a str },

    /// One accepted signal, as a log line attributed to `src`.
    Activity {
        severity: Severity,
        src:      &'a str,
        message:  &'a str,
    },

    /// A device's ledger entry changed.
    DeviceUpdate {
        device: &'a DeviceSnapshot,
        tag:    Severity,
    },

    /// A destination address was geolocated.
    MapMarker {
        address: &'a str,
        city:    &'a str,
        lat:     f64,
        lon:     f64,
        count:   u32,
        label:   &'a str,
    },

    /// The global threat level moved.
    ThreatLevel { risk: f32, level: ThreatLevel },

    /// Capture failed; scanning is no longer active.
    Error { message: &'a str },

    /// Session summary emitted on graceful shutdown.
    SessionSummary {
        duration_secs:      u64,
        packets_total:      u64,
        signals_accepted:   u64,
        signals_suppressed: u64,
        devices_seen:       u64,
        locations_resolved: u64,
        lookups_failed:     u64,
    },
}

/// Consumer of engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

pub type SharedSink = Arc<dyn EventSink>;

// ── Logger ───────────────────────────────────────────────────────────────────

/// Shared, thread-safe structured logger.
///
/// Constructed once in `main` and handed to the engine as a [`SharedSink`].
/// The internal `Mutex` serialises file writes so output lines are never
/// interleaved across the capture thread and enrichment threads.
pub struct Logger {
    /// Whether to format events as NDJSON instead of plain text.
    json: bool,
    /// Optional buffered file writer. `None` when `--log-file` was not given.
    file: Option<Mutex<BufWriter<std::fs::File>>>,
}

impl Logger {
    /// Creates a new logger.
    ///
    /// # Errors
    /// Returns an `io::Error` if the log file cannot be opened or created.
    pub fn new(json: bool, log_path: Option<&str>) -> io::Result<Self> {
        let file = match log_path {
            Some(path) => {
                let f = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                Some(Mutex::new(BufWriter::new(f)))
            }
            None => None,
        };

        Ok(Self { json, file })
    }

    /// Logs a single [`Event`], writing to stdout and optionally to the log file.
    pub fn log(&self, event: &Event) {
        let timestamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
        let line = self.render(event, &timestamp);

        println!("{}", line);

        if let Some(mutex) = &self.file {
            if let Ok(mut writer) = mutex.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }

    /// Formats one event as a full output line.
    fn render(&self, event: &Event, timestamp: &str) -> String {
        if self.json {
            let mut val = serde_json::to_value(event).unwrap_or_default();
            if let Some(obj) = val.as_object_mut() {
                obj.insert(
                    "timestamp".to_string(),
                    serde_json::Value::String(timestamp.to_string()),
                );
            }
            serde_json::to_string(&val).unwrap_or_default()
        } else {
            format!("[{}] {}", timestamp, plain_text(event))
        }
    }
}

impl EventSink for Logger {
    fn emit(&self, event: &Event) {
        self.log(event);
    }
}

/// Formats an [`Event`] as a human-readable string (no timestamp).
fn plain_text(event: &Event) -> String {
    match event {
        Event::Info { message } =>
            format!("[INFO] {}", message),

        Event::Activity { severity, message, .. } =>
            format!("[{}] {}", severity.tag(), message),

        Event::DeviceUpdate { device, .. } => format!(
            "[DEVICE] {} | {} | risk {}% | {} activities",
            device.address,
            device.name.as_deref().unwrap_or("RECON..."),
            (device.risk * 100.0) as u32,
            device.activities.len(),
        ),

        Event::MapMarker { label, lat, lon, .. } =>
            format!("[MAP] {} @ {:.4},{:.4}", label, lat, lon),

        Event::ThreatLevel { risk, level } =>
            format!("[THREAT] THREAT LEVEL: {} ({:.2})", level, risk),

        Event::Error { message } =>
            format!("[ERROR] {}", message),

        Event::SessionSummary {
            duration_secs, packets_total, signals_accepted,
            signals_suppressed, devices_seen, locations_resolved, lookups_failed,
        } => format!(
            "[SUMMARY] duration={}s packets={} signals={} suppressed={} devices={} located={} failed={}",
            duration_secs, packets_total, signals_accepted,
            signals_suppressed, devices_seen, locations_resolved, lookups_failed,
        ),
    }
}
