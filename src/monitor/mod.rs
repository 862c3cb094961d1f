//! Capture worker: feeds packets from libpcap (live or file replay) into the
//! classification engine.
//!
//! One thread consumes the stream in arrival order. Frames are sliced with
//! `etherparse`; anything that does not decode is dropped silently and the
//! loop moves on. A capture-layer failure ends the worker, is reported once as
//! an error event, and returns control to `main` without panicking.

pub mod classifier;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod enrichment;
pub mod eviction;
pub mod ledger;
pub mod parsers;
pub mod risk;
pub mod types;

use crate::logger::Event;
use crate::monitor::classifier::PacketMeta;
use crate::monitor::config::CAPTURE_FILTER;
use crate::monitor::engine::Engine;
use crate::monitor::eviction::spawn_eviction_thread;
use crate::monitor::types::ShutdownFlag;

use etherparse::SlicedPacket;
use pcap::{Activated, Capture};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Linux "cooked" capture header length (`any` pseudo-device).
const SLL_HEADER_LEN: usize = 16;

/// Configuration bundle passed from `main` into the capture worker.
pub struct MonitorConfig {
    /// Shared pipeline state.
    pub engine:         Arc<Engine>,
    /// Set to `true` by the ctrlc handler; the loop exits on next iteration.
    pub shutdown:       ShutdownFlag,
    /// Path to a PCAP file for offline replay, or `None` for live capture.
    pub pcap_file:      Option<String>,
    /// Dedup eviction sweep interval in seconds.
    pub evict_interval: u64,
    /// Network interface for live capture. `None` lets libpcap choose.
    pub iface_name:     Option<String>,
}

/// How captured bytes map onto an IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Ethernet,
    RawIp,
    LinuxSll,
}

impl Framing {
    fn of<T: Activated + ?Sized>(cap: &Capture<T>) -> Self {
        match cap.get_datalink().0 {
            12 | 101 | 228 => Framing::RawIp,
            113            => Framing::LinuxSll,
            _              => Framing::Ethernet,
        }
    }

    fn slice(self, data: &[u8]) -> Option<SlicedPacket<'_>> {
        match self {
            Framing::Ethernet => SlicedPacket::from_ethernet(data).ok(),
            Framing::RawIp    => SlicedPacket::from_ip(data).ok(),
            Framing::LinuxSll => SlicedPacket::from_ip(data.get(SLL_HEADER_LEN..)?).ok(),
        }
    }
}

/// Entry point for the capture worker.
///
/// Spawns the dedup eviction thread, then runs either a live capture or a
/// PCAP file replay until EOF, shutdown, or a capture error.
///
/// # Returns
///
/// `Ok(())` on clean shutdown, or `Err(String)` describing why capture failed.
/// The error has already been reported to the event sink.
pub fn start_monitor(cfg: MonitorConfig) -> Result<(), String> {
    let eviction_handle = spawn_eviction_thread(
        Arc::clone(&cfg.engine),
        cfg.evict_interval,
        Arc::clone(&cfg.shutdown),
    );

    cfg.engine.sink().emit(&Event::Info {
        message: "Passive classification engine started",
    });

    let result = if let Some(ref path) = cfg.pcap_file {
        run_replay(path, &cfg)
    } else {
        run_live(&cfg)
    };

    if let Err(ref e) = result {
        cfg.engine.sink().emit(&Event::Error {
            message: &format!("ERROR: {}", e),
        });
    }

    // Scanning is over either way; stop the sweeper and any late enrichment.
    cfg.shutdown.store(true, Ordering::SeqCst);
    let _ = eviction_handle.join();
    result
}

// ── Live capture ──────────────────────────────────────────────────────────────

/// Opens a promiscuous live capture with the protocol filter applied.
///
/// The 200ms read timeout wakes the loop regularly so the shutdown flag is
/// checked between packets even on a silent network.
fn run_live(cfg: &MonitorConfig) -> Result<(), String> {
    let device = match cfg.iface_name {
        Some(ref name) => pcap::Device::from(name.as_str()),
        None => pcap::Device::lookup()
            .map_err(|e| format!("pcap device lookup failed: {}", e))?
            .ok_or_else(|| "No capture device found".to_string())?,
    };
    let device_name = device.name.clone();

    let mut cap = Capture::from_device(device)
        .map_err(|e| format!("Cannot open interface '{}': {}", device_name, e))?
        .promisc(true)
        .timeout(200)
        .open()
        .map_err(|e| format!("Cannot start capture on '{}': {}", device_name, e))?;

    cap.filter(CAPTURE_FILTER, true)
        .map_err(|e| format!("Cannot apply capture filter: {}", e))?;

    cfg.engine.sink().emit(&Event::Info {
        message: &format!("Listening on {} ({})", device_name, CAPTURE_FILTER),
    });

    let framing = Framing::of(&cap);
    while !cfg.shutdown.load(Ordering::Relaxed) {
        match cap.next_packet() {
            Ok(pkt) => process_raw(pkt.data, framing, &cfg.engine),
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => return Err(format!("Capture on '{}' failed: {}", device_name, e)),
        }
    }

    Ok(())
}

// ── PCAP file replay ──────────────────────────────────────────────────────────

/// Replays every packet of a saved capture through the same pipeline.
fn run_replay(path: &str, cfg: &MonitorConfig) -> Result<(), String> {
    cfg.engine.sink().emit(&Event::Info {
        message: "Replay mode: reading from PCAP file",
    });

    let mut cap = Capture::from_file(path)
        .map_err(|e| format!("Failed to open PCAP file '{}': {}", path, e))?;
    cap.filter(CAPTURE_FILTER, true)
        .map_err(|e| format!("Cannot apply capture filter: {}", e))?;

    let framing = Framing::of(&cap);
    while !cfg.shutdown.load(Ordering::Relaxed) {
        match cap.next_packet() {
            Ok(pkt) => process_raw(pkt.data, framing, &cfg.engine),
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(format!("Reading '{}' failed: {}", path, e)),
        }
    }

    Ok(())
}

// ── Shared packet processing pipeline ────────────────────────────────────────

/// Decodes one captured frame and hands it to the engine. Enrichment tasks
/// it spawns are detached.
fn process_raw(data: &[u8], framing: Framing, engine: &Arc<Engine>) {
    let Some(sliced) = framing.slice(data) else { return };
    let Some(meta) = PacketMeta::from_sliced(&sliced) else { return };
    engine.handle_packet(&meta, Instant::now());
}
