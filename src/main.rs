mod cli;
mod logger;
mod monitor;

use clap::Parser;
use cli::{Cli, WeightProfile};
use get_if_addrs::{get_if_addrs, IfAddr};
use logger::{Event, Logger, SharedSink};
use monitor::config::{EngineSettings, RiskWeights};
use monitor::engine::Engine;
use monitor::enrichment::{Enricher, IpApi, SystemResolver};
use monitor::risk::{activity_tag, device_tag};
use monitor::types::{SessionStats, ShutdownFlag};
use monitor::{start_monitor, MonitorConfig};
use std::io::{self, BufRead, IsTerminal};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize shutdown flag for graceful termination
    let shutdown: ShutdownFlag = Arc::new(AtomicBool::new(false));
    let session_start = Instant::now();

    let logger = match Logger::new(cli.json, cli.log_file.as_deref()) {
        Ok(l)  => Arc::new(l),
        Err(e) => {
            eprintln!("cannot open log file: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let sink: SharedSink = logger.clone();

    let settings = build_settings(&cli);
    let enricher = build_enricher(&settings, &logger);
    let stats    = SessionStats::new();

    let engine = Engine::new(
        settings,
        enricher,
        Arc::clone(&sink),
        Arc::clone(&stats),
        Arc::clone(&shutdown),
    );

    if let Err(e) = register_shutdown_handler(Arc::clone(&shutdown)) {
        logger.log(&Event::Error { message: &format!("ERROR: {}", e) });
        return ExitCode::FAILURE;
    }

    // ── Interface selection ───────────────────────────────────────────────────
    let iface_name = if cli.pcap_file.is_some() {
        None
    } else {
        select_interface(cli.interface.as_deref(), &logger)
    };

    let cfg = MonitorConfig {
        engine:         Arc::clone(&engine),
        shutdown:       Arc::clone(&shutdown),
        pcap_file:      cli.pcap_file.clone(),
        evict_interval: cli.evict_interval,
        iface_name,
    };

    if cli.pcap_file.is_none() && io::stdin().is_terminal() {
        spawn_console(Arc::clone(&engine), Arc::clone(&shutdown));
    }

    // Capture errors were already reported as an error event.
    let result = start_monitor(cfg);

    print_summary(&logger, &engine, session_start);
    if result.is_ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Registers a signal handler for graceful shutdown on Ctrl+C
fn register_shutdown_handler(shutdown: ShutdownFlag) -> Result<(), String> {
    ctrlc::set_handler(move || {
        println!("\n[!] Ctrl+C received, shutting down...");
        shutdown.store(true, Ordering::SeqCst);
    })
    .map_err(|e| format!("Failed to register Ctrl+C handler: {}", e))
}

/// Reads operator commands from stdin: `reset` clears the session, `quit`
/// stops the capture. The thread is detached; it dies with the process.
fn spawn_console(engine: Arc<Engine>, shutdown: ShutdownFlag) {
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "reset"       => engine.reset(),
                "quit" | "q"  => {
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ => {}
            }
        }
    });
}

/// Picks the capture interface: the one requested on the command line, else
/// the first non-loopback IPv4 interface. `None` defers to libpcap.
fn select_interface(wanted: Option<&str>, logger: &Logger) -> Option<String> {
    let ifaces = match get_if_addrs() {
        Ok(i)  => i,
        Err(e) => {
            logger.log(&Event::Info {
                message: &format!("Interface enumeration failed ({}); using libpcap default", e),
            });
            return wanted.map(str::to_string);
        }
    };

    for iface in &ifaces {
        if let Some(name) = wanted {
            if iface.name != name { continue; }
        }
        if let IfAddr::V4(v4) = &iface.addr {
            if v4.ip.is_loopback() || v4.ip.is_link_local() { continue; }
            logger.log(&Event::Info {
                message: &format!("Interface: {} ({})", iface.name, v4.ip),
            });
            return Some(iface.name.clone());
        }
    }

    wanted.map(str::to_string)
}

/// Resolves the scoring and enrichment settings from command-line arguments.
fn build_settings(cli: &Cli) -> EngineSettings {
    let base = match cli.profile {
        WeightProfile::Classic => RiskWeights::CLASSIC,
        WeightProfile::Final   => RiskWeights::FINAL,
    };
    // Overrides and cooldowns are range-checked by the argument parser.
    let weights = RiskWeights {
        dns:        cli.dns_weight.unwrap_or(base.dns),
        http_get:   cli.http_get_weight.unwrap_or(base.http_get),
        http_other: cli.http_other_weight.unwrap_or(base.http_other),
        broadcast:  cli.broadcast_weight.unwrap_or(base.broadcast),
    };

    let defaults = EngineSettings::default();
    EngineSettings {
        weights,
        cooldown:           Duration::from_secs_f32(cli.cooldown),
        broadcast_cooldown: Duration::from_secs_f32(cli.broadcast_cooldown),
        lookup_timeout:     Duration::from_millis(cli.lookup_timeout_ms),
        geo_endpoint:       cli.geo_endpoint.clone().unwrap_or(defaults.geo_endpoint.clone()),
        enrich:             !cli.no_enrich,
        ..defaults
    }
}

/// Builds the lookup backends, degrading to no enrichment if the HTTP client
/// cannot be created.
fn build_enricher(settings: &EngineSettings, logger: &Logger) -> Enricher {
    if !settings.enrich {
        logger.log(&Event::Info { message: "Enrichment disabled" });
        return Enricher::disabled();
    }
    match IpApi::new(&settings.geo_endpoint, settings.lookup_timeout) {
        Ok(geo) => Enricher::new(
            Box::new(geo),
            Box::new(SystemResolver::new(settings.lookup_timeout)),
        ),
        Err(e) => {
            logger.log(&Event::Info {
                message: &format!("Geolocation unavailable ({}); enrichment disabled", e),
            });
            Enricher::disabled()
        }
    }
}

/// Prints the final device table and session summary statistics.
fn print_summary(logger: &Logger, engine: &Engine, session_start: Instant) {
    for device in engine.ledger().snapshots() {
        logger.log(&Event::DeviceUpdate { device: &device, tag: device_tag(device.risk) });
        for activity in &device.activities {
            logger.log(&Event::Info {
                message: &format!("  [{}] {}", activity_tag(activity).tag(), activity),
            });
        }
    }

    let stats = engine.stats();
    logger.log(&Event::Info {
        message: &format!(
            "Final threat level: {} ({:.2})",
            engine.threat_level(),
            engine.global_risk()
        ),
    });
    logger.log(&Event::SessionSummary {
        duration_secs:      session_start.elapsed().as_secs(),
        packets_total:      stats.packets_total.load(Ordering::Relaxed),
        signals_accepted:   stats.signals_accepted.load(Ordering::Relaxed),
        signals_suppressed: stats.signals_suppressed.load(Ordering::Relaxed),
        devices_seen:       stats.devices_seen.load(Ordering::Relaxed),
        locations_resolved: stats.locations_resolved.load(Ordering::Relaxed),
        lookups_failed:     stats.lookups_failed.load(Ordering::Relaxed),
    });
}
