//! The shared pipeline behind the capture worker.
//!
//! The capture thread calls [`Engine::handle_packet`] in arrival order.
//! Enrichment work is fanned out to short-lived threads that hold an
//! `Arc<Engine>` and re-enter the same dedup → ledger path when they finish,
//! so every mutation of shared state goes through the locks owned here.
//!
//! Plaintext HTTP waiting on a reverse lookup is parked per destination. Only
//! the first packet for a destination spawns a resolver; later packets queue
//! behind it and that one task replays the queue in arrival order.

use crate::logger::{Event, Severity, SharedSink};
use crate::monitor::classifier::{classify, Classified, PacketMeta, PendingHttp};
use crate::monitor::config::EngineSettings;
use crate::monitor::dedup::Deduplicator;
use crate::monitor::enrichment::Enricher;
use crate::monitor::ledger::{Ledger, Recorded};
use crate::monitor::risk::{device_tag, global_risk, ThreatLevel};
use crate::monitor::types::{SharedStats, ShutdownFlag, Signal};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// HTTP observations waiting on one destination's hostname, oldest first.
type ParkedQueue = Vec<(PendingHttp, Instant)>;

pub struct Engine {
    settings:  EngineSettings,
    dedup:     Deduplicator,
    ledger:    Ledger,
    enricher:  Enricher,
    sink:      SharedSink,
    stats:     SharedStats,
    shutdown:  ShutdownFlag,
    /// Last global risk reported to the sink.
    last_risk: Mutex<f32>,
    parked:    Mutex<HashMap<String, ParkedQueue>>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        enricher: Enricher,
        sink:     SharedSink,
        stats:    SharedStats,
        shutdown: ShutdownFlag,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            dedup: Deduplicator::new(),
            ledger: Ledger::new(),
            enricher,
            sink,
            stats,
            shutdown,
            last_risk: Mutex::new(0.0),
            parked: Mutex::new(HashMap::new()),
        })
    }

    /// Classifies one packet and routes the result.
    ///
    /// Returns handles of any enrichment tasks spawned; the capture loop drops
    /// them (fire-and-forget) while tests join them.
    pub fn handle_packet(self: &Arc<Self>, pkt: &PacketMeta, now: Instant) -> Vec<JoinHandle<()>> {
        self.stats.packets_total.fetch_add(1, Ordering::Relaxed);

        let mut tasks = Vec::new();
        // A destination with parked packets stays parked until its queue is
        // drained, even once the hostname is cached.
        let classified = classify(pkt, &self.settings.weights, |addr| {
            if self.is_parked(addr) { None } else { self.enricher.cached_hostname(addr) }
        });
        let Some(classified) = classified else { return tasks };

        if classified.kind().locates_destination() {
            tasks.extend(self.geolocate(classified.destination()));
        }

        match classified {
            Classified::Ready(signal) => {
                self.ingest(signal, now);
            }
            Classified::AwaitingHostname(pending) => {
                tasks.extend(self.park(pending, now));
            }
            Classified::ExternalFlow { .. } => {}
        }

        tasks
    }

    /// Runs one signal through the deduplicator and, if accepted, the ledger.
    pub fn ingest(&self, signal: Signal, now: Instant) -> Option<Recorded> {
        if self.shutdown.load(Ordering::Relaxed) {
            return None;
        }

        let cooldown = if signal.kind.uses_broadcast_cooldown() {
            self.settings.broadcast_cooldown
        } else {
            self.settings.cooldown
        };
        if !self.dedup.should_accept(&signal.source, &signal.activity, cooldown, now) {
            self.stats.signals_suppressed.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        self.stats.signals_accepted.fetch_add(1, Ordering::Relaxed);

        self.sink.emit(&Event::Activity {
            severity: Severity::of_message(&signal.message),
            src:      &signal.source,
            message:  &signal.message,
        });

        let recorded = self.ledger.record(
            &signal.source,
            &signal.activity,
            signal.weight,
            signal.name.as_deref(),
        );

        if recorded.created {
            self.stats.devices_seen.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(snapshot) = &recorded.snapshot {
            self.sink.emit(&Event::DeviceUpdate {
                device: snapshot,
                tag:    device_tag(snapshot.risk),
            });
        }
        if recorded.change.new_activity {
            self.refresh_threat_level();
        }

        Some(recorded)
    }

    /// Issues a geolocation lookup for `addr` unless one is pointless or
    /// already done / in flight.
    pub fn geolocate(self: &Arc<Self>, addr: &str) -> Option<JoinHandle<()>> {
        if !self.enricher.claim(addr) {
            return None;
        }

        let engine = Arc::clone(self);
        let target = addr.to_string();
        let spawned = thread::Builder::new()
            .name("netscan-geo".to_string())
            .spawn(move || {
                let Some(marker) = engine.enricher.complete_lookup(&target, &engine.shutdown) else {
                    if !engine.shutdown.load(Ordering::Relaxed) {
                        engine.stats.lookups_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    return;
                };
                engine.stats.locations_resolved.fetch_add(1, Ordering::Relaxed);
                engine.sink.emit(&Event::MapMarker {
                    address: &marker.address,
                    city:    &marker.point.city,
                    lat:     marker.point.lat,
                    lon:     marker.point.lon,
                    count:   marker.count,
                    label:   &marker.label,
                });
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(_) => {
                // Not looked up, not failed: a later packet may retry.
                self.enricher.release(addr);
                None
            }
        }
    }

    fn is_parked(&self, destination: &str) -> bool {
        self.parked
            .lock()
            .map(|p| p.contains_key(destination))
            .unwrap_or(false)
    }

    /// Queues an HTTP observation behind its destination's reverse lookup,
    /// spawning the resolver if this is the first one.
    fn park(self: &Arc<Self>, pending: PendingHttp, now: Instant) -> Option<JoinHandle<()>> {
        let destination = pending.destination.clone();
        {
            let Ok(mut parked) = self.parked.lock() else { return None };
            if let Some(queue) = parked.get_mut(&destination) {
                // An identical observation is already queued; it would be
                // dropped by the cooldown on replay anyway.
                if queue.iter().any(|(p, _)| *p == pending) {
                    self.stats.signals_suppressed.fetch_add(1, Ordering::Relaxed);
                } else {
                    queue.push((pending, now));
                }
                return None;
            }
            parked.insert(destination.clone(), vec![(pending, now)]);
        }

        let engine = Arc::clone(self);
        let target = destination.clone();
        let spawned = thread::Builder::new()
            .name("netscan-rdns".to_string())
            .spawn(move || engine.drain_parked(&target));

        match spawned {
            Ok(handle) => Some(handle),
            Err(_) => {
                // No resolver: score the queue under the bare address.
                self.replay_parked(&destination, &destination);
                None
            }
        }
    }

    /// Resolver task body: one (memoized) reverse lookup, then replay.
    fn drain_parked(&self, destination: &str) {
        let hostname = self.enricher.resolve_hostname(destination);
        self.replay_parked(destination, &hostname);
    }

    /// Ingests everything parked on `destination` in arrival order. Packets
    /// parked while replaying are picked up before the entry is removed.
    fn replay_parked(&self, destination: &str, hostname: &str) {
        loop {
            let batch = {
                let Ok(mut parked) = self.parked.lock() else { return };
                match parked.get_mut(destination) {
                    Some(queue) if !queue.is_empty() => std::mem::take(queue),
                    _ => {
                        parked.remove(destination);
                        return;
                    }
                }
            };

            for (pending, seen_at) in batch {
                let signal = pending.into_signal(hostname, &self.settings.weights);
                self.ingest(signal, seen_at);
            }
        }
    }

    /// Re-derives the global risk and reports it when it moved.
    ///
    /// The risk is read under the `last_risk` lock, so reports are ordered
    /// and the last one always matches the ledger.
    fn refresh_threat_level(&self) {
        let Ok(mut last) = self.last_risk.lock() else { return };
        let risk = global_risk(&self.ledger);
        if risk == *last {
            return;
        }
        *last = risk;
        self.sink.emit(&Event::ThreatLevel {
            risk,
            level: ThreatLevel::from_risk(risk, &self.settings.bands),
        });
    }

    pub fn global_risk(&self) -> f32 {
        global_risk(&self.ledger)
    }

    pub fn threat_level(&self) -> ThreatLevel {
        ThreatLevel::from_risk(self.global_risk(), &self.settings.bands)
    }

    /// Forgets every device and dedup entry. Enrichment caches survive: they
    /// describe destinations, not the session's devices.
    pub fn reset(&self) {
        let Ok(mut last) = self.last_risk.lock() else { return };
        self.ledger.clear();
        self.dedup.clear();
        *last = 0.0;
        self.sink.emit(&Event::Info { message: "SYSTEM: SESSION RESET" });
        self.sink.emit(&Event::ThreatLevel { risk: 0.0, level: ThreatLevel::Nominal });
    }

    /// Sweeps dedup entries that can no longer suppress anything.
    pub fn evict_stale(&self, now: Instant) -> usize {
        self.dedup.evict_older_than(self.settings.max_cooldown(), now)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[cfg(test)]
    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    pub fn stats(&self) -> &SharedStats {
        &self.stats
    }

    #[cfg(test)]
    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::tests::MemorySink;
    use crate::monitor::classifier::Transport;
    use crate::monitor::enrichment::tests::{FakeDns, FakeGeo};
    use crate::monitor::parsers::tests::dns_query;
    use crate::monitor::types::{SessionStats, SignalKind};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    struct Harness {
        engine:    Arc<Engine>,
        sink:      Arc<MemorySink>,
        geo_calls: Arc<AtomicUsize>,
        dns_calls: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        harness_with_dns_delay(Duration::ZERO)
    }

    fn harness_with_dns_delay(dns_delay: Duration) -> Harness {
        let geo_calls = Arc::new(AtomicUsize::new(0));
        let dns_calls = Arc::new(AtomicUsize::new(0));
        let enricher  = Enricher::new(
            Box::new(FakeGeo { calls: Arc::clone(&geo_calls), city: "Paris", delay: Duration::from_millis(5) }),
            Box::new(FakeDns { calls: Arc::clone(&dns_calls), delay: dns_delay }),
        );
        let sink = Arc::new(MemorySink::default());
        let engine = Engine::new(
            EngineSettings::default(),
            enricher,
            sink.clone(),
            SessionStats::new(),
            Arc::new(AtomicBool::new(false)),
        );
        Harness { engine, sink, geo_calls, dns_calls }
    }

    fn signal(src: &str, activity: &str, weight: f32) -> Signal {
        Signal {
            source:      src.to_string(),
            destination: "8.8.8.8".to_string(),
            kind:        SignalKind::DnsQuery,
            activity:    activity.to_string(),
            weight,
            name:        None,
            message:     format!("RESOLVED: {} -> x", src),
        }
    }

    fn join(tasks: Vec<JoinHandle<()>>) {
        for t in tasks { t.join().unwrap(); }
    }

    fn http_packet<'a>(src: &str, payload: &'a [u8]) -> PacketMeta<'a> {
        PacketMeta {
            src:       src.into(),
            dst:       "93.184.216.34".into(),
            transport: Transport::Tcp { src_port: 50123, dst_port: 80 },
            payload,
        }
    }

    #[test]
    fn repeated_http_to_uncached_destination_resolves_once() {
        let h = harness_with_dns_delay(Duration::from_millis(200));
        let now = Instant::now();

        // Bare ACKs of one download: empty payload, same destination.
        let mut tasks = Vec::new();
        for _ in 0..200 {
            tasks.extend(h.engine.handle_packet(&http_packet("192.168.1.20", b""), now));
        }
        // One geolocation and one resolver.
        assert_eq!(tasks.len(), 2);
        join(tasks);

        assert_eq!(h.dns_calls.load(Ordering::SeqCst), 1);
        let dev = h.engine.ledger().get("192.168.1.20").unwrap();
        assert_eq!(dev.activities, vec!["Unsecured Traffic: example.com"]);
        assert_eq!(h.sink.of_kind("activity").len(), 1);

        let stats = h.engine.stats();
        assert_eq!(stats.signals_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.signals_suppressed.load(Ordering::Relaxed), 199);
        assert!(!h.engine.is_parked("93.184.216.34"));
    }

    #[test]
    fn parked_http_replays_in_arrival_order() {
        let h = harness_with_dns_delay(Duration::from_millis(100));
        let t0 = Instant::now();

        let mut tasks = Vec::new();
        for (i, src) in ["192.168.1.20", "192.168.1.21", "192.168.1.22"].iter().enumerate() {
            let at = t0 + Duration::from_millis(i as u64);
            tasks.extend(h.engine.handle_packet(&http_packet(src, b"GET /a HTTP/1.1\r\n\r\n"), at));
        }
        tasks.extend(h.engine.handle_packet(&http_packet("192.168.1.20", b"POST /b HTTP/1.1\r\n\r\n"), t0));
        join(tasks);

        let sources: Vec<String> = h.sink.of_kind("activity")
            .iter()
            .map(|e| e["src"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(sources, vec!["192.168.1.20", "192.168.1.21", "192.168.1.22", "192.168.1.20"]);
        assert_eq!(
            h.engine.ledger().get("192.168.1.20").unwrap().activities,
            vec!["Browsing Website: Unsecured (example.com)", "Unsecured Traffic: example.com"],
        );
        assert_eq!(h.dns_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn capture_thread_dedups_against_replayed_http() {
        let h = harness_with_dns_delay(Duration::from_millis(20));
        let t0 = Instant::now();
        join(h.engine.handle_packet(&http_packet("192.168.1.20", b""), t0));

        // Hostname now cached: handled inline, inside the cooldown of the replayed one.
        let tasks = h.engine.handle_packet(&http_packet("192.168.1.20", b""), t0 + Duration::from_secs(1));
        assert!(tasks.is_empty());
        assert_eq!(h.sink.of_kind("activity").len(), 1);

        h.engine.handle_packet(&http_packet("192.168.1.20", b""), t0 + Duration::from_secs(3));
        assert_eq!(h.sink.of_kind("activity").len(), 2);
    }

    #[test]
    fn concurrent_ingest_reports_current_threat_level_last() {
        for round in 0..50 {
            let h = harness();
            let barrier = Arc::new(std::sync::Barrier::new(8));
            let now = Instant::now();

            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let (engine, barrier) = (Arc::clone(&h.engine), Arc::clone(&barrier));
                    thread::spawn(move || {
                        barrier.wait();
                        for i in 0..20 {
                            let src = format!("10.{}.{}.{}", round, t, i);
                            let weight = (t * 20 + i) as f32 * 0.005;
                            engine.ingest(signal(&src, "Browsing a.com", weight), now);
                        }
                    })
                })
                .collect();
            for handle in handles { handle.join().unwrap(); }

            let risks: Vec<f64> = h.sink.of_kind("threat_level")
                .iter()
                .map(|e| e["risk"].as_f64().unwrap())
                .collect();
            assert!(risks.windows(2).all(|w| w[0] < w[1]), "threat level went backwards: {:?}", risks);
            assert_eq!(*risks.last().unwrap(), h.engine.global_risk() as f64);
        }
    }

    #[test]
    fn duplicate_within_cooldown_updates_once() {
        let h = harness();
        let t0 = Instant::now();
        assert!(h.engine.ingest(signal("192.168.1.4", "Browsing a.com", 0.05), t0).is_some());
        assert!(h.engine.ingest(signal("192.168.1.4", "Browsing a.com", 0.05), t0 + Duration::from_secs(1)).is_none());

        let dev = h.engine.ledger().get("192.168.1.4").unwrap();
        assert_eq!(dev.activities.len(), 1);
        assert_eq!(h.sink.of_kind("activity").len(), 1);
        assert_eq!(h.engine.stats().signals_suppressed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn repeat_after_cooldown_is_logged_but_not_rescored() {
        let h = harness();
        let t0 = Instant::now();
        h.engine.ingest(signal("192.168.1.4", "Browsing a.com", 0.05), t0);
        let r = h.engine
            .ingest(signal("192.168.1.4", "Browsing a.com", 0.05), t0 + Duration::from_secs(3))
            .unwrap();

        assert!(!r.is_update());
        assert!((r.risk - 0.05).abs() < 1e-6);
        assert_eq!(h.engine.ledger().get("192.168.1.4").unwrap().activities.len(), 1);
        assert_eq!(h.sink.of_kind("activity").len(), 2);
        assert_eq!(h.sink.of_kind("device_update").len(), 1);
    }

    #[test]
    fn different_activity_is_not_blocked() {
        let h = harness();
        let t0 = Instant::now();
        h.engine.ingest(signal("192.168.1.4", "Browsing a.com", 0.05), t0);
        let r = h.engine.ingest(signal("192.168.1.4", "Browsing b.com", 0.05), t0).unwrap();
        assert_eq!(r.snapshot.unwrap().activities, vec!["Browsing a.com", "Browsing b.com"]);
    }

    #[test]
    fn threat_level_tracks_max_and_resets() {
        let h = harness();
        let t0 = Instant::now();
        h.engine.ingest(signal("192.168.1.4", "a", 0.05), t0);
        assert_eq!(h.engine.threat_level(), ThreatLevel::Nominal);

        h.engine.ingest(signal("192.168.1.9", "b", 0.5), t0);
        assert!((h.engine.global_risk() - 0.5).abs() < 1e-6);
        assert_eq!(h.engine.threat_level(), ThreatLevel::Caution);

        let levels = h.sink.of_kind("threat_level");
        assert_eq!(levels.last().unwrap()["level"], "CAUTION");

        h.engine.reset();
        assert_eq!(h.engine.global_risk(), 0.0);
        assert!(h.engine.ledger().is_empty());
        assert_eq!(h.engine.dedup().len(), 0);
    }

    #[test]
    fn dns_packet_flows_through_to_ledger_and_map() {
        let h = harness();
        let payload = dns_query("mail.example.com.", false);
        let pkt = PacketMeta {
            src:       "192.168.1.20".into(),
            dst:       "8.8.8.8".into(),
            transport: Transport::Udp { src_port: 53111, dst_port: 53 },
            payload:   &payload,
        };
        join(h.engine.handle_packet(&pkt, Instant::now()));

        let dev = h.engine.ledger().get("192.168.1.20").unwrap();
        assert_eq!(dev.name.as_deref(), Some("Example"));
        assert_eq!(dev.activities, vec!["Browsing mail.example.com"]);

        let markers = h.sink.of_kind("map_marker");
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0]["label"], "Paris (8.8.8.8)");
        assert_eq!(h.geo_calls.load(Ordering::SeqCst), 1);

        let activity = &h.sink.of_kind("activity")[0];
        assert_eq!(activity["severity"], "warning");
        assert_eq!(activity["src"], "192.168.1.20");
    }

    #[test]
    fn http_waits_for_hostname_then_scores() {
        let h = harness();
        let payload = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let pkt = PacketMeta {
            src:       "192.168.1.20".into(),
            dst:       "93.184.216.34".into(),
            transport: Transport::Tcp { src_port: 50123, dst_port: 80 },
            payload,
        };
        join(h.engine.handle_packet(&pkt, Instant::now()));

        let dev = h.engine.ledger().get("192.168.1.20").unwrap();
        assert_eq!(dev.activities, vec!["Browsing Website: Unsecured (example.com)"]);
        assert!((dev.risk - EngineSettings::default().weights.http_get).abs() < 1e-6);
        assert_eq!(h.sink.of_kind("activity")[0]["severity"], "danger");

        // Second packet hits the hostname cache and never leaves the capture thread.
        let tasks = h.engine.handle_packet(&pkt, Instant::now());
        assert!(tasks.is_empty());
        assert_eq!(h.dns_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn broadcasts_are_not_geolocated() {
        let h = harness();
        let payload = b"NOTIFY * HTTP/1.1\r\nSERVER: Roku/9.0\r\n\r\n";
        let pkt = PacketMeta {
            src:       "192.168.1.50".into(),
            dst:       "239.255.255.250".into(),
            transport: Transport::Udp { src_port: 1900, dst_port: 1900 },
            payload,
        };
        let tasks = h.engine.handle_packet(&pkt, Instant::now());
        assert!(tasks.is_empty());
        assert_eq!(h.engine.ledger().get("192.168.1.50").unwrap().name.as_deref(), Some("Node: Roku (SSDP)"));
    }

    #[test]
    fn broadcast_uses_long_cooldown() {
        let h = harness();
        let t0 = Instant::now();
        let mut s = signal("192.168.1.50", "SSDP Identity Leak", 0.03);
        s.kind = SignalKind::ServiceBroadcast;
        assert!(h.engine.ingest(s.clone(), t0).is_some());
        assert!(h.engine.ingest(s.clone(), t0 + Duration::from_secs(5)).is_none());
        assert!(h.engine.ingest(s, t0 + Duration::from_secs(11)).is_some());
    }

    #[test]
    fn nothing_is_recorded_after_shutdown() {
        let h = harness();
        h.engine.shutdown_flag().store(true, Ordering::SeqCst);
        assert!(h.engine.ingest(signal("192.168.1.4", "a", 0.1), Instant::now()).is_none());
        assert!(h.engine.ledger().is_empty());
    }

    #[test]
    fn eviction_uses_longest_cooldown() {
        let h = harness();
        let t0 = Instant::now();
        h.engine.ingest(signal("192.168.1.4", "a", 0.1), t0);
        assert_eq!(h.engine.evict_stale(t0 + Duration::from_secs(5)), 0);
        assert_eq!(h.engine.evict_stale(t0 + Duration::from_secs(11)), 1);
    }
}
