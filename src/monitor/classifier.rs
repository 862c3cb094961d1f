//! Protocol classifier.
//!
//! Turns one decoded packet into at most one observation. Rules are tried in
//! a fixed order (DNS query, plaintext HTTP, service broadcast, external flow)
//! and the first match wins. The classifier never blocks: HTTP observations
//! whose destination hostname is not cached yet are returned as
//! [`Classified::AwaitingHostname`] for an enrichment task to finish.

use crate::monitor::config::{RiskWeights, DNS_PORT, HTTP_PORT, MDNS_PORT, PRIVATE_PREFIXES, SSDP_PORT};
use crate::monitor::parsers::{decode_text, header_value, parse_dns, request_line};
use crate::monitor::types::{Signal, SignalKind};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};

/// Transport header fields the classifier looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
}

/// Decoded IPv4 packet, independent of how it was captured.
#[derive(Debug, Clone)]
pub struct PacketMeta<'a> {
    pub src:       String,
    pub dst:       String,
    pub transport: Transport,
    pub payload:   &'a [u8],
}

impl<'a> PacketMeta<'a> {
    /// Extracts addresses, ports and payload from a sliced frame.
    /// Non-IPv4 and non-TCP/UDP packets yield `None`.
    pub fn from_sliced(sliced: &SlicedPacket<'a>) -> Option<Self> {
        let (src, dst) = match &sliced.ip {
            Some(InternetSlice::Ipv4(h, _)) => (
                h.source_addr().to_string(),
                h.destination_addr().to_string(),
            ),
            _ => return None,
        };

        let transport = match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => Transport::Tcp {
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
            },
            Some(TransportSlice::Udp(udp)) => Transport::Udp {
                src_port: udp.source_port(),
                dst_port: udp.destination_port(),
            },
            _ => return None,
        };

        Some(Self { src, dst, transport, payload: sliced.payload })
    }
}

/// Outcome of classifying one packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    /// A complete signal, ready for the deduplicator.
    Ready(Signal),
    /// Plaintext HTTP whose destination still needs a reverse lookup.
    AwaitingHostname(PendingHttp),
    /// Traffic to an external address that only feeds the map.
    ExternalFlow { destination: String },
}

impl Classified {
    pub fn kind(&self) -> SignalKind {
        match self {
            Classified::Ready(signal)       => signal.kind,
            Classified::AwaitingHostname(_) => SignalKind::PlaintextHttp,
            Classified::ExternalFlow { .. } => SignalKind::GenericExternalFlow,
        }
    }

    pub fn destination(&self) -> &str {
        match self {
            Classified::Ready(signal)                => &signal.destination,
            Classified::AwaitingHostname(pending)    => &pending.destination,
            Classified::ExternalFlow { destination } => destination,
        }
    }
}

/// A port-80 observation missing only the destination hostname.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingHttp {
    pub source:       String,
    pub destination:  String,
    /// Request line when the payload was a `GET`, `None` for any other data.
    pub request_line: Option<String>,
}

impl PendingHttp {
    /// Completes the observation once `hostname` is known.
    pub fn into_signal(self, hostname: &str, weights: &RiskWeights) -> Signal {
        let (activity, weight, message) = match &self.request_line {
            Some(line) => (
                format!("Browsing Website: Unsecured ({})", hostname),
                weights.http_get,
                format!("UNSECURED ACTIVITY: {} -> {}", self.source, line),
            ),
            None => (
                format!("Unsecured Traffic: {}", hostname),
                weights.http_other,
                format!("UNSECURED DATA: {} -> {}", self.source, hostname),
            ),
        };

        Signal {
            source:      self.source,
            destination: self.destination,
            kind:        SignalKind::PlaintextHttp,
            activity,
            weight,
            name:        None,
            message,
        }
    }
}

/// Prefix test for local addresses. See [`PRIVATE_PREFIXES`] for its limits.
pub fn is_external(addr: &str) -> bool {
    !PRIVATE_PREFIXES.iter().any(|p| addr.starts_with(p))
}

/// Classifies a single packet.
///
/// `cached_hostname` must answer from memory only; it is consulted for HTTP
/// destinations and a miss defers the signal instead of blocking.
pub fn classify<F>(pkt: &PacketMeta, weights: &RiskWeights, cached_hostname: F) -> Option<Classified>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(signal) = classify_dns(pkt, weights) {
        return Some(Classified::Ready(signal));
    }

    if let Some(pending) = classify_http(pkt) {
        return Some(match cached_hostname(&pending.destination) {
            Some(name) => Classified::Ready(pending.into_signal(&name, weights)),
            None       => Classified::AwaitingHostname(pending),
        });
    }

    if let Some(signal) = classify_broadcast(pkt, weights) {
        return Some(Classified::Ready(signal));
    }

    if is_external(&pkt.dst) {
        return Some(Classified::ExternalFlow { destination: pkt.dst.clone() });
    }

    None
}

fn classify_dns(pkt: &PacketMeta, weights: &RiskWeights) -> Option<Signal> {
    let Transport::Udp { src_port, dst_port } = pkt.transport else { return None };
    if src_port != DNS_PORT && dst_port != DNS_PORT { return None; }

    let msg = parse_dns(pkt.payload)?;
    if !msg.is_query { return None; }
    let qname = msg.question?;

    Some(Signal {
        source:      pkt.src.clone(),
        destination: pkt.dst.clone(),
        kind:        SignalKind::DnsQuery,
        activity:    format!("Browsing {}", qname),
        weight:      weights.dns,
        name:        domain_owner(&qname),
        message:     format!("RESOLVED: {} -> {}", pkt.src, qname),
    })
}

/// `mail.example.com` -> `Example`.
fn domain_owner(qname: &str) -> Option<String> {
    let labels: Vec<&str> = qname.split('.').collect();
    if labels.len() < 2 { return None; }
    let owner = capitalize(labels[labels.len() - 2]);
    if owner.is_empty() { None } else { Some(owner) }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None        => String::new(),
    }
}

fn classify_http(pkt: &PacketMeta) -> Option<PendingHttp> {
    let Transport::Tcp { dst_port, .. } = pkt.transport else { return None };
    if dst_port != HTTP_PORT { return None; }

    let text = decode_text(pkt.payload);
    let line = text
        .starts_with("GET")
        .then(|| request_line(&text).to_string());

    Some(PendingHttp {
        source:       pkt.src.clone(),
        destination:  pkt.dst.clone(),
        request_line: line,
    })
}

fn classify_broadcast(pkt: &PacketMeta, weights: &RiskWeights) -> Option<Signal> {
    let Transport::Udp { dst_port, .. } = pkt.transport else { return None };
    let protocol = match dst_port {
        SSDP_PORT => "SSDP",
        MDNS_PORT => "mDNS",
        _         => return None,
    };

    let text = decode_text(pkt.payload);
    let mut name = if let Some(server) = header_value(&text, "SERVER:") {
        let product = server.split('/').next().unwrap_or(server).trim();
        Some(format!("Node: {}", product))
    } else if text.contains("LOCATION:") {
        Some("UPnP Service".to_string())
    } else {
        None
    };

    if dst_port == MDNS_PORT {
        if let Some(host) = mdns_host_name(pkt.payload) {
            name = Some(host);
        }
        if name.is_none() {
            name = Some("Apple/Linux Device".to_string());
        }
    }

    let display = match name {
        Some(n) => format!("{} ({})", n, protocol),
        None    => format!("Private {} Device", protocol),
    };

    Some(Signal {
        source:      pkt.src.clone(),
        destination: pkt.dst.clone(),
        kind:        SignalKind::ServiceBroadcast,
        activity:    format!("{} Identity Leak", protocol),
        weight:      weights.broadcast,
        name:        Some(display),
        message:     format!("{} IDENTITY SHOUT: {}", protocol, pkt.src),
    })
}

/// Host name advertised in an mDNS record, e.g. `Living-Room.local` ->
/// `Living-Room`. Service-type names (`_airplay._tcp.local`) are skipped.
fn mdns_host_name(payload: &[u8]) -> Option<String> {
    let msg = parse_dns(payload)?;
    [msg.answer, msg.question]
        .into_iter()
        .flatten()
        .find_map(|n| {
            if n.starts_with('_') { return None; }
            n.strip_suffix(".local").filter(|h| !h.is_empty()).map(str::to_string)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::parsers::tests::{dns_query, mdns_with_answer};
    use etherparse::PacketBuilder;

    const W: RiskWeights = RiskWeights::FINAL;

    fn udp<'a>(src: &str, dst: &str, dst_port: u16, payload: &'a [u8]) -> PacketMeta<'a> {
        PacketMeta {
            src:       src.to_string(),
            dst:       dst.to_string(),
            transport: Transport::Udp { src_port: 40000, dst_port },
            payload,
        }
    }

    fn tcp<'a>(src: &str, dst: &str, dst_port: u16, payload: &'a [u8]) -> PacketMeta<'a> {
        PacketMeta {
            src:       src.to_string(),
            dst:       dst.to_string(),
            transport: Transport::Tcp { src_port: 51000, dst_port },
            payload,
        }
    }

    fn no_cache(_: &str) -> Option<String> { None }

    fn ready(c: Option<Classified>) -> Signal {
        match c {
            Some(Classified::Ready(s)) => s,
            other => panic!("expected a ready signal, got {:?}", other),
        }
    }

    #[test]
    fn dns_query_yields_browsing_signal() {
        let payload = dns_query("mail.example.com.", false);
        let s = ready(classify(&udp("192.168.1.20", "8.8.8.8", 53, &payload), &W, no_cache));
        assert_eq!(s.kind, SignalKind::DnsQuery);
        assert_eq!(s.activity, "Browsing mail.example.com");
        assert_eq!(s.name.as_deref(), Some("Example"));
        assert_eq!(s.weight, W.dns);
        assert_eq!(s.message, "RESOLVED: 192.168.1.20 -> mail.example.com");
    }

    #[test]
    fn single_label_query_has_no_name() {
        let payload = dns_query("localhost", false);
        let s = ready(classify(&udp("192.168.1.20", "192.168.1.1", 53, &payload), &W, no_cache));
        assert_eq!(s.name, None);
    }

    #[test]
    fn dns_owner_is_capitalized() {
        assert_eq!(domain_owner("WWW.GOOGLE.COM").as_deref(), Some("Google"));
    }

    #[test]
    fn dns_response_is_not_a_query_signal() {
        let payload = dns_query("example.com", true);
        // Response to a private client: no signal, nothing to locate.
        assert_eq!(classify(&udp("8.8.8.8", "192.168.1.20", 53, &payload), &W, no_cache), None);
    }

    #[test]
    fn http_get_uses_high_weight() {
        let payload = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let cached = |_: &str| Some("example.com".to_string());
        let s = ready(classify(&tcp("192.168.1.20", "93.184.216.34", 80, payload), &W, cached));
        assert_eq!(s.kind, SignalKind::PlaintextHttp);
        assert_eq!(s.weight, W.http_get);
        assert_eq!(s.activity, "Browsing Website: Unsecured (example.com)");
        assert_eq!(s.message, "UNSECURED ACTIVITY: 192.168.1.20 -> GET / HTTP/1.1");
    }

    #[test]
    fn http_other_payload_uses_medium_weight() {
        let payload = b"POST /upload HTTP/1.1\r\n\r\n";
        let cached = |a: &str| Some(a.to_string());
        let s = ready(classify(&tcp("192.168.1.20", "93.184.216.34", 80, payload), &W, cached));
        assert_eq!(s.weight, W.http_other);
        assert_eq!(s.activity, "Unsecured Traffic: 93.184.216.34");
    }

    #[test]
    fn http_without_cached_hostname_is_deferred() {
        let payload = b"GET /index.html HTTP/1.0\r\n\r\n";
        match classify(&tcp("192.168.1.20", "93.184.216.34", 80, payload), &W, no_cache) {
            Some(Classified::AwaitingHostname(p)) => {
                assert_eq!(p.request_line.as_deref(), Some("GET /index.html HTTP/1.0"));
                let s = p.into_signal("example.org", &W);
                assert_eq!(s.activity, "Browsing Website: Unsecured (example.org)");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ssdp_server_header_names_device() {
        let payload = b"NOTIFY * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nSERVER: MyDevice/1.0\r\n\r\n";
        let s = ready(classify(&udp("192.168.1.30", "239.255.255.250", 1900, payload), &W, no_cache));
        assert_eq!(s.kind, SignalKind::ServiceBroadcast);
        assert_eq!(s.activity, "SSDP Identity Leak");
        assert!(s.name.as_deref().unwrap().contains("MyDevice"));
        assert_eq!(s.weight, W.broadcast);
    }

    #[test]
    fn ssdp_location_only_is_upnp_service() {
        let payload = b"NOTIFY * HTTP/1.1\r\nLOCATION: http://192.168.1.30:80/desc.xml\r\n\r\n";
        let s = ready(classify(&udp("192.168.1.30", "239.255.255.250", 1900, payload), &W, no_cache));
        assert_eq!(s.name.as_deref(), Some("UPnP Service (SSDP)"));
    }

    #[test]
    fn ssdp_without_identity_is_private_device() {
        let s = ready(classify(&udp("192.168.1.30", "239.255.255.250", 1900, b"M-SEARCH"), &W, no_cache));
        assert_eq!(s.name.as_deref(), Some("Private SSDP Device"));
    }

    #[test]
    fn mdns_prefers_local_host_name() {
        let payload = mdns_with_answer("_airplay._tcp.local", "Living-Room.local");
        let s = ready(classify(&udp("192.168.1.40", "224.0.0.251", 5353, &payload), &W, no_cache));
        assert_eq!(s.activity, "mDNS Identity Leak");
        assert_eq!(s.name.as_deref(), Some("Living-Room (mDNS)"));
    }

    #[test]
    fn mdns_service_names_fall_back_to_generic_label() {
        let payload = dns_query("_services._dns-sd._udp.local", false);
        let s = ready(classify(&udp("192.168.1.40", "224.0.0.251", 5353, &payload), &W, no_cache));
        assert_eq!(s.name.as_deref(), Some("Apple/Linux Device (mDNS)"));
    }

    #[test]
    fn other_external_traffic_is_map_only() {
        let c = classify(&tcp("192.168.1.20", "151.101.1.1", 8443, b""), &W, no_cache);
        assert_eq!(c, Some(Classified::ExternalFlow { destination: "151.101.1.1".into() }));
        assert_eq!(classify(&tcp("192.168.1.20", "10.0.0.5", 8443, b""), &W, no_cache), None);
    }

    #[test]
    fn classified_reports_kind_and_destination() {
        let flow = Classified::ExternalFlow { destination: "151.101.1.1".into() };
        assert_eq!(flow.kind(), SignalKind::GenericExternalFlow);
        assert!(flow.kind().locates_destination());
        assert_eq!(flow.destination(), "151.101.1.1");

        let payload = b"GET / HTTP/1.1\r\n\r\n";
        let pending = classify(&tcp("192.168.1.20", "93.184.216.34", 80, payload), &W, no_cache).unwrap();
        assert_eq!(pending.kind(), SignalKind::PlaintextHttp);
        assert_eq!(pending.destination(), "93.184.216.34");
    }

    #[test]
    fn private_prefixes_are_never_external() {
        for addr in ["192.168.0.7", "10.1.2.3", "172.16.4.4", "127.0.0.1"] {
            assert!(!is_external(addr), "{} should be local", addr);
        }
        assert!(is_external("8.8.8.8"));
        // Known gap of the prefix heuristic.
        assert!(is_external("172.20.0.1"));
    }

    #[test]
    fn malformed_dns_falls_through_silently() {
        let c = classify(&udp("192.168.1.20", "192.168.1.1", 53, &[0xde, 0xad]), &W, no_cache);
        assert_eq!(c, None);
    }

    #[test]
    fn packet_meta_from_ethernet_frame() {
        let payload = dns_query("news.ycombinator.com", false);
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4([192, 168, 1, 20], [1, 1, 1, 1], 64)
            .udp(53000, 53);
        let mut frame = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut frame, &payload).unwrap();

        let sliced = SlicedPacket::from_ethernet(&frame).unwrap();
        let meta = PacketMeta::from_sliced(&sliced).unwrap();
        assert_eq!(meta.src, "192.168.1.20");
        assert_eq!(meta.dst, "1.1.1.1");
        assert_eq!(meta.transport, Transport::Udp { src_port: 53000, dst_port: 53 });

        let s = ready(classify(&meta, &W, no_cache));
        assert_eq!(s.name.as_deref(), Some("Ycombinator"));
    }
}
