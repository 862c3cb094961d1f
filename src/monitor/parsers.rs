//! Payload parsers for DNS/mDNS, SSDP and HTTP.
//!
//! All functions take untrusted bytes and return `None` on anything they do
//! not understand; none of them can panic on short or hostile input.

/// Compression pointers followed before a name is considered malformed.
const MAX_POINTER_JUMPS: usize = 16;

const DNS_HEADER_LEN: usize = 12;

/// The parts of a DNS message the classifier cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    /// `true` when the QR bit is clear.
    pub is_query: bool,
    /// Name of the first question, without the trailing dot.
    pub question: Option<String>,
    /// Owner name of the first answer record, without the trailing dot.
    pub answer:   Option<String>,
}

/// Parses the header, first question and first answer of a DNS message.
pub fn parse_dns(payload: &[u8]) -> Option<DnsMessage> {
    if payload.len() < DNS_HEADER_LEN { return None; }

    let flags    = u16::from_be_bytes([payload[2], payload[3]]);
    let qd_count = u16::from_be_bytes([payload[4], payload[5]]);
    let an_count = u16::from_be_bytes([payload[6], payload[7]]);

    let mut idx      = DNS_HEADER_LEN;
    let mut question = None;

    for i in 0..qd_count {
        let (name, next) = read_name(payload, idx)?;
        // QTYPE + QCLASS
        idx = next + 4;
        if idx > payload.len() { return None; }
        if i == 0 { question = Some(name); }
    }

    let answer = if an_count > 0 {
        read_name(payload, idx).map(|(name, _)| name)
    } else {
        None
    };

    Some(DnsMessage {
        is_query: flags & 0x8000 == 0,
        question: question.filter(|q| !q.is_empty()),
        answer:   answer.filter(|a| !a.is_empty()),
    })
}

/// Reads a possibly-compressed domain name starting at `start`.
///
/// Returns the dotted name and the offset just past the name in the original
/// position (pointer targets do not advance it).
fn read_name(payload: &[u8], start: usize) -> Option<(String, usize)> {
    let mut idx    = start;
    let mut next   = None;
    let mut jumps  = 0;
    let mut labels: Vec<String> = Vec::new();

    loop {
        let len = *payload.get(idx)? as usize;

        if len == 0 {
            let end = next.unwrap_or(idx + 1);
            return Some((labels.join("."), end));
        }

        if len & 0xC0 == 0xC0 {
            let low = *payload.get(idx + 1)? as usize;
            if next.is_none() { next = Some(idx + 2); }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS { return None; }
            idx = ((len & 0x3F) << 8) | low;
            continue;
        }

        let label = payload.get(idx + 1..idx + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        idx += len + 1;
    }
}

/// Decodes a payload as text, dropping byte sequences that are not UTF-8.
pub fn decode_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).replace('\u{FFFD}', "")
}

/// Returns the trimmed value of the first `header` occurrence (e.g. `"SERVER:"`),
/// up to the end of its line.
pub fn header_value<'a>(text: &'a str, header: &str) -> Option<&'a str> {
    let start = text.find(header)? + header.len();
    let rest  = &text[start..];
    let value = rest.split("\r\n").next().unwrap_or(rest);
    Some(value.trim())
}

/// First line of an HTTP request, e.g. `GET / HTTP/1.1`.
pub fn request_line(text: &str) -> &str {
    text.split("\r\n").next().unwrap_or(text)
}
