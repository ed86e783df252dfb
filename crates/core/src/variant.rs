#![forbid(unsafe_code)]

use crate::ProtocolKind;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use bytes::Bytes;
use std::fmt;

/// Whether enough of the client stream is present to locate the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    /// The stream cannot carry a sentinel for this protocol.
    Reject(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    /// Sentinel bytes appear verbatim.
    Raw,
    /// Sentinel bytes appear as ASCII hex, two characters per byte.
    Hex,
}

/// A region of the client stream that may hold the sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub wire: Vec<u8>,
    pub encoding: KeyEncoding,
}

impl Candidate {
    pub fn raw(wire: &[u8]) -> Self {
        Candidate {
            wire: wire.to_vec(),
            encoding: KeyEncoding::Raw,
        }
    }

    pub fn hex(wire: &[u8]) -> Self {
        Candidate {
            wire: wire.to_vec(),
            encoding: KeyEncoding::Hex,
        }
    }
}

/// Protocol-specific part of sentinel detection.
pub trait ProtocolVariant: fmt::Debug + Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Judge the contiguous client stream seen so far.
    fn readiness(&self, stream: &[u8]) -> Readiness;

    /// Candidate regions, in the order they should be tried. Only called on
    /// a stream judged [`Readiness::Ready`].
    fn candidates(&self, stream: &[u8]) -> Vec<Candidate>;

    /// Server handshake nonce that completes an application-layer handshake.
    fn server_random(&self, _payload: &[u8]) -> Option<Bytes> {
        None
    }
}

pub fn variant_for(kind: ProtocolKind, sentinel_len: usize) -> Box<dyn ProtocolVariant> {
    match kind {
        ProtocolKind::Fixed => Box::new(FixedOffset::new(sentinel_len)),
        ProtocolKind::Http => Box::new(HttpCookie::new(sentinel_len)),
        ProtocolKind::Tls => Box::new(TlsHello),
    }
}

/// Sentinel in the first bytes of the first client payload.
#[derive(Debug, Clone)]
pub struct FixedOffset {
    sentinel_len: usize,
}

impl FixedOffset {
    pub fn new(sentinel_len: usize) -> Self {
        FixedOffset { sentinel_len }
    }
}

impl ProtocolVariant for FixedOffset {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Fixed
    }

    fn readiness(&self, stream: &[u8]) -> Readiness {
        if stream.len() >= self.sentinel_len {
            Readiness::Ready
        } else {
            Readiness::Pending
        }
    }

    fn candidates(&self, stream: &[u8]) -> Vec<Candidate> {
        stream
            .get(..self.sentinel_len)
            .map(Candidate::raw)
            .into_iter()
            .collect()
    }
}

pub const TLS_RECORD_HANDSHAKE: u8 = 0x16;
pub const TLS_CLIENT_HELLO: u8 = 0x01;
pub const TLS_SERVER_HELLO: u8 = 0x02;
/// Start of the random bytes that follow the 4-byte time prefix.
pub const TLS_RANDOM_OFFSET: usize = 15;
pub const TLS_RANDOM_LEN: usize = 28;
const TLS_REQUIRED_LEN: usize = TLS_RANDOM_OFFSET + TLS_RANDOM_LEN;

/// Sentinel inside the ClientHello random.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsHello;

fn is_tls_hello(payload: &[u8], hello_type: u8) -> bool {
    payload.first() == Some(&TLS_RECORD_HANDSHAKE) && payload.get(5) == Some(&hello_type)
}

impl ProtocolVariant for TlsHello {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Tls
    }

    fn readiness(&self, stream: &[u8]) -> Readiness {
        if stream.len() > 5 && !is_tls_hello(stream, TLS_CLIENT_HELLO) {
            return Readiness::Reject("not a TLS ClientHello");
        }
        if stream.len() >= TLS_REQUIRED_LEN {
            Readiness::Ready
        } else {
            Readiness::Pending
        }
    }

    fn candidates(&self, stream: &[u8]) -> Vec<Candidate> {
        stream
            .get(TLS_RANDOM_OFFSET..TLS_REQUIRED_LEN)
            .map(Candidate::raw)
            .into_iter()
            .collect()
    }

    fn server_random(&self, payload: &[u8]) -> Option<Bytes> {
        if payload.len() < TLS_REQUIRED_LEN || !is_tls_hello(payload, TLS_SERVER_HELLO) {
            return None;
        }
        Some(Bytes::copy_from_slice(
            &payload[TLS_RANDOM_OFFSET..TLS_REQUIRED_LEN],
        ))
    }
}

const HTTP_METHOD: &[u8] = b"GET";
const HTTP_END_OF_HEADERS: &[u8] = b"\r\n\r\n";
const HTTP_EOL: &[u8] = b"\r\n";

/// Hex-encoded sentinel carried as a cookie value of a GET request.
#[derive(Debug, Clone)]
pub struct HttpCookie {
    sentinel_len: usize,
    cookie_header: AhoCorasick,
}

impl HttpCookie {
    pub fn new(sentinel_len: usize) -> Self {
        let cookie_header = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build([b"\r\nCookie: ".as_slice()])
            .expect("cookie header pattern");
        HttpCookie {
            sentinel_len,
            cookie_header,
        }
    }

    fn cookie_values(&self, field: &[u8], out: &mut Vec<Candidate>) {
        let hex_len = 2 * self.sentinel_len;
        let mut rest = field;
        loop {
            let (pair, next) = match find(rest, b"; ", 0) {
                Some(idx) => (&rest[..idx], Some(&rest[idx + 2..])),
                None => (rest, None),
            };
            if let Some(eq) = pair.iter().position(|b| *b == b'=') {
                let value = &pair[eq + 1..];
                if value.len() >= hex_len {
                    out.push(Candidate::hex(&value[..hex_len]));
                }
            }
            match next {
                Some(next) => rest = next,
                None => break,
            }
        }
    }
}

impl ProtocolVariant for HttpCookie {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Http
    }

    fn readiness(&self, stream: &[u8]) -> Readiness {
        if stream.len() >= HTTP_METHOD.len() && !stream.starts_with(HTTP_METHOD) {
            return Readiness::Reject("request does not begin with GET");
        }
        if find(stream, HTTP_END_OF_HEADERS, 0).is_some() {
            Readiness::Ready
        } else {
            Readiness::Pending
        }
    }

    fn candidates(&self, stream: &[u8]) -> Vec<Candidate> {
        let Some(end) = find(stream, HTTP_END_OF_HEADERS, 0) else {
            return Vec::new();
        };
        let request = &stream[..end + HTTP_END_OF_HEADERS.len()];
        let mut out = Vec::new();
        for header in self.cookie_header.find_iter(request) {
            let start = header.end();
            let Some(eol) = find(request, HTTP_EOL, start) else {
                break;
            };
            self.cookie_values(&request[start..eol], &mut out);
        }
        out
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|idx| idx + from)
}
