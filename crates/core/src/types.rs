#![forbid(unsafe_code)]

use crate::{FlowKey, TLS_RANDOM_LEN};
use bytes::Bytes;
use std::net::Ipv4Addr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Where a protocol variant looks for the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ProtocolKind {
    /// First bytes of the first client payload.
    Fixed,
    /// Hex-encoded value of an HTTP request cookie.
    Http,
    /// Inside the ClientHello random.
    #[default]
    Tls,
}

impl ProtocolKind {
    pub fn default_port(&self) -> u16 {
        match self {
            ProtocolKind::Fixed => 6881,
            ProtocolKind::Http => 80,
            ProtocolKind::Tls => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Fixed => "fixed",
            ProtocolKind::Http => "http",
            ProtocolKind::Tls => "tls",
        }
    }
}

pub const DEFAULT_SENTINEL_LENGTH: usize = 8;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct DetectorSettings {
    pub kind: ProtocolKind,
    /// `None` selects the variant's well-known port.
    pub port: Option<u16>,
    /// Literal sentinel accepted without consulting the filter.
    pub sentinel: Option<String>,
    pub sentinel_length: usize,
    pub sweep_interval_secs: u64,
    pub mirror_reverse: bool,
    pub max_buffered_bytes: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        DetectorSettings {
            kind: ProtocolKind::default(),
            port: None,
            sentinel: None,
            sentinel_length: DEFAULT_SENTINEL_LENGTH,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            mirror_reverse: false,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

impl DetectorSettings {
    pub fn for_kind(kind: ProtocolKind) -> Self {
        DetectorSettings {
            kind,
            ..DetectorSettings::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.kind.default_port())
    }

    /// Length of a candidate as it appears on the wire.
    pub fn candidate_len(&self) -> usize {
        match self.kind {
            ProtocolKind::Fixed => self.sentinel_length,
            ProtocolKind::Http => self.sentinel_length * 2,
            ProtocolKind::Tls => TLS_RANDOM_LEN,
        }
    }
}

/// Seen-flow side channel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct NotificationSettings {
    pub port: u16,
    pub local_addr: Ipv4Addr,
}

/// Everything the proxy needs to take over a confirmed flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectedFlow {
    pub flow: FlowKey,
    pub syn_options: Bytes,
    pub ack_options: Bytes,
    /// Whole IPv4 packets in sequence order.
    pub packets: Vec<Bytes>,
}

/// Output of the detection engine for a single input packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emit {
    /// Forward unchanged on the pass-through interface.
    Pass(Bytes),
    /// Forward on the redirect interface.
    Redirect(Bytes),
    /// First packets of a newly confirmed flow.
    RedirectFlow(RedirectedFlow),
    /// The decoy answered the ClientHello of a redirected flow.
    TlsEstablished { flow: FlowKey, random: Bytes },
    /// A seen-flow notification packet to transmit on the network side.
    Notify(Bytes),
    /// ICMP error about a redirected flow.
    RedirectIcmp {
        flow: FlowKey,
        packet: Bytes,
        to_client: bool,
    },
}
