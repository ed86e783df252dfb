#![forbid(unsafe_code)]

use packet_parser::ParseError;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, warn};

/// One decoy-host prefix excluded from redirection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl BlacklistEntry {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, ParseError> {
        if prefix > 32 {
            return Err(ParseError::Invalid("prefix >32"));
        }
        Ok(BlacklistEntry { addr, prefix })
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_v4(self.prefix))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let net = u32::from_be_bytes(self.addr.octets());
        let ip = u32::from_be_bytes(addr.octets());
        let mask = mask_v4(self.prefix);
        (net & mask) == (ip & mask)
    }
}

/// Decoy hosts that must never be redirected. Replaced wholesale on update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    entries: Vec<BlacklistEntry>,
}

impl Blacklist {
    pub fn new(entries: Vec<BlacklistEntry>) -> Self {
        Blacklist { entries }
    }

    pub fn empty() -> Self {
        Blacklist::default()
    }

    pub fn entries(&self) -> &[BlacklistEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, decoy: Ipv4Addr) -> bool {
        self.entries.iter().any(|entry| entry.contains(decoy))
    }

    /// Parse blacklist text; malformed lines are skipped with a warning.
    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_entry(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(line = idx + 1, text = line, ?err, "skipping blacklist line"),
            }
        }
        Blacklist { entries }
    }

    /// Read and parse a blacklist file. A file that cannot be read yields an
    /// empty blacklist.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let list = Blacklist::parse(&text);
                debug!(path = %path.display(), entries = list.len(), "loaded blacklist");
                list
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot read blacklist; using empty list");
                Blacklist::empty()
            }
        }
    }
}

/// `addr`, `addr mask` (dotted quad) or `addr/prefix`.
pub fn parse_entry(line: &str) -> Result<BlacklistEntry, ParseError> {
    if let Some((addr, prefix)) = line.split_once('/') {
        let addr: Ipv4Addr = addr.trim().parse().map_err(|_| ParseError::Invalid("ip"))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|_| ParseError::Invalid("prefix"))?;
        return BlacklistEntry::new(addr, prefix);
    }

    let mut parts = line.split_whitespace();
    let addr: Ipv4Addr = parts
        .next()
        .ok_or(ParseError::Truncated("address"))?
        .parse()
        .map_err(|_| ParseError::Invalid("ip"))?;
    let prefix = match parts.next() {
        Some(mask) => {
            let mask: Ipv4Addr = mask.parse().map_err(|_| ParseError::Invalid("mask"))?;
            prefix_from_mask(mask)?
        }
        None => 32,
    };
    if parts.next().is_some() {
        return Err(ParseError::Invalid("trailing fields"));
    }
    BlacklistEntry::new(addr, prefix)
}

fn prefix_from_mask(mask: Ipv4Addr) -> Result<u8, ParseError> {
    let bits = u32::from_be_bytes(mask.octets());
    let prefix = bits.leading_ones();
    if bits.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(ParseError::Invalid("non-contiguous mask"));
    }
    Ok(prefix as u8)
}

fn mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}
