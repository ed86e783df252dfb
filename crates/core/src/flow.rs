#![forbid(unsafe_code)]

use crate::SegmentBuffer;
use bytes::Bytes;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::net::Ipv4Addr;

/// Client-oriented TCP 4-tuple: `src` is the client, `dst` the decoy host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_addr: Ipv4Addr, src_port: u16, dst_addr: Ipv4Addr, dst_port: u16) -> Self {
        FlowKey {
            src_addr,
            src_port,
            dst_addr,
            dst_port,
        }
    }

    pub fn reverse(&self) -> Self {
        FlowKey {
            src_addr: self.dst_addr,
            src_port: self.dst_port,
            dst_addr: self.src_addr,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// SYN seen, waiting for the client's handshake ACK.
    Ack,
    /// Handshake done, waiting for the first data packet.
    Sentinel,
    /// Sentinel region split across packets; reassembling.
    Segment,
    /// Confirmed; all client traffic goes to the redirect interface.
    Redirect,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Ack => "ACK",
            FlowState::Sentinel => "SENTINEL",
            FlowState::Segment => "SEGMENT",
            FlowState::Redirect => "REDIRECT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowEntry {
    pub(crate) state: FlowState,
    pub(crate) isn: u32,
    pub(crate) syn_options: Bytes,
    pub(crate) ack_options: Bytes,
    pub(crate) server_ack: bool,
    pub(crate) proto_ack: bool,
    pub(crate) active: bool,
    pub(crate) buffer: SegmentBuffer,
}

impl FlowEntry {
    fn new(isn: u32, syn_options: Bytes) -> Self {
        FlowEntry {
            state: FlowState::Ack,
            isn,
            syn_options,
            ack_options: Bytes::new(),
            server_ack: false,
            proto_ack: false,
            active: true,
            buffer: SegmentBuffer::new(),
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn isn(&self) -> u32 {
        self.isn
    }

    pub fn syn_options(&self) -> &Bytes {
        &self.syn_options
    }

    pub fn ack_options(&self) -> &Bytes {
        &self.ack_options
    }

    pub fn server_ack(&self) -> bool {
        self.server_ack
    }

    pub fn proto_ack(&self) -> bool {
        self.proto_ack
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self) {
        self.active = true;
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.buffered_bytes()
    }

    /// Offset of `seq` from the first data byte of the client stream.
    pub fn stream_offset(&self, seq: u32) -> u32 {
        seq.wrapping_sub(self.isn.wrapping_add(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSnapshot {
    pub key: FlowKey,
    pub state: FlowState,
    pub active: bool,
    pub server_ack: bool,
    pub proto_ack: bool,
    pub buffered_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowStats {
    pub packets: u64,
    pub new_flows: u64,
    pub redirected: u64,
    pub rejected: u64,
    pub evicted: u64,
}

impl FlowStats {
    pub fn add_packet(&mut self) {
        self.packets += 1;
    }
    pub fn add_flow(&mut self) {
        self.new_flows += 1;
    }
    pub fn add_redirected(&mut self) {
        self.redirected += 1;
    }
    pub fn add_rejected(&mut self) {
        self.rejected += 1;
    }
    pub fn add_evicted(&mut self, count: usize) {
        self.evicted += count as u64;
    }
}

/// Per-detector flow state with two-generation idle eviction.
///
/// Entries start active and are re-marked active by every packet. Each sweep
/// deletes entries still inactive since the previous sweep and clears the
/// flag on the survivors, so an idle entry lives between one and two sweep
/// intervals.
#[derive(Debug, Default)]
pub struct FlowTable {
    table: HashMap<FlowKey, FlowEntry>,
}

impl FlowTable {
    pub fn new() -> Self {
        FlowTable::default()
    }

    /// Start tracking `key` in ACK state. A duplicate SYN replaces the entry.
    pub fn add(&mut self, key: FlowKey, isn: u32, syn_options: Bytes) -> &mut FlowEntry {
        let entry = FlowEntry::new(isn, syn_options);
        match self.table.entry(key) {
            Entry::Occupied(mut slot) => {
                slot.insert(entry);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(entry),
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<&FlowEntry> {
        self.table.get(key)
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut FlowEntry> {
        self.table.get_mut(key)
    }

    pub fn remove(&mut self, key: &FlowKey) -> Option<FlowEntry> {
        self.table.remove(key)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.table.contains_key(key)
    }

    pub fn is_redirected(&self, key: &FlowKey) -> bool {
        self.table
            .get(key)
            .is_some_and(|entry| entry.state == FlowState::Redirect)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Run one sweep generation. Returns the number of entries removed.
    pub fn sweep_inactive(&mut self) -> usize {
        let before = self.table.len();
        self.table.retain(|_, entry| entry.active);
        for entry in self.table.values_mut() {
            entry.active = false;
        }
        before - self.table.len()
    }

    pub fn snapshot(&self) -> Vec<FlowSnapshot> {
        let mut flows: Vec<FlowSnapshot> = self
            .table
            .iter()
            .map(|(key, entry)| FlowSnapshot {
                key: *key,
                state: entry.state,
                active: entry.active,
                server_ack: entry.server_ack,
                proto_ack: entry.proto_ack,
                buffered_bytes: entry.buffer.buffered_bytes(),
            })
            .collect();
        flows.sort_by_key(|s| (s.key.src_addr, s.key.src_port, s.key.dst_addr, s.key.dst_port));
        flows
    }
}
