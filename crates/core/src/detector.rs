#![forbid(unsafe_code)]

use crate::{
    Blacklist, Candidate, DetectorSettings, Emit, FlowKey, FlowSnapshot, FlowState, FlowStats,
    FlowTable, KeyEncoding, NotificationSettings, ProtocolKind, ProtocolVariant, Readiness,
    RedirectedFlow, SeenFlowCache, SeenFlowNotice, SentinelFilter, build_notification_packet,
    variant_for,
};
use bytes::Bytes;
use packet_parser::{IpProtocol, TCP_ACK, TCP_SYN, parse_ipv4_packet, parse_tcp_segment};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The parts of an IPv4/TCP packet the state machine looks at.
#[derive(Debug)]
struct TcpView {
    /// Oriented as on the wire: `src` sent this packet.
    key: FlowKey,
    seq: u32,
    ack: u32,
    flags: u16,
    options: Bytes,
    payload: Bytes,
    identification: u16,
    ttl: u8,
}

enum Inspect {
    Tcp(TcpView),
    /// Not a TCP packet this detector can look into.
    Opaque,
    /// A fragment without the transport header.
    Tail,
}

fn inspect(packet: &Bytes) -> Inspect {
    let Ok(ipv4) = parse_ipv4_packet(packet) else {
        return Inspect::Opaque;
    };
    if ipv4.protocol != IpProtocol::Tcp {
        return Inspect::Opaque;
    }
    if !ipv4.is_first_fragment() {
        return Inspect::Tail;
    }
    let Ok(tcp) = parse_tcp_segment(ipv4.payload) else {
        return Inspect::Opaque;
    };
    let tcp_start = ipv4.header_length;
    let options_start = tcp_start + packet_parser::TCP_MIN_HEADER_LEN;
    let payload_start = tcp_start + tcp.data_offset as usize * 4;
    let end = ipv4.total_length as usize;
    Inspect::Tcp(TcpView {
        key: FlowKey::new(
            ipv4.source_addr(),
            tcp.source_port,
            ipv4.destination_addr(),
            tcp.destination_port,
        ),
        seq: tcp.sequence_number,
        ack: tcp.acknowledgement_number,
        flags: tcp.flags,
        options: packet.slice(options_start..payload_start),
        payload: packet.slice(payload_start..end),
        identification: ipv4.identification,
        ttl: ipv4.ttl,
    })
}

/// Sentinel detection for one protocol variant on one port.
///
/// Client packets go through [`push_client`](Self::push_client), packets
/// from the decoy side through [`push_server`](Self::push_server). Neither
/// performs I/O; the returned [`Emit`]s say where each packet goes.
#[derive(Debug)]
pub struct SentinelDetector {
    settings: DetectorSettings,
    literal: Option<Vec<u8>>,
    variant: Box<dyn ProtocolVariant>,
    table: FlowTable,
    seen: SeenFlowCache,
    filter: Option<Arc<dyn SentinelFilter>>,
    blacklist: Arc<Blacklist>,
    notification: Option<NotificationSettings>,
    stats: FlowStats,
    next_sweep: Option<Instant>,
}

impl SentinelDetector {
    pub fn new(settings: DetectorSettings, notification: Option<NotificationSettings>) -> Self {
        let variant = variant_for(settings.kind, settings.sentinel_length);
        let literal = settings
            .sentinel
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|s| s.as_bytes().to_vec());
        SentinelDetector {
            settings,
            literal,
            variant,
            table: FlowTable::new(),
            seen: SeenFlowCache::new(),
            filter: None,
            blacklist: Arc::new(Blacklist::empty()),
            notification,
            stats: FlowStats::default(),
            next_sweep: None,
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.variant.kind()
    }

    pub fn port(&self) -> u16 {
        self.settings.port()
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    pub fn stats(&self) -> FlowStats {
        self.stats
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    pub fn snapshot(&self) -> Vec<FlowSnapshot> {
        self.table.snapshot()
    }

    pub fn install_filter(&mut self, filter: Option<Arc<dyn SentinelFilter>>) {
        self.filter = filter;
    }

    pub fn install_blacklist(&mut self, blacklist: Arc<Blacklist>) {
        self.blacklist = blacklist;
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn remove_flow(&mut self, key: &FlowKey) -> bool {
        let removed = self.table.remove(key).is_some();
        if removed {
            debug!(flow = %key, "flow removed");
        }
        removed
    }

    pub fn record_seen(&mut self, notice: &SeenFlowNotice) {
        self.seen.insert(notice.flow, notice.sentinel.clone());
    }

    pub fn seen_flows(&self) -> &SeenFlowCache {
        &self.seen
    }

    pub fn is_redirected(&self, key: &FlowKey) -> bool {
        self.table.is_redirected(key)
    }

    /// Run the idle sweep if its interval has elapsed. The first call only
    /// arms the timer.
    pub fn poll_sweep(&mut self, now: Instant) -> usize {
        let interval = Duration::from_secs(self.settings.sweep_interval_secs);
        let Some(due) = self.next_sweep else {
            self.next_sweep = Some(now + interval);
            return 0;
        };
        if now < due {
            return 0;
        }
        let removed = self.table.sweep_inactive();
        self.stats.add_evicted(removed);
        self.next_sweep = Some(now + interval);
        debug!(
            kind = self.kind().as_str(),
            removed,
            remaining = self.table.len(),
            "removed inactive flows"
        );
        removed
    }

    /// Handle a packet travelling from a client towards a decoy host.
    pub fn push_client(&mut self, packet: Bytes) -> Vec<Emit> {
        self.stats.add_packet();
        let view = match inspect(&packet) {
            Inspect::Tcp(view) => view,
            Inspect::Opaque | Inspect::Tail => return vec![Emit::Pass(packet)],
        };
        if view.key.dst_port != self.port() {
            return vec![Emit::Pass(packet)];
        }

        if view.flags & TCP_SYN != 0 {
            self.table.add(view.key, view.seq, view.options.clone());
            self.stats.add_flow();
            debug!(flow = %view.key, isn = view.seq, "tracking new flow");
            return vec![Emit::Pass(packet)];
        }

        let Some(state) = self.table.get(&view.key).map(|entry| entry.state()) else {
            return vec![Emit::Pass(packet)];
        };
        match state {
            FlowState::Ack => self.client_ack(view, packet),
            FlowState::Sentinel => self.first_data(view, packet),
            FlowState::Segment => self.segment(view, packet),
            FlowState::Redirect => {
                if let Some(entry) = self.table.get_mut(&view.key) {
                    entry.set_active();
                }
                vec![Emit::Redirect(packet)]
            }
        }
    }

    /// Handle a packet travelling from a decoy host back to a client.
    pub fn push_server(&mut self, packet: Bytes) -> Vec<Emit> {
        self.stats.add_packet();
        let view = match inspect(&packet) {
            Inspect::Tcp(view) => view,
            Inspect::Opaque | Inspect::Tail => return vec![Emit::Pass(packet)],
        };
        if view.key.src_port != self.port() {
            return vec![Emit::Pass(packet)];
        }

        let key = view.key.reverse();
        let Some(entry) = self.table.get_mut(&key) else {
            return vec![Emit::Pass(packet)];
        };
        match entry.state {
            FlowState::Ack => {
                let valid = view.flags & TCP_ACK != 0
                    && view.ack == entry.isn.wrapping_add(1)
                    && view.payload.is_empty();
                if valid {
                    entry.ack_options = view.options.clone();
                    entry.server_ack = true;
                } else {
                    debug!(flow = %key, "invalid server ACK in TCP handshake");
                }
                vec![Emit::Pass(packet)]
            }
            FlowState::Redirect => {
                let mut out = Vec::with_capacity(2);
                if !entry.proto_ack
                    && let Some(random) = self.variant.server_random(&view.payload)
                {
                    entry.proto_ack = true;
                    debug!(flow = %key, "server handshake complete");
                    out.push(Emit::TlsEstablished { flow: key, random });
                }
                if self.settings.mirror_reverse {
                    out.push(Emit::Redirect(packet));
                } else {
                    out.push(Emit::Pass(packet));
                }
                out
            }
            FlowState::Sentinel | FlowState::Segment => vec![Emit::Pass(packet)],
        }
    }

    fn client_ack(&mut self, view: TcpView, packet: Bytes) -> Vec<Emit> {
        let Some(entry) = self.table.get_mut(&view.key) else {
            return vec![Emit::Pass(packet)];
        };
        let valid = view.flags & TCP_ACK != 0
            && view.payload.is_empty()
            && view.seq == entry.isn.wrapping_add(1);
        if valid {
            entry.state = FlowState::Sentinel;
            entry.set_active();
        } else {
            debug!(flow = %view.key, "invalid client ACK in TCP handshake");
            self.reject(&view.key);
        }
        vec![Emit::Pass(packet)]
    }

    fn first_data(&mut self, view: TcpView, packet: Bytes) -> Vec<Emit> {
        let in_order = self
            .table
            .get(&view.key)
            .is_some_and(|entry| view.seq == entry.isn.wrapping_add(1));
        if !in_order {
            return self.segment(view, packet);
        }
        match self.variant.readiness(&view.payload) {
            Readiness::Pending => self.segment(view, packet),
            Readiness::Reject(reason) => {
                debug!(flow = %view.key, reason, "no sentinel possible");
                self.reject(&view.key);
                vec![Emit::Pass(packet)]
            }
            Readiness::Ready => match self.decide(&view.key, &view.payload) {
                Some(sentinel) => self.confirm(&view, sentinel, vec![packet]),
                None => {
                    self.reject(&view.key);
                    vec![Emit::Pass(packet)]
                }
            },
        }
    }

    fn segment(&mut self, view: TcpView, packet: Bytes) -> Vec<Emit> {
        if view.payload.is_empty() {
            return vec![Emit::Pass(packet)];
        }
        let max_buffered = self.settings.max_buffered_bytes;
        let Some(entry) = self.table.get_mut(&view.key) else {
            return vec![Emit::Pass(packet)];
        };
        entry.state = FlowState::Segment;
        entry.set_active();
        let offset = entry.stream_offset(view.seq);
        let buffered = entry
            .buffer
            .insert(offset, packet.clone(), view.payload.clone());
        if buffered > max_buffered {
            warn!(flow = %view.key, buffered, max_buffered, "reassembly limit exceeded");
            self.reject(&view.key);
            return vec![Emit::Pass(packet)];
        }
        let stream = entry.buffer.contiguous();

        match self.variant.readiness(&stream) {
            Readiness::Pending => vec![Emit::Pass(packet)],
            Readiness::Reject(reason) => {
                debug!(flow = %view.key, reason, "no sentinel possible");
                self.reject(&view.key);
                vec![Emit::Pass(packet)]
            }
            Readiness::Ready => match self.decide(&view.key, &stream) {
                Some(sentinel) => {
                    let packets = match self.table.get_mut(&view.key) {
                        Some(entry) => {
                            let packets = entry.buffer.packets();
                            entry.buffer.clear();
                            packets
                        }
                        None => Vec::new(),
                    };
                    // The triggering packet travels inside the chain only.
                    self.confirm(&view, sentinel, packets)
                }
                None => {
                    self.reject(&view.key);
                    vec![Emit::Pass(packet)]
                }
            },
        }
    }

    /// Try every candidate region. Returns the sentinel bytes, as they
    /// appeared on the wire, of the first confirmed candidate.
    fn decide(&self, key: &FlowKey, stream: &[u8]) -> Option<Bytes> {
        for candidate in self.variant.candidates(stream) {
            if let Some(sentinel) = self.check_candidate(key, &candidate) {
                if self.blacklist.contains(key.dst_addr) {
                    info!(flow = %key, decoy = %key.dst_addr, "decoy address is blacklisted");
                    return None;
                }
                return Some(sentinel);
            }
        }
        None
    }

    fn check_candidate(&self, key: &FlowKey, candidate: &Candidate) -> Option<Bytes> {
        let key_len = match candidate.encoding {
            KeyEncoding::Raw => self.settings.sentinel_length,
            KeyEncoding::Hex => 2 * self.settings.sentinel_length,
        };
        let wire = &candidate.wire;
        let sentinel = Bytes::copy_from_slice(&wire[..key_len.min(wire.len())]);

        if self.seen.matches(key, wire) {
            info!(flow = %key, "ignoring already seen flow");
            return None;
        }
        if let Some(literal) = &self.literal
            && wire.starts_with(literal)
        {
            debug!(flow = %key, "literal sentinel matched");
            return Some(sentinel);
        }
        if wire.len() < key_len {
            return None;
        }
        let value = match candidate.encoding {
            KeyEncoding::Raw => wire[..key_len].to_vec(),
            KeyEncoding::Hex => match utils::decode_hex(&wire[..key_len]) {
                Some(value) => value,
                None => {
                    debug!(flow = %key, "candidate is not valid hex");
                    return None;
                }
            },
        };
        let filter = self.filter.as_ref()?;
        if filter.contains(&value) {
            debug!(flow = %key, "sentinel found in filter");
            Some(sentinel)
        } else {
            None
        }
    }

    fn confirm(&mut self, view: &TcpView, sentinel: Bytes, packets: Vec<Bytes>) -> Vec<Emit> {
        let Some(entry) = self.table.get_mut(&view.key) else {
            return Vec::new();
        };
        entry.state = FlowState::Redirect;
        entry.set_active();
        let flow = RedirectedFlow {
            flow: view.key,
            syn_options: entry.syn_options.clone(),
            ack_options: entry.ack_options.clone(),
            packets,
        };
        self.stats.add_redirected();
        info!(flow = %view.key, kind = self.kind().as_str(), "redirecting flow");

        let mut out = Vec::with_capacity(2);
        if let Some(settings) = &self.notification {
            let notice = SeenFlowNotice {
                flow: view.key,
                sentinel,
            };
            match build_notification_packet(settings, &notice, view.identification, view.ttl) {
                Ok(packet) => out.push(Emit::Notify(packet)),
                Err(err) => warn!(flow = %view.key, ?err, "cannot build seen-flow notification"),
            }
        }
        out.push(Emit::RedirectFlow(flow));
        out
    }

    fn reject(&mut self, key: &FlowKey) {
        if self.table.remove(key).is_some() {
            self.stats.add_rejected();
            debug!(flow = %key, "flow is not redirected");
        }
    }
}
