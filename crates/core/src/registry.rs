#![forbid(unsafe_code)]

use crate::{
    Blacklist, Emit, FlowKey, NotificationSettings, NoticeVerdict, ProtocolKind, SeenFlowNotice,
    SentinelDetector, SentinelFilter, inspect_notification, quoted_flow,
};
use bytes::Bytes;
use packet_parser::{IpProtocol, parse_ipv4_packet, parse_tcp_ports};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// State the control channel is allowed to change.
pub trait ControlTarget {
    /// Publish a new sentinel filter; `None` means "match nothing".
    fn install_filter(&mut self, filter: Option<Arc<dyn SentinelFilter>>);
    fn install_blacklist(&mut self, blacklist: Arc<Blacklist>);
    /// Remove `key` from every detector. Returns how many held it.
    fn remove_flow(&mut self, key: &FlowKey) -> usize;
}

/// All detectors of one router, plus the adapters that fan out to them.
#[derive(Debug, Default)]
pub struct DetectorRegistry {
    detectors: Vec<SentinelDetector>,
    notification: Option<NotificationSettings>,
}

impl DetectorRegistry {
    pub fn new(notification: Option<NotificationSettings>) -> Self {
        DetectorRegistry {
            detectors: Vec::new(),
            notification,
        }
    }

    pub fn register(&mut self, detector: SentinelDetector) {
        debug!(
            kind = detector.kind().as_str(),
            port = detector.port(),
            "registered detector"
        );
        self.detectors.push(detector);
    }

    pub fn detectors(&self) -> &[SentinelDetector] {
        &self.detectors
    }

    pub fn detector(&self, kind: ProtocolKind) -> Option<&SentinelDetector> {
        self.detectors.iter().find(|d| d.kind() == kind)
    }

    pub fn notification(&self) -> Option<&NotificationSettings> {
        self.notification.as_ref()
    }

    /// Route one network packet through the matching detector or adapter.
    pub fn process(&mut self, packet: Bytes) -> Vec<Emit> {
        let protocol = match parse_ipv4_packet(&packet) {
            Ok(ipv4) => ipv4.protocol,
            Err(_) => return vec![Emit::Pass(packet)],
        };
        match protocol {
            IpProtocol::Tcp => self.process_tcp(packet),
            IpProtocol::Udp => self.process_udp(packet),
            IpProtocol::Icmpv4 => match self.redirect_icmp(&packet) {
                Some(emit) => vec![emit],
                None => vec![Emit::Pass(packet)],
            },
            IpProtocol::Other(_) => vec![Emit::Pass(packet)],
        }
    }

    fn process_tcp(&mut self, packet: Bytes) -> Vec<Emit> {
        let ports = parse_ipv4_packet(&packet)
            .ok()
            .filter(|ipv4| ipv4.is_first_fragment())
            .and_then(|ipv4| parse_tcp_ports(ipv4.payload).ok());
        let Some((src_port, dst_port)) = ports else {
            return vec![Emit::Pass(packet)];
        };
        if let Some(detector) = self.detectors.iter_mut().find(|d| d.port() == dst_port) {
            return detector.push_client(packet);
        }
        if let Some(detector) = self.detectors.iter_mut().find(|d| d.port() == src_port) {
            return detector.push_server(packet);
        }
        vec![Emit::Pass(packet)]
    }

    fn process_udp(&mut self, packet: Bytes) -> Vec<Emit> {
        let Some(settings) = self.notification else {
            return vec![Emit::Pass(packet)];
        };
        match inspect_notification(&settings, &packet) {
            NoticeVerdict::Ignore | NoticeVerdict::Pass => vec![Emit::Pass(packet)],
            NoticeVerdict::Drop => Vec::new(),
            NoticeVerdict::Accept(notice) => {
                self.record_seen(&notice);
                vec![Emit::Pass(packet)]
            }
        }
    }

    pub fn record_seen(&mut self, notice: &SeenFlowNotice) {
        for detector in &mut self.detectors {
            detector.record_seen(notice);
        }
    }

    /// Claim an ICMP error that refers to a redirected flow.
    pub fn redirect_icmp(&self, packet: &Bytes) -> Option<Emit> {
        let flow = quoted_flow(packet)?;
        for detector in &self.detectors {
            if detector.is_redirected(&flow) {
                return Some(Emit::RedirectIcmp {
                    flow,
                    packet: packet.clone(),
                    to_client: false,
                });
            }
            if detector.is_redirected(&flow.reverse()) {
                return Some(Emit::RedirectIcmp {
                    flow,
                    packet: packet.clone(),
                    to_client: true,
                });
            }
        }
        None
    }

    /// Run due idle sweeps. Returns the number of entries evicted.
    pub fn poll_sweep(&mut self, now: Instant) -> usize {
        self.detectors.iter_mut().map(|d| d.poll_sweep(now)).sum()
    }
}

impl ControlTarget for DetectorRegistry {
    fn install_filter(&mut self, filter: Option<Arc<dyn SentinelFilter>>) {
        for detector in &mut self.detectors {
            detector.install_filter(filter.clone());
        }
    }

    fn install_blacklist(&mut self, blacklist: Arc<Blacklist>) {
        for detector in &mut self.detectors {
            detector.install_blacklist(Arc::clone(&blacklist));
        }
    }

    fn remove_flow(&mut self, key: &FlowKey) -> usize {
        self.detectors
            .iter_mut()
            .map(|d| d.remove_flow(key))
            .filter(|removed| *removed)
            .count()
    }
}
