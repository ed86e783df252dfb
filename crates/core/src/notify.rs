#![forbid(unsafe_code)]

use crate::{FlowKey, NotificationSettings};
use bytes::Bytes;
use packet_parser::{
    IpProtocol, ParseError, UdpPacketSpec, build_ipv4_udp, parse_ipv4_packet, parse_udp_datagram,
};
use std::net::Ipv4Addr;
use tracing::{debug, warn};

pub const NOTIFICATION_MAGIC: [u8; 4] = [0xBA, 0xAD, 0xFE, 0xED];
/// Magic, two addresses, two ports and the sentinel length.
pub const NOTIFICATION_HEADER_LEN: usize = 18;

/// "This flow was already confirmed elsewhere, with this sentinel."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenFlowNotice {
    pub flow: FlowKey,
    pub sentinel: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeError {
    /// Too short or missing the magic; not meant for us.
    NotANotice,
    /// Declared sentinel length disagrees with the payload.
    LengthMismatch { declared: usize, actual: usize },
}

impl SeenFlowNotice {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NOTIFICATION_HEADER_LEN + self.sentinel.len());
        out.extend_from_slice(&NOTIFICATION_MAGIC);
        out.extend_from_slice(&self.flow.src_addr.octets());
        out.extend_from_slice(&self.flow.dst_addr.octets());
        out.extend_from_slice(&self.flow.src_port.to_be_bytes());
        out.extend_from_slice(&self.flow.dst_port.to_be_bytes());
        out.extend_from_slice(&(self.sentinel.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.sentinel);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, NoticeError> {
        if payload.len() < NOTIFICATION_HEADER_LEN || payload[..4] != NOTIFICATION_MAGIC {
            return Err(NoticeError::NotANotice);
        }
        let addr = |at: usize| Ipv4Addr::new(payload[at], payload[at + 1], payload[at + 2], payload[at + 3]);
        let port = |at: usize| u16::from_be_bytes([payload[at], payload[at + 1]]);
        let declared = port(16) as usize;
        let actual = payload.len() - NOTIFICATION_HEADER_LEN;
        if declared != actual {
            return Err(NoticeError::LengthMismatch { declared, actual });
        }
        Ok(SeenFlowNotice {
            flow: FlowKey::new(addr(4), port(12), addr(8), port(14)),
            sentinel: Bytes::copy_from_slice(&payload[NOTIFICATION_HEADER_LEN..]),
        })
    }
}

/// Wrap a notice in an IPv4/UDP packet addressed to the decoy host.
///
/// The client port doubles as the UDP source port; identification and TTL
/// are copied from the packet that confirmed the flow.
pub fn build_notification_packet(
    settings: &NotificationSettings,
    notice: &SeenFlowNotice,
    identification: u16,
    ttl: u8,
) -> Result<Bytes, ParseError> {
    let payload = notice.encode();
    let packet = build_ipv4_udp(&UdpPacketSpec {
        source: settings.local_addr,
        destination: notice.flow.dst_addr,
        source_port: notice.flow.src_port,
        destination_port: settings.port,
        identification,
        ttl,
        payload: &payload,
    })?;
    Ok(Bytes::from(packet))
}

/// What to do with an inbound UDP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeVerdict {
    /// Not addressed to the notification port; untouched.
    Ignore,
    /// Our own notice looping back, or malformed.
    Drop,
    /// Forward unchanged.
    Pass,
    /// Record the notice, then forward the packet.
    Accept(SeenFlowNotice),
}

pub fn inspect_notification(settings: &NotificationSettings, packet: &[u8]) -> NoticeVerdict {
    let Ok(ipv4) = parse_ipv4_packet(packet) else {
        return NoticeVerdict::Ignore;
    };
    if ipv4.protocol != IpProtocol::Udp || ipv4.is_fragment() {
        return NoticeVerdict::Ignore;
    }
    let Ok(udp) = parse_udp_datagram(ipv4.payload) else {
        return NoticeVerdict::Ignore;
    };
    if udp.destination_port != settings.port {
        return NoticeVerdict::Ignore;
    }
    if ipv4.source_addr() == settings.local_addr {
        debug!("dropping local seen-flow notification");
        return NoticeVerdict::Drop;
    }
    match SeenFlowNotice::decode(udp.payload) {
        Ok(notice) => {
            debug!(flow = %notice.flow, "recording previously seen flow");
            NoticeVerdict::Accept(notice)
        }
        Err(NoticeError::NotANotice) => NoticeVerdict::Pass,
        Err(NoticeError::LengthMismatch { declared, actual }) => {
            warn!(declared, actual, "dropping seen-flow notification with bad length");
            NoticeVerdict::Drop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> NotificationSettings {
        NotificationSettings {
            port: 4000,
            local_addr: Ipv4Addr::new(10, 0, 0, 1),
        }
    }

    fn notice() -> SeenFlowNotice {
        SeenFlowNotice {
            flow: FlowKey::new(
                Ipv4Addr::new(172, 16, 0, 5),
                51000,
                Ipv4Addr::new(192, 0, 2, 80),
                443,
            ),
            sentinel: Bytes::from_static(b"\x01\x02\x03\x04\x05\x06\x07\x08"),
        }
    }

    #[test]
    fn notice_layout_is_network_order() {
        let bytes = notice().encode();
        assert_eq!(&bytes[..4], &NOTIFICATION_MAGIC);
        assert_eq!(&bytes[4..8], &[172, 16, 0, 5]);
        assert_eq!(&bytes[8..12], &[192, 0, 2, 80]);
        assert_eq!(&bytes[12..14], &51000u16.to_be_bytes());
        assert_eq!(&bytes[14..16], &443u16.to_be_bytes());
        assert_eq!(&bytes[16..18], &[0, 8]);
        assert_eq!(bytes.len(), NOTIFICATION_HEADER_LEN + 8);
        assert_eq!(SeenFlowNotice::decode(&bytes), Ok(notice()));
    }

    #[test]
    fn decode_rejects_bad_magic_and_length() {
        let mut bytes = notice().encode();
        bytes.push(0);
        assert_eq!(
            SeenFlowNotice::decode(&bytes),
            Err(NoticeError::LengthMismatch {
                declared: 8,
                actual: 9
            })
        );
        bytes[0] = 0;
        assert_eq!(SeenFlowNotice::decode(&bytes), Err(NoticeError::NotANotice));
        assert_eq!(SeenFlowNotice::decode(&[0xBA, 0xAD]), Err(NoticeError::NotANotice));
    }

    #[test]
    fn outbound_packet_is_addressed_to_decoy() {
        let packet = build_notification_packet(&settings(), &notice(), 77, 63).unwrap();
        let ipv4 = parse_ipv4_packet(&packet).unwrap();
        assert_eq!(ipv4.source_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ipv4.destination_addr(), Ipv4Addr::new(192, 0, 2, 80));
        assert_eq!(ipv4.identification, 77);
        assert_eq!(ipv4.ttl, 63);
        let udp = parse_udp_datagram(ipv4.payload).unwrap();
        assert_eq!(udp.source_port, 51000);
        assert_eq!(udp.destination_port, 4000);
        assert_eq!(udp.payload, notice().encode().as_slice());
    }

    #[test]
    fn inbound_verdicts() {
        let peer = NotificationSettings {
            port: 4000,
            local_addr: Ipv4Addr::new(10, 0, 0, 99),
        };
        let packet = build_notification_packet(&peer, &notice(), 1, 64).unwrap();

        assert_eq!(
            inspect_notification(&settings(), &packet),
            NoticeVerdict::Accept(notice())
        );
        // Sent by ourselves.
        assert_eq!(inspect_notification(&peer, &packet), NoticeVerdict::Drop);
        // Different port.
        let other = NotificationSettings {
            port: 4001,
            ..settings()
        };
        assert_eq!(inspect_notification(&other, &packet), NoticeVerdict::Ignore);

        let stray = build_ipv4_udp(&UdpPacketSpec {
            source: Ipv4Addr::new(10, 0, 0, 99),
            destination: Ipv4Addr::new(10, 0, 0, 1),
            source_port: 9,
            destination_port: 4000,
            identification: 0,
            ttl: 64,
            payload: b"hello",
        })
        .unwrap();
        assert_eq!(inspect_notification(&settings(), &stray), NoticeVerdict::Pass);
    }
}
