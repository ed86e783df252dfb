#![forbid(unsafe_code)]

use crate::FlowKey;
use packet_parser::{
    IpProtocol, TCP_MIN_HEADER_LEN, parse_icmpv4_packet, parse_ipv4_packet, parse_quoted_ipv4,
    parse_tcp_ports,
};
use tracing::debug;

pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMP_PARAMETER_PROBLEM: u8 = 12;

fn is_error_type(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        ICMP_DEST_UNREACHABLE | ICMP_REDIRECT | ICMP_TIME_EXCEEDED | ICMP_PARAMETER_PROBLEM
    )
}

/// The TCP 4-tuple quoted by an ICMP error, oriented as the quoted packet.
///
/// `None` for anything that is not an unfragmented ICMP error quoting a
/// first fragment with a full TCP header.
pub fn quoted_flow(packet: &[u8]) -> Option<FlowKey> {
    let ipv4 = parse_ipv4_packet(packet).ok()?;
    if ipv4.protocol != IpProtocol::Icmpv4 || ipv4.is_fragment() {
        return None;
    }
    let icmp = parse_icmpv4_packet(ipv4.payload).ok()?;
    if !is_error_type(icmp.icmp_type) {
        return None;
    }
    let quoted = match parse_quoted_ipv4(icmp.payload) {
        Ok(quoted) => quoted,
        Err(err) => {
            debug!(?err, "ICMP error does not quote an IP header");
            return None;
        }
    };
    if quoted.protocol != IpProtocol::Tcp {
        return None;
    }
    if !quoted.is_first_fragment() {
        debug!("ICMP error quotes a non-first fragment");
        return None;
    }
    if quoted.payload.len() < TCP_MIN_HEADER_LEN {
        debug!("ICMP error does not quote a full TCP header");
        return None;
    }
    let (src_port, dst_port) = parse_tcp_ports(quoted.payload).ok()?;
    Some(FlowKey::new(
        quoted.source_addr(),
        src_port,
        quoted.destination_addr(),
        dst_port,
    ))
}
