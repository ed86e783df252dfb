#![forbid(unsafe_code)]

use std::net::Ipv4Addr;

/// Errors that can occur during parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Truncated(&'static str),
    Invalid(&'static str),
    Unsupported(&'static str),
}

/// Identifies the payload protocol for IP packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    Icmpv4,
    Tcp,
    Udp,
    Other(u8),
}

impl IpProtocol {
    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => IpProtocol::Icmpv4,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match *self {
            IpProtocol::Icmpv4 => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Other(v) => v,
        }
    }
}

pub const TCP_FIN: u16 = 0x01;
pub const TCP_SYN: u16 = 0x02;
pub const TCP_RST: u16 = 0x04;
pub const TCP_PSH: u16 = 0x08;
pub const TCP_ACK: u16 = 0x10;

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const ICMP_HEADER_LEN: usize = 8;

// Bit 0 of the 3-bit flags field.
const IPV4_MORE_FRAGMENTS: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header<'a> {
    pub header_length: usize,
    pub dscp: u8,
    pub ecn: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub header_checksum: u16,
    pub source: [u8; 4],
    pub destination: [u8; 4],
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

impl Ipv4Header<'_> {
    pub fn source_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.source)
    }

    pub fn destination_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.destination)
    }

    /// True for any piece of a fragmented datagram, including the first.
    pub fn is_fragment(&self) -> bool {
        self.fragment_offset != 0 || self.flags & IPV4_MORE_FRAGMENTS != 0
    }

    /// Only the first fragment carries the transport header.
    pub fn is_first_fragment(&self) -> bool {
        self.fragment_offset == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader<'a> {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgement_number: u32,
    pub data_offset: u8,
    pub flags: u16,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    pub options: &'a [u8],
    pub payload: &'a [u8],
}

impl TcpHeader<'_> {
    pub fn has_flags(&self, mask: u16) -> bool {
        self.flags & mask == mask
    }

    pub fn is_syn(&self) -> bool {
        self.flags & TCP_SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & TCP_ACK != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub checksum: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Icmpv4Packet<'a> {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub rest_of_header: u32,
    pub payload: &'a [u8],
}

/// Parse an IPv4 packet, extracting header fields and payload slice.
///
/// Fragments are returned as-is; callers decide what to do with them via
/// [`Ipv4Header::is_fragment`].
pub fn parse_ipv4_packet(data: &[u8]) -> Result<Ipv4Header<'_>, ParseError> {
    let header = parse_ipv4_header(data)?;
    let total_len_usize = header.total_length as usize;
    if data.len() < total_len_usize {
        return Err(ParseError::Truncated("ipv4 total length"));
    }
    Ok(Ipv4Header {
        payload: &data[header.header_length..total_len_usize],
        ..header
    })
}

/// Parse the IPv4 header quoted inside an ICMP error.
///
/// The quoted datagram is usually cut short, so the payload is whatever
/// follows the header rather than `total_length` bytes.
pub fn parse_quoted_ipv4(data: &[u8]) -> Result<Ipv4Header<'_>, ParseError> {
    parse_ipv4_header(data)
}

fn parse_ipv4_header(data: &[u8]) -> Result<Ipv4Header<'_>, ParseError> {
    if data.len() < IPV4_MIN_HEADER_LEN {
        return Err(ParseError::Truncated("ipv4 base header"));
    }
    let version = data[0] >> 4;
    if version != 4 {
        return Err(ParseError::Invalid("ipv4 version"));
    }
    let ihl = data[0] & 0x0F;
    let header_length = (ihl as usize) * 4;
    if header_length < IPV4_MIN_HEADER_LEN {
        return Err(ParseError::Invalid("ipv4 ihl too small"));
    }
    if data.len() < header_length {
        return Err(ParseError::Truncated("ipv4 header with options"));
    }
    let total_length = read_u16(&data[2..4]);
    if total_length < header_length as u16 {
        return Err(ParseError::Invalid("ipv4 total length smaller than header"));
    }

    let flags_fragment = read_u16(&data[6..8]);
    Ok(Ipv4Header {
        header_length,
        dscp: data[1] >> 2,
        ecn: data[1] & 0x03,
        total_length,
        identification: read_u16(&data[4..6]),
        flags: (flags_fragment >> 13) as u8,
        fragment_offset: flags_fragment & 0x1FFF,
        ttl: data[8],
        protocol: IpProtocol::from_raw(data[9]),
        header_checksum: read_u16(&data[10..12]),
        source: copy_array(&data[12..16]),
        destination: copy_array(&data[16..20]),
        options: &data[IPV4_MIN_HEADER_LEN..header_length],
        payload: &data[header_length..],
    })
}

/// Parse a TCP segment.
pub fn parse_tcp_segment(data: &[u8]) -> Result<TcpHeader<'_>, ParseError> {
    if data.len() < TCP_MIN_HEADER_LEN {
        return Err(ParseError::Truncated("tcp base header"));
    }
    let data_offset = data[12] >> 4;
    let header_length = (data_offset as usize) * 4;
    if header_length < TCP_MIN_HEADER_LEN {
        return Err(ParseError::Invalid("tcp data offset too small"));
    }
    if data.len() < header_length {
        return Err(ParseError::Truncated("tcp header with options"));
    }

    Ok(TcpHeader {
        source_port: read_u16(&data[0..2]),
        destination_port: read_u16(&data[2..4]),
        sequence_number: read_u32(&data[4..8]),
        acknowledgement_number: read_u32(&data[8..12]),
        data_offset,
        flags: ((data[12] as u16 & 0x01) << 8) | data[13] as u16,
        window_size: read_u16(&data[14..16]),
        checksum: read_u16(&data[16..18]),
        urgent_pointer: read_u16(&data[18..20]),
        options: &data[TCP_MIN_HEADER_LEN..header_length],
        payload: &data[header_length..],
    })
}

/// Read only the port pair of a (possibly truncated) TCP header.
pub fn parse_tcp_ports(data: &[u8]) -> Result<(u16, u16), ParseError> {
    let ports = data.get(0..4).ok_or(ParseError::Truncated("tcp ports"))?;
    Ok((read_u16(&ports[0..2]), read_u16(&ports[2..4])))
}

/// Parse a UDP datagram.
pub fn parse_udp_datagram(data: &[u8]) -> Result<UdpDatagram<'_>, ParseError> {
    if data.len() < UDP_HEADER_LEN {
        return Err(ParseError::Truncated("udp header"));
    }
    let length = read_u16(&data[4..6]);
    if (length as usize) < UDP_HEADER_LEN {
        return Err(ParseError::Invalid("udp length too small"));
    }
    let expected_len = length as usize;
    if data.len() < expected_len {
        return Err(ParseError::Truncated("udp payload"));
    }
    Ok(UdpDatagram {
        source_port: read_u16(&data[0..2]),
        destination_port: read_u16(&data[2..4]),
        length,
        checksum: read_u16(&data[6..8]),
        payload: &data[UDP_HEADER_LEN..expected_len],
    })
}

/// Parse an ICMPv4 packet.
pub fn parse_icmpv4_packet(data: &[u8]) -> Result<Icmpv4Packet<'_>, ParseError> {
    if data.len() < ICMP_HEADER_LEN {
        return Err(ParseError::Truncated("icmpv4 header"));
    }
    Ok(Icmpv4Packet {
        icmp_type: data[0],
        code: data[1],
        checksum: read_u16(&data[2..4]),
        rest_of_header: read_u32(&data[4..8]),
        payload: &data[ICMP_HEADER_LEN..],
    })
}

/// Fields for a freshly built IPv4/UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacketSpec<'a> {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub source_port: u16,
    pub destination_port: u16,
    pub identification: u16,
    pub ttl: u8,
    pub payload: &'a [u8],
}

/// Build an option-less IPv4 header plus UDP header around `spec.payload`.
///
/// The IPv4 header checksum is filled in; the UDP checksum is left at zero,
/// which IPv4 receivers accept.
pub fn build_ipv4_udp(spec: &UdpPacketSpec<'_>) -> Result<Vec<u8>, ParseError> {
    let udp_len = UDP_HEADER_LEN + spec.payload.len();
    let total = IPV4_MIN_HEADER_LEN + udp_len;
    if total > u16::MAX as usize {
        return Err(ParseError::Invalid("udp datagram too large"));
    }

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&[0x45, 0x00]);
    buf.extend_from_slice(&(total as u16).to_be_bytes());
    buf.extend_from_slice(&spec.identification.to_be_bytes());
    buf.extend_from_slice(&[0x00, 0x00]);
    buf.push(spec.ttl);
    buf.push(IpProtocol::Udp.as_u8());
    buf.extend_from_slice(&[0x00, 0x00]);
    buf.extend_from_slice(&spec.source.octets());
    buf.extend_from_slice(&spec.destination.octets());
    let checksum = ipv4_header_checksum(&buf[..IPV4_MIN_HEADER_LEN]);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());

    buf.extend_from_slice(&spec.source_port.to_be_bytes());
    buf.extend_from_slice(&spec.destination_port.to_be_bytes());
    buf.extend_from_slice(&(udp_len as u16).to_be_bytes());
    buf.extend_from_slice(&[0x00, 0x00]);
    buf.extend_from_slice(spec.payload);
    Ok(buf)
}

/// Internet checksum over a header whose checksum field is zeroed.
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += word as u32;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn read_u16(bytes: &[u8]) -> u16 {
    let mut array = [0u8; 2];
    array.copy_from_slice(bytes);
    u16::from_be_bytes(array)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut array = [0u8; 4];
    array.copy_from_slice(bytes);
    u32::from_be_bytes(array)
}

fn copy_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
