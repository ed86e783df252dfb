#![forbid(unsafe_code)]

use crate::CodecError;
use bytes::{Buf, BufMut};
use decoy_core::FlowKey;
use std::net::Ipv4Addr;

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 18;
pub const FLOW_TUPLE_LEN: usize = 16;
pub const FILTER_HEADER_LEN: usize = 4;
pub const REDIRECT_HEADER_LEN: usize = 4;
pub const SERVER_RANDOM_LEN: usize = 28;
pub const TLS_FLOW_LEN: usize = FLOW_TUPLE_LEN + SERVER_RANDOM_LEN;

pub const IP_PROTO_TCP: u8 = 6;
/// Flow tuple flag of an ICMP message travelling towards the client.
pub const FLOW_FLAG_TO_CLIENT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
}

impl MessageType {
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Request),
            2 => Some(MessageType::Response),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::Request => 1,
            MessageType::Response => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Ping,
    Forward,
    RedirectFlow,
    SentinelFilter,
    RemoveFlow,
    TlsFlowEstablished,
    DhBlacklist,
    Icmp,
}

impl Operation {
    pub fn from_raw(value: u8) -> Option<Self> {
        Some(match value {
            1 => Operation::Ping,
            2 => Operation::Forward,
            3 => Operation::RedirectFlow,
            4 => Operation::SentinelFilter,
            5 => Operation::RemoveFlow,
            6 => Operation::TlsFlowEstablished,
            7 => Operation::DhBlacklist,
            8 => Operation::Icmp,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Operation::Ping => 1,
            Operation::Forward => 2,
            Operation::RedirectFlow => 3,
            Operation::SentinelFilter => 4,
            Operation::RemoveFlow => 5,
            Operation::TlsFlowEstablished => 6,
            Operation::DhBlacklist => 7,
            Operation::Icmp => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Ping => "ping",
            Operation::Forward => "forward",
            Operation::RedirectFlow => "redirect-flow",
            Operation::SentinelFilter => "sentinel-filter",
            Operation::RemoveFlow => "remove-flow",
            Operation::TlsFlowEstablished => "tls-flow-established",
            Operation::DhBlacklist => "dh-blacklist",
            Operation::Icmp => "icmp",
        }
    }
}

/// Fixed header in front of every control message, network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol: u8,
    pub session_type: u8,
    pub message_type: u8,
    pub operation: u8,
    pub response_code: u16,
    pub xid: u32,
    /// Payload bytes following the header.
    pub data_length: u64,
}

impl Header {
    pub fn request(operation: Operation, data_length: u64) -> Self {
        Header {
            protocol: PROTOCOL_VERSION,
            session_type: 0,
            message_type: MessageType::Request.as_u8(),
            operation: operation.as_u8(),
            response_code: 0,
            xid: 0,
            data_length,
        }
    }

    /// Reads the header fields without judging them.
    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::Truncated {
                what: "header",
                needed: HEADER_LEN,
                actual: buf.len(),
            });
        }
        Ok(Header {
            protocol: buf.get_u8(),
            session_type: buf.get_u8(),
            message_type: buf.get_u8(),
            operation: buf.get_u8(),
            response_code: buf.get_u16(),
            xid: buf.get_u32(),
            data_length: buf.get_u64(),
        })
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.protocol);
        buf.put_u8(self.session_type);
        buf.put_u8(self.message_type);
        buf.put_u8(self.operation);
        buf.put_u16(self.response_code);
        buf.put_u32(self.xid);
        buf.put_u64(self.data_length);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        self.encode(&mut &mut out[..]);
        out
    }

    pub fn is_request(&self) -> bool {
        self.message_type == MessageType::Request.as_u8()
    }

    /// Header plus payload.
    pub fn total_len(&self) -> u64 {
        (HEADER_LEN as u64).saturating_add(self.data_length)
    }
}

/// The 16-byte flow block shared by remove-flow, TLS and ICMP messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    pub flow: FlowKey,
    pub protocol: u8,
    pub flags: u8,
}

impl FlowTuple {
    pub fn tcp(flow: FlowKey) -> Self {
        FlowTuple {
            flow,
            protocol: IP_PROTO_TCP,
            flags: 0,
        }
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < FLOW_TUPLE_LEN {
            return Err(CodecError::Truncated {
                what: "flow tuple",
                needed: FLOW_TUPLE_LEN,
                actual: buf.len(),
            });
        }
        let src_addr = Ipv4Addr::from(buf.get_u32());
        let dst_addr = Ipv4Addr::from(buf.get_u32());
        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let protocol = buf.get_u8();
        let flags = buf.get_u8();
        Ok(FlowTuple {
            flow: FlowKey::new(src_addr, src_port, dst_addr, dst_port),
            protocol,
            flags,
        })
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(u32::from(self.flow.src_addr));
        buf.put_u32(u32::from(self.flow.dst_addr));
        buf.put_u16(self.flow.src_port);
        buf.put_u16(self.flow.dst_port);
        buf.put_u8(self.protocol);
        buf.put_u8(self.flags);
        buf.put_u16(0);
    }
}
