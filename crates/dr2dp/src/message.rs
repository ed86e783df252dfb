#![forbid(unsafe_code)]

use crate::wire::{
    FILTER_HEADER_LEN, FLOW_FLAG_TO_CLIENT, FLOW_TUPLE_LEN, FlowTuple, Header, Operation,
    PROTOCOL_VERSION, REDIRECT_HEADER_LEN, SERVER_RANDOM_LEN, TLS_FLOW_LEN,
};
use crate::CodecError;
use bytes::{Buf, Bytes};
use decoy_core::{FilterError, FlowKey, MAX_HASH_SIZE};

/// One complete control message: header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn operation(&self) -> Option<Operation> {
        Operation::from_raw(self.header.operation)
    }

    /// Interpret the payload according to the operation code.
    pub fn message(&self) -> Result<ControlMessage, CodecError> {
        ControlMessage::parse(&self.header, self.payload.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Ping,
    Forward(Bytes),
    RedirectFlow {
        syn_options: Bytes,
        ack_options: Bytes,
        /// Concatenated IPv4 packets of the flow.
        packets: Bytes,
    },
    SentinelFilter {
        hash_size: u16,
        salts: Vec<u32>,
    },
    RemoveFlow(FlowKey),
    TlsEstablished {
        flow: FlowKey,
        random: Bytes,
    },
    /// Contents come from the configured blacklist file.
    DhBlacklist,
    Icmp {
        flow: FlowKey,
        to_client: bool,
        packet: Bytes,
    },
}

impl ControlMessage {
    pub fn parse(header: &Header, payload: Bytes) -> Result<Self, CodecError> {
        if header.protocol != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(header.protocol));
        }
        let operation = Operation::from_raw(header.operation)
            .ok_or(CodecError::UnknownOperation(header.operation))?;
        match operation {
            Operation::Ping => {
                require_request(header)?;
                Ok(ControlMessage::Ping)
            }
            Operation::Forward => {
                require_request(header)?;
                Ok(ControlMessage::Forward(payload))
            }
            Operation::SentinelFilter => parse_filter(payload),
            Operation::RemoveFlow => {
                require_request(header)?;
                let tuple = FlowTuple::decode(&payload)?;
                Ok(ControlMessage::RemoveFlow(tuple.flow))
            }
            Operation::DhBlacklist => Ok(ControlMessage::DhBlacklist),
            Operation::RedirectFlow => parse_redirect(payload),
            Operation::TlsFlowEstablished => {
                require_len("tls-flow-established", &payload, TLS_FLOW_LEN)?;
                let tuple = FlowTuple::decode(&payload)?;
                Ok(ControlMessage::TlsEstablished {
                    flow: tuple.flow,
                    random: payload.slice(FLOW_TUPLE_LEN..TLS_FLOW_LEN),
                })
            }
            Operation::Icmp => {
                let tuple = FlowTuple::decode(&payload)?;
                Ok(ControlMessage::Icmp {
                    flow: tuple.flow,
                    to_client: tuple.flags & FLOW_FLAG_TO_CLIENT != 0,
                    packet: payload.slice(FLOW_TUPLE_LEN..),
                })
            }
        }
    }
}

fn require_request(header: &Header) -> Result<(), CodecError> {
    if header.is_request() {
        Ok(())
    } else {
        Err(CodecError::NotARequest {
            operation: header.operation,
            message_type: header.message_type,
        })
    }
}

fn require_len(what: &'static str, payload: &[u8], needed: usize) -> Result<(), CodecError> {
    if payload.len() < needed {
        return Err(CodecError::Truncated {
            what,
            needed,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn parse_filter(payload: Bytes) -> Result<ControlMessage, CodecError> {
    require_len("sentinel-filter", &payload, FILTER_HEADER_LEN)?;
    let mut buf = &payload[..];
    let hash_size = buf.get_u16();
    let declared = buf.get_u16() as usize;
    if buf.len() != declared * 4 {
        return Err(FilterError::SaltCountMismatch {
            declared,
            actual: buf.len() / 4,
        }
        .into());
    }
    if hash_size > MAX_HASH_SIZE {
        return Err(FilterError::HashSizeOutOfRange(hash_size).into());
    }
    let salts = (0..declared).map(|_| buf.get_u32()).collect();
    Ok(ControlMessage::SentinelFilter { hash_size, salts })
}

fn parse_redirect(payload: Bytes) -> Result<ControlMessage, CodecError> {
    require_len("redirect-flow", &payload, REDIRECT_HEADER_LEN)?;
    let syn_len = payload[2] as usize;
    let ack_len = payload[3] as usize;
    let options_end = REDIRECT_HEADER_LEN + syn_len + ack_len;
    require_len("redirect-flow options", &payload, options_end)?;
    Ok(ControlMessage::RedirectFlow {
        syn_options: payload.slice(REDIRECT_HEADER_LEN..REDIRECT_HEADER_LEN + syn_len),
        ack_options: payload.slice(REDIRECT_HEADER_LEN + syn_len..options_end),
        packets: payload.slice(options_end..),
    })
}

/// Server random carried by a TLS established message.
pub fn check_random(random: &[u8]) -> Result<&[u8], CodecError> {
    random
        .get(..SERVER_RANDOM_LEN)
        .ok_or(CodecError::ShortRandom(random.len()))
}
