#![forbid(unsafe_code)]

use crate::message::check_random;
use crate::wire::{
    FLOW_FLAG_TO_CLIENT, FLOW_TUPLE_LEN, FlowTuple, HEADER_LEN, Header, Operation,
    REDIRECT_HEADER_LEN, TLS_FLOW_LEN,
};
use crate::CodecError;
use bytes::{BufMut, Bytes};
use decoy_core::{FlowKey, RedirectedFlow};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An encoded message as a list of buffers, written back to back.
///
/// Packet payloads are carried by reference rather than copied behind the
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    parts: Vec<Bytes>,
}

impl OutboundMessage {
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One contiguous copy of the message.
    pub fn to_bytes(&self) -> Bytes {
        match self.parts.as_slice() {
            [single] => single.clone(),
            parts => Bytes::from(parts.concat()),
        }
    }
}

/// Frames router-to-proxy messages and keeps the heartbeat schedule.
#[derive(Debug)]
pub struct Encoder {
    heartbeat: Option<Duration>,
    next_ping: Option<Instant>,
}

impl Encoder {
    /// `heartbeat_secs == 0` disables the ping.
    pub fn new(heartbeat_secs: u64) -> Self {
        Encoder {
            heartbeat: (heartbeat_secs > 0).then(|| Duration::from_secs(heartbeat_secs)),
            next_ping: None,
        }
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        self.heartbeat
    }

    /// Wrap a packet for the redirect interface.
    pub fn forward(&self, payload: Bytes) -> Result<OutboundMessage, CodecError> {
        let mut head = block(HEADER_LEN)?;
        Header::request(Operation::Forward, payload.len() as u64).encode(&mut head);
        Ok(OutboundMessage {
            parts: vec![Bytes::from(head), payload],
        })
    }

    /// Hand a confirmed flow to the proxy: handshake options first, then
    /// every packet buffered for the flow.
    pub fn redirect_flow(&self, flow: &RedirectedFlow) -> Result<OutboundMessage, CodecError> {
        let syn_len = option_len("syn", &flow.syn_options)?;
        let ack_len = option_len("ack", &flow.ack_options)?;
        let head_len = HEADER_LEN + REDIRECT_HEADER_LEN + flow.syn_options.len() + flow.ack_options.len();
        let packets_len: usize = flow.packets.iter().map(Bytes::len).sum();

        let mut head = block(head_len)?;
        Header::request(
            Operation::RedirectFlow,
            (head_len + packets_len - HEADER_LEN) as u64,
        )
        .encode(&mut head);
        head.put_u16(0);
        head.put_u8(syn_len);
        head.put_u8(ack_len);
        head.put_slice(&flow.syn_options);
        head.put_slice(&flow.ack_options);

        let mut parts = Vec::with_capacity(flow.packets.len() + 1);
        parts.push(Bytes::from(head));
        parts.extend(flow.packets.iter().cloned());
        debug!(
            flow = %flow.flow,
            packets = flow.packets.len(),
            bytes = packets_len,
            "encoded redirect-flow"
        );
        Ok(OutboundMessage { parts })
    }

    pub fn tls_established(
        &self,
        flow: &FlowKey,
        random: &[u8],
    ) -> Result<OutboundMessage, CodecError> {
        let random = check_random(random)?;
        let mut head = block(HEADER_LEN + TLS_FLOW_LEN)?;
        Header::request(Operation::TlsFlowEstablished, TLS_FLOW_LEN as u64).encode(&mut head);
        FlowTuple::tcp(*flow).encode(&mut head);
        head.put_slice(random);
        Ok(OutboundMessage {
            parts: vec![Bytes::from(head)],
        })
    }

    /// Hand an ICMP error about a redirected flow to the proxy.
    pub fn icmp(
        &self,
        flow: &FlowKey,
        to_client: bool,
        packet: Bytes,
    ) -> Result<OutboundMessage, CodecError> {
        let mut head = block(HEADER_LEN + FLOW_TUPLE_LEN)?;
        Header::request(Operation::Icmp, (FLOW_TUPLE_LEN + packet.len()) as u64).encode(&mut head);
        let flags = if to_client { FLOW_FLAG_TO_CLIENT } else { 0 };
        FlowTuple {
            flags,
            ..FlowTuple::tcp(*flow)
        }
        .encode(&mut head);
        Ok(OutboundMessage {
            parts: vec![Bytes::from(head), packet],
        })
    }

    pub fn ping(&self) -> Result<OutboundMessage, CodecError> {
        let mut head = block(HEADER_LEN)?;
        Header::request(Operation::Ping, 0).encode(&mut head);
        Ok(OutboundMessage {
            parts: vec![Bytes::from(head)],
        })
    }

    /// Heartbeat due at `now`, if any.
    ///
    /// The first poll sends at once; later pings follow one interval after
    /// the previous attempt, whether or not it could be encoded.
    pub fn poll_heartbeat(&mut self, now: Instant) -> Option<OutboundMessage> {
        let interval = self.heartbeat?;
        if self.next_ping.is_some_and(|due| now < due) {
            return None;
        }
        self.next_ping = Some(now + interval);
        match self.ping() {
            Ok(message) => {
                debug!("sending control ping");
                Some(message)
            }
            Err(err) => {
                warn!(error = %err, "skipping control ping");
                None
            }
        }
    }
}

fn block(len: usize) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| CodecError::Allocation(len))?;
    Ok(buf)
}

fn option_len(which: &'static str, options: &[u8]) -> Result<u8, CodecError> {
    u8::try_from(options.len()).map_err(|_| CodecError::OptionsTooLong {
        which,
        len: options.len(),
    })
}
