#![forbid(unsafe_code)]

use crate::wire::{HEADER_LEN, Header, PROTOCOL_VERSION};
use crate::{CodecError, Frame};
use bytes::Bytes;
use tracing::{debug, warn};

/// Default upper bound on a single reassembled message.
pub const DEFAULT_MAX_MESSAGE_LEN: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Idle,
    /// `needed` more bytes complete the header.
    HeaderPending { needed: usize },
    /// `needed` more bytes complete the message.
    PayloadPending { header: Header, needed: u64 },
}

/// Cuts a control-channel byte stream into [`Frame`]s.
///
/// Chunks may split messages anywhere. A partial message is kept as a chain
/// of the chunks that carried it and only copied once it is complete.
#[derive(Debug)]
pub struct Decoder {
    state: DecodeState,
    chain: Vec<Bytes>,
    buffered: usize,
    max_message_len: u64,
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new(DEFAULT_MAX_MESSAGE_LEN)
    }
}

impl Decoder {
    pub fn new(max_message_len: u64) -> Self {
        Decoder {
            state: DecodeState::Idle,
            chain: Vec::new(),
            buffered: 0,
            max_message_len: max_message_len.max(HEADER_LEN as u64),
        }
    }

    /// Bytes held for an incomplete message.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Idle
    }

    /// Feed one chunk; returns every message it completes, in order.
    ///
    /// A header with a bad version or an oversized length ends processing of
    /// the chunk: its remaining bytes are dropped and the decoder returns to
    /// idle, reported as an `Err` after any frames already completed.
    pub fn push(&mut self, mut chunk: Bytes) -> Vec<Result<Frame, CodecError>> {
        let mut out = Vec::new();
        loop {
            match self.state {
                DecodeState::Idle => {
                    if chunk.is_empty() {
                        break;
                    }
                    if chunk.len() < HEADER_LEN {
                        self.state = DecodeState::HeaderPending {
                            needed: HEADER_LEN - chunk.len(),
                        };
                        self.hold(chunk);
                        break;
                    }
                    let header = match self.check_header(&chunk[..HEADER_LEN]) {
                        Ok(header) => header,
                        Err(err) => {
                            out.push(Err(err));
                            break;
                        }
                    };
                    let total = header.total_len();
                    if chunk.len() as u64 >= total {
                        // total fits in the chunk, so it fits in usize
                        let mut message = chunk.split_to(total as usize);
                        out.push(Ok(Frame {
                            header,
                            payload: message.split_off(HEADER_LEN),
                        }));
                        continue;
                    }
                    self.state = DecodeState::PayloadPending {
                        header,
                        needed: total - chunk.len() as u64,
                    };
                    self.hold(chunk);
                    break;
                }
                DecodeState::HeaderPending { needed } => {
                    if chunk.len() < needed {
                        self.state = DecodeState::HeaderPending {
                            needed: needed - chunk.len(),
                        };
                        self.hold(chunk);
                        break;
                    }
                    let mut raw = Vec::with_capacity(HEADER_LEN);
                    for part in &self.chain {
                        raw.extend_from_slice(part);
                    }
                    raw.extend_from_slice(&chunk[..needed]);
                    let header = match self.check_header(&raw) {
                        Ok(header) => header,
                        Err(err) => {
                            self.reset();
                            out.push(Err(err));
                            break;
                        }
                    };
                    debug!(buffered = self.buffered, "reassembled split header");
                    self.state = DecodeState::PayloadPending {
                        header,
                        needed: header.total_len() - self.buffered as u64,
                    };
                }
                DecodeState::PayloadPending { header, needed } => {
                    if (chunk.len() as u64) < needed {
                        self.state = DecodeState::PayloadPending {
                            header,
                            needed: needed - chunk.len() as u64,
                        };
                        self.hold(chunk);
                        break;
                    }
                    let tail = chunk.split_to(needed as usize);
                    self.hold(tail);
                    out.push(self.assemble(header));
                    self.reset();
                }
            }
        }
        out
    }

    fn check_header(&self, raw: &[u8]) -> Result<Header, CodecError> {
        let header = Header::decode(raw)?;
        if header.protocol != PROTOCOL_VERSION {
            warn!(
                protocol = header.protocol,
                "unsupported control protocol version, dropping chunk"
            );
            return Err(CodecError::UnsupportedVersion(header.protocol));
        }
        if header.total_len() > self.max_message_len {
            warn!(
                length = header.total_len(),
                limit = self.max_message_len,
                "control message too large, dropping chunk"
            );
            return Err(CodecError::Oversized {
                length: header.total_len(),
                limit: self.max_message_len,
            });
        }
        Ok(header)
    }

    fn hold(&mut self, chunk: Bytes) {
        self.buffered += chunk.len();
        self.chain.push(chunk);
    }

    fn reset(&mut self) {
        self.state = DecodeState::Idle;
        self.chain.clear();
        self.buffered = 0;
    }

    /// Concatenate the held chain into one contiguous message.
    fn assemble(&mut self, header: Header) -> Result<Frame, CodecError> {
        let expected = header.total_len();
        if self.buffered as u64 != expected {
            warn!(
                expected,
                actual = self.buffered,
                "reassembled control message has the wrong length"
            );
            return Err(CodecError::LengthMismatch {
                expected,
                actual: self.buffered as u64,
            });
        }
        let mut message = Vec::new();
        if message.try_reserve_exact(self.buffered).is_err() {
            warn!(len = self.buffered, "cannot allocate control message");
            return Err(CodecError::Allocation(self.buffered));
        }
        for part in self.chain.drain(..) {
            message.extend_from_slice(&part);
        }
        let mut message = Bytes::from(message);
        Ok(Frame {
            header,
            payload: message.split_off(HEADER_LEN),
        })
    }
}
