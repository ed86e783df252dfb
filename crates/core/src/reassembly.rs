#![forbid(unsafe_code)]

use bytes::Bytes;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct BufferedSegment {
    packet: Bytes,
    payload: Bytes,
}

/// Client packets retained while the sentinel region is incomplete.
///
/// Segments are keyed by their offset from the first data byte (`isn + 1`),
/// so out-of-order arrivals land in place. The stream is only materialized
/// on demand.
#[derive(Debug, Clone, Default)]
pub struct SegmentBuffer {
    segments: BTreeMap<u32, BufferedSegment>,
    buffered_bytes: usize,
}

impl SegmentBuffer {
    pub fn new() -> Self {
        SegmentBuffer::default()
    }

    /// Retain `packet` whose TCP payload starts at stream `offset`.
    ///
    /// A retransmission at an offset already held replaces the earlier copy
    /// when it carries more data. Returns the payload bytes now buffered.
    pub fn insert(&mut self, offset: u32, packet: Bytes, payload: Bytes) -> usize {
        match self.segments.get_mut(&offset) {
            Some(existing) if existing.payload.len() >= payload.len() => {}
            Some(existing) => {
                self.buffered_bytes = self.buffered_bytes - existing.payload.len() + payload.len();
                *existing = BufferedSegment { packet, payload };
            }
            None => {
                self.buffered_bytes += payload.len();
                self.segments
                    .insert(offset, BufferedSegment { packet, payload });
            }
        }
        self.buffered_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Stream bytes that are contiguous from offset zero.
    pub fn contiguous(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        for (&offset, seg) in &self.segments {
            let offset = offset as usize;
            if offset > pos {
                break;
            }
            let skip = pos - offset;
            if skip < seg.payload.len() {
                out.extend_from_slice(&seg.payload[skip..]);
                pos = offset + seg.payload.len();
            }
        }
        out
    }

    /// Retained packets in stream order.
    pub fn packets(&self) -> Vec<Bytes> {
        self.segments.values().map(|seg| seg.packet.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.buffered_bytes = 0;
    }
}
