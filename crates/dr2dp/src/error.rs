#![forbid(unsafe_code)]

use decoy_core::FilterError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("message of {length} bytes exceeds the {limit} byte limit")]
    Oversized { length: u64, limit: u64 },
    #[error("{what} truncated: need {needed} bytes, have {actual}")]
    Truncated {
        what: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("operation {operation} requires a request, got message type {message_type}")]
    NotARequest { operation: u8, message_type: u8 },
    #[error("unsupported operation {0}")]
    UnknownOperation(u8),
    #[error("reassembled {actual} bytes, header declared {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("{which} option block of {len} bytes does not fit a u8 length")]
    OptionsTooLong { which: &'static str, len: usize },
    #[error("server random of {0} bytes is shorter than 28")]
    ShortRandom(usize),
    #[error("cannot allocate {0} bytes")]
    Allocation(usize),
    #[error(transparent)]
    Filter(#[from] FilterError),
}
