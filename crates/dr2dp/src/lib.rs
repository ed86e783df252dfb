#![forbid(unsafe_code)]

//! DR2DP, the control channel between the decoy router and the decoy proxy.
//!
//! Inbound bytes go through a [`Decoder`] and a [`ControlDispatcher`] that
//! applies filter, blacklist and remove-flow updates to a
//! [`decoy_core::ControlTarget`]. Outbound messages are framed by an
//! [`Encoder`].

mod decoder;
mod dispatch;
mod encoder;
mod error;
mod message;
pub mod wire;

pub use decoder::*;
pub use dispatch::*;
pub use encoder::*;
pub use error::*;
pub use message::*;
