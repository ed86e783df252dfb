#![forbid(unsafe_code)]

//! Sentinel detection for a decoy router.
//!
//! A [`SentinelDetector`] follows each TCP flow to a decoy port through its
//! handshake and first client data, looks for the sentinel a cooperating
//! client hid there, and decides whether the flow is handed to the decoy
//! proxy. A [`DetectorRegistry`] groups the detectors of one router and is
//! what the control channel updates.

mod blacklist;
mod detector;
mod filter;
mod flow;
mod icmp;
mod notify;
mod reassembly;
mod registry;
mod seen;
mod types;
mod variant;

pub use blacklist::*;
pub use detector::*;
pub use filter::*;
pub use flow::*;
pub use icmp::*;
pub use notify::*;
pub use reassembly::*;
pub use registry::*;
pub use seen::*;
pub use types::*;
pub use variant::*;
