#![forbid(unsafe_code)]

use crate::wire::Operation;
use crate::{CodecError, ControlMessage, Decoder, Frame};
use bytes::Bytes;
use decoy_core::{Blacklist, BloomFilter, ControlTarget, SentinelFilter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Applies inbound control messages to the detectors.
///
/// Filter bits and blacklist entries are not carried on the wire; the
/// messages only announce that the configured files changed.
#[derive(Debug, Clone, Default)]
pub struct ControlDispatcher {
    filter_file: Option<PathBuf>,
    blacklist_file: Option<PathBuf>,
}

impl ControlDispatcher {
    pub fn new(filter_file: Option<PathBuf>, blacklist_file: Option<PathBuf>) -> Self {
        ControlDispatcher {
            filter_file,
            blacklist_file,
        }
    }

    pub fn filter_file(&self) -> Option<&Path> {
        self.filter_file.as_deref()
    }

    pub fn blacklist_file(&self) -> Option<&Path> {
        self.blacklist_file.as_deref()
    }

    /// Apply one frame. A forward message yields the payload to put on the
    /// network; everything else yields `None`.
    pub fn dispatch(
        &self,
        frame: &Frame,
        target: &mut dyn ControlTarget,
    ) -> Result<Option<Bytes>, CodecError> {
        let message = frame.message()?;
        match message {
            ControlMessage::Ping => {
                debug!(xid = frame.header.xid, "control ping");
                Ok(None)
            }
            ControlMessage::Forward(payload) => Ok(Some(payload)),
            ControlMessage::SentinelFilter { hash_size, salts } => {
                self.update_filter(hash_size, salts, target);
                Ok(None)
            }
            ControlMessage::RemoveFlow(flow) => {
                let removed = target.remove_flow(&flow);
                info!(%flow, removed, "remove-flow request");
                Ok(None)
            }
            ControlMessage::DhBlacklist => {
                self.update_blacklist(target);
                Ok(None)
            }
            ControlMessage::RedirectFlow { .. }
            | ControlMessage::TlsEstablished { .. }
            | ControlMessage::Icmp { .. } => {
                // Only ever sent by the router.
                Err(CodecError::UnknownOperation(frame.header.operation))
            }
        }
    }

    /// Decode a chunk and apply every message it completes. Failures are
    /// logged and scoped to the message that caused them.
    pub fn handle_chunk(
        &self,
        decoder: &mut Decoder,
        chunk: Bytes,
        target: &mut dyn ControlTarget,
    ) -> Vec<Bytes> {
        let mut forwarded = Vec::new();
        for result in decoder.push(chunk) {
            // The decoder logs its own failures.
            let Ok(frame) = result else { continue };
            match self.dispatch(&frame, target) {
                Ok(Some(payload)) => forwarded.push(payload),
                Ok(None) => {}
                Err(err) => {
                    let operation = frame.operation().map_or("unknown", Operation::as_str);
                    warn!(operation, error = %err, "dropping control message");
                }
            }
        }
        forwarded
    }

    fn update_filter(&self, hash_size: u16, salts: Vec<u32>, target: &mut dyn ControlTarget) {
        let Some(path) = self.filter_file.as_deref() else {
            warn!("sentinel filter update without a configured filter file");
            return;
        };
        let filter = if hash_size == 0 {
            BloomFilter::empty()
        } else {
            match BloomFilter::from_file(path, hash_size, salts) {
                Ok(filter) => filter,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "installing empty sentinel filter");
                    BloomFilter::empty()
                }
            }
        };
        info!(?filter, "installing sentinel filter");
        let filter: Arc<dyn SentinelFilter> = Arc::new(filter);
        target.install_filter(Some(filter));
    }

    fn update_blacklist(&self, target: &mut dyn ControlTarget) {
        let Some(path) = self.blacklist_file.as_deref() else {
            warn!("blacklist update without a configured blacklist file");
            return;
        };
        let blacklist = Blacklist::load(path);
        info!(entries = blacklist.len(), "installing decoy blacklist");
        target.install_blacklist(Arc::new(blacklist));
    }
}
