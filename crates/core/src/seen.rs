#![forbid(unsafe_code)]

use crate::FlowKey;
use bytes::Bytes;
use std::collections::HashMap;

/// Sentinels that a peer router already confirmed, keyed by flow.
///
/// Filled only from inbound seen-flow notifications; entries are never
/// evicted.
#[derive(Debug, Default)]
pub struct SeenFlowCache {
    flows: HashMap<FlowKey, Bytes>,
}

impl SeenFlowCache {
    pub fn new() -> Self {
        SeenFlowCache::default()
    }

    pub fn insert(&mut self, key: FlowKey, sentinel: Bytes) {
        self.flows.insert(key, sentinel);
    }

    pub fn get(&self, key: &FlowKey) -> Option<&Bytes> {
        self.flows.get(key)
    }

    /// True when the recorded sentinel for `key` is a prefix of `candidate`.
    pub fn matches(&self, key: &FlowKey, candidate: &[u8]) -> bool {
        self.flows
            .get(key)
            .is_some_and(|seen| candidate.starts_with(seen))
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
