#![forbid(unsafe_code)]

use bytes::Bytes;
use decoy_config::RouterConfig;
use decoy_core::{DetectorRegistry, Emit, SentinelDetector};
use dr2dp::{CodecError, ControlDispatcher, Decoder, Encoder, OutboundMessage};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Something the router wants written out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// An IPv4 packet for the network side.
    Network(Bytes),
    /// A framed message for the control channel.
    Control(OutboundMessage),
}

/// One decoy router: detectors, control-channel codec and timers.
///
/// Each entry point runs to completion and returns what to send; the caller
/// owns the sockets.
#[derive(Debug)]
pub struct Router {
    registry: DetectorRegistry,
    decoder: Decoder,
    dispatcher: ControlDispatcher,
    encoder: Option<Encoder>,
}

impl Router {
    pub fn new(
        registry: DetectorRegistry,
        decoder: Decoder,
        dispatcher: ControlDispatcher,
        encoder: Option<Encoder>,
    ) -> Self {
        Router {
            registry,
            decoder,
            dispatcher,
            encoder,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        let mut registry = DetectorRegistry::new(config.notification);
        for settings in &config.detectors {
            registry.register(SentinelDetector::new(settings.clone(), config.notification));
        }
        let dispatcher = ControlDispatcher::new(
            config.decoder.filter_file.clone(),
            config.decoder.blacklist_file.clone(),
        );
        let encoder = config
            .encoder
            .as_ref()
            .map(|settings| Encoder::new(settings.heartbeat_secs));
        if encoder.is_none() {
            warn!("no redirect encoder configured; confirmed flows will be dropped");
        }
        info!(
            detectors = config.detectors.len(),
            notification = config.notification.is_some(),
            "router ready"
        );
        Router::new(
            registry,
            Decoder::new(config.decoder.max_message_len),
            dispatcher,
            encoder,
        )
    }

    pub fn registry(&self) -> &DetectorRegistry {
        &self.registry
    }

    /// A packet from the network side.
    pub fn on_packet(&mut self, packet: Bytes) -> Vec<Output> {
        let emits = self.registry.process(packet);
        let mut out = Vec::with_capacity(emits.len());
        for emit in emits {
            match emit {
                Emit::Pass(packet) | Emit::Notify(packet) => out.push(Output::Network(packet)),
                other => {
                    if let Some(message) = self.encode(other) {
                        out.push(Output::Control(message));
                    }
                }
            }
        }
        out
    }

    /// Bytes read from the control channel.
    pub fn on_control_chunk(&mut self, chunk: Bytes) -> Vec<Output> {
        self.dispatcher
            .handle_chunk(&mut self.decoder, chunk, &mut self.registry)
            .into_iter()
            .map(Output::Network)
            .collect()
    }

    /// Timer callback: idle sweeps and the heartbeat.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Output> {
        let evicted = self.registry.poll_sweep(now);
        if evicted > 0 {
            debug!(evicted, "idle sweep");
        }
        self.encoder
            .as_mut()
            .and_then(|encoder| encoder.poll_heartbeat(now))
            .map(Output::Control)
            .into_iter()
            .collect()
    }

    fn encode(&self, emit: Emit) -> Option<OutboundMessage> {
        let Some(encoder) = &self.encoder else {
            warn!("dropping redirected traffic: no encoder");
            return None;
        };
        let result: Result<OutboundMessage, CodecError> = match emit {
            Emit::Redirect(packet) => encoder.forward(packet),
            Emit::RedirectFlow(flow) => encoder.redirect_flow(&flow),
            Emit::TlsEstablished { flow, random } => encoder.tls_established(&flow, &random),
            Emit::RedirectIcmp {
                flow,
                packet,
                to_client,
            } => encoder.icmp(&flow, to_client, packet),
            Emit::Pass(_) | Emit::Notify(_) => return None,
        };
        result
            .inspect_err(|err| warn!(error = %err, "cannot encode control message"))
            .ok()
    }
}
