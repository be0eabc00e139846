//! Negotiation pipeline.
//!
//! Every inbound packet is offered to each [`ExtProcessor`] in a fixed order:
//! handshake, stream features, STARTTLS, SASL, bind. A processor returns
//! `true` when it claimed the packet; claimed packets never reach the routing
//! fabric. Output collected by a processor is written to the session before
//! the next processor runs.
//!
//! Processors keep no state of their own. Anything that must outlive a
//! packet is stored in the session's [`SessionData`](crate::session::SessionData).

mod bind;
mod handshake;
mod sasl;
mod starttls;
mod stream_features;

use std::collections::VecDeque;
use std::sync::Arc;

use minidom::Element;
use tracing::warn;

pub use bind::BindProcessor;
pub use handshake::{handshake_digest, HandshakeProcessor};
pub use sasl::SaslProcessor;
pub use starttls::StartTlsProcessor;
pub use stream_features::StreamFeaturesProcessor;

use crate::error::{generate_iq_error, StanzaErrorCondition};
use crate::packet::Packet;
use crate::parser::ns;
use crate::protocol::ProtocolHandler;
use crate::session::SessionRef;

/// Processor ids, in pipeline order.
pub mod ids {
    pub const HANDSHAKE: &str = "handshake";
    pub const STREAM_FEATURES: &str = "stream-features";
    pub const STARTTLS: &str = "starttls";
    pub const SASL: &str = "sasl";
    pub const BIND: &str = "bind";
}

/// One step of the negotiation pipeline.
pub trait ExtProcessor: Send + Sync {
    /// Stable identifier used for lookups.
    fn id(&self) -> &'static str;

    /// Offer a packet to this step. Returns `true` if the packet was consumed.
    fn process(
        &self,
        packet: &Packet,
        session: &SessionRef,
        handler: &dyn ProtocolHandler,
        results: &mut VecDeque<Packet>,
    ) -> bool;

    /// Start this step on our own initiative (outbound negotiation, bind pass).
    fn start_processing(
        &self,
        packet: Option<&Packet>,
        session: &SessionRef,
        handler: &dyn ProtocolHandler,
        results: &mut VecDeque<Packet>,
    ) {
        let _ = (packet, session, handler, results);
    }

    /// Called once when an outbound session is established.
    fn on_session_started(&self, session: &SessionRef) -> Option<Packet> {
        let _ = session;
        None
    }

    /// Features this step advertises to the peer.
    fn stream_features(&self, session: &SessionRef, handler: &dyn ProtocolHandler) -> Vec<Element> {
        let _ = (session, handler);
        Vec::new()
    }
}

/// Ordered processor list.
#[derive(Clone)]
pub struct ProcessorPipeline {
    processors: Vec<Arc<dyn ExtProcessor>>,
}

impl ProcessorPipeline {
    /// The fixed pipeline used for every session.
    pub fn standard() -> Self {
        Self {
            processors: vec![
                Arc::new(HandshakeProcessor),
                Arc::new(StreamFeaturesProcessor),
                Arc::new(StartTlsProcessor),
                Arc::new(SaslProcessor),
                Arc::new(BindProcessor),
            ],
        }
    }

    /// A pipeline with a custom processor list.
    pub fn with_processors(processors: Vec<Arc<dyn ExtProcessor>>) -> Self {
        Self { processors }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ExtProcessor>> {
        self.processors.iter()
    }

    /// Look up a processor by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn ExtProcessor>> {
        self.processors.iter().find(|p| p.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.id()).collect()
    }

    /// Features advertised by all processors, in pipeline order.
    pub fn stream_features(
        &self,
        session: &SessionRef,
        handler: &dyn ProtocolHandler,
    ) -> Vec<Element> {
        self.processors
            .iter()
            .flat_map(|p| p.stream_features(session, handler))
            .collect()
    }
}

impl std::fmt::Debug for ProcessorPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

/// Compare two byte strings in constant time.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Default namespace of the session's stream.
pub(crate) fn stream_ns(session: &SessionRef) -> String {
    session
        .data()
        .xmlns()
        .unwrap_or_else(|| ns::COMPONENT_ACCEPT.to_string())
}

/// Build an IQ error reply for `request`.
pub(crate) fn iq_error(
    request: &Packet,
    session: &SessionRef,
    condition: StanzaErrorCondition,
    text: Option<&str>,
) -> Option<Packet> {
    let xml = generate_iq_error(
        request.id().unwrap_or_default(),
        request.from(),
        request.to(),
        condition,
        condition.default_type(),
        text,
    );
    match Packet::parse(&xml, &stream_ns(session)) {
        Ok(packet) => Some(packet),
        Err(e) => {
            warn!(error = %e, "Failed to build IQ error reply");
            None
        }
    }
}

/// Build an IQ result reply for `request`.
pub(crate) fn iq_result(request: &Packet, session: &SessionRef) -> Packet {
    let mut builder = Element::builder("iq", stream_ns(session)).attr("type", "result");
    if let Some(id) = request.id() {
        builder = builder.attr("id", id);
    }
    if let Some(from) = request.from() {
        builder = builder.attr("to", from);
    }
    if let Some(to) = request.to() {
        builder = builder.attr("from", to);
    }
    Packet::new(builder.build())
}
