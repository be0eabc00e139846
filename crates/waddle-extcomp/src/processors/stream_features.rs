//! Reacts to `<stream:features/>` on outbound feature-negotiated streams.

use std::collections::VecDeque;

use tracing::debug;

use super::{ids, ExtProcessor};
use crate::packet::Packet;
use crate::parser::ns;
use crate::protocol::ProtocolHandler;
use crate::session::{ConnectionDirection, SessionRef};

/// Picks the next negotiation step from the features the peer offers:
/// STARTTLS first, then SASL. Once authenticated there is nothing left to
/// negotiate; the bind pass already ran from `authenticated`.
#[derive(Debug, Default)]
pub struct StreamFeaturesProcessor;

impl ExtProcessor for StreamFeaturesProcessor {
    fn id(&self) -> &'static str {
        ids::STREAM_FEATURES
    }

    fn process(
        &self,
        packet: &Packet,
        session: &SessionRef,
        handler: &dyn ProtocolHandler,
        results: &mut VecDeque<Packet>,
    ) -> bool {
        if !packet.is("features", ns::STREAM) {
            return false;
        }

        if session.direction() == ConnectionDirection::Accept {
            debug!(session_id = %session.unique_id(), "Ignoring stream features from accepted peer");
            return true;
        }

        let features = packet.element();
        let next = if features.get_child("starttls", ns::TLS).is_some()
            && session.can_start_tls()
            && !session.is_tls_active()
        {
            Some(ids::STARTTLS)
        } else if features.get_child("mechanisms", ns::SASL).is_some()
            && !session.data().is_authenticated()
        {
            Some(ids::SASL)
        } else {
            None
        };

        match next.and_then(|id| handler.processor(id)) {
            Some(processor) => {
                debug!(
                    session_id = %session.unique_id(),
                    step = processor.id(),
                    "Starting negotiation step"
                );
                processor.start_processing(Some(packet), session, handler, results);
            }
            None => debug!(
                session_id = %session.unique_id(),
                authenticated = session.data().is_authenticated(),
                "Feature negotiation complete"
            ),
        }
        true
    }
}
