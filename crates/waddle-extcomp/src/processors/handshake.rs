//! Legacy XEP-0114 handshake.

use std::collections::VecDeque;

use minidom::Element;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::{constant_time_eq, ids, stream_ns, ExtProcessor};
use crate::error::{generate_stream_error, stream_errors};
use crate::packet::Packet;
use crate::parser::ns;
use crate::protocol::ProtocolHandler;
use crate::session::{write_packets, ConnectionDirection, SessionRef};

/// Hex SHA-1 of stream id followed by the shared secret.
pub fn handshake_digest(stream_id: &str, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(stream_id.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Verifies (accept side) or completes (connect side) the `<handshake/>`
/// exchange.
#[derive(Debug, Default)]
pub struct HandshakeProcessor;

impl HandshakeProcessor {
    fn is_handshake(packet: &Packet) -> bool {
        packet.name() == "handshake"
            && matches!(
                packet.ns().as_str(),
                ns::COMPONENT_ACCEPT | ns::COMPONENT_CONNECT
            )
    }

    fn reject(session: &SessionRef, reason: &str) {
        warn!(session_id = %session.unique_id(), reason, "Component handshake rejected");
        crate::metrics::record_auth_attempt("handshake", false);
        let error = generate_stream_error(stream_errors::NOT_AUTHORIZED, Some(reason));
        if let Err(e) = session.write_raw(&error) {
            debug!(error = %e, "Failed to write handshake rejection");
        }
        session.stop();
    }

    fn verify(
        &self,
        packet: &Packet,
        session: &SessionRef,
        handler: &dyn ProtocolHandler,
        results: &mut VecDeque<Packet>,
    ) {
        let state = session.data().snapshot();

        let (Some(stream_id), Some(item), Some(hostname)) =
            (state.stream_id, state.repo_item, state.hostname)
        else {
            Self::reject(session, "Handshake before stream open");
            return;
        };

        let expected = handshake_digest(&stream_id, &item.secret);
        let received = packet.element().text().trim().to_ascii_lowercase();

        if !constant_time_eq(expected.as_bytes(), received.as_bytes()) {
            Self::reject(session, "Invalid handshake");
            return;
        }

        crate::metrics::record_auth_attempt("handshake", true);
        info!(
            session_id = %session.unique_id(),
            domain = %hostname,
            "Component handshake accepted"
        );

        results.push_back(Packet::new(
            Element::builder("handshake", stream_ns(session)).build(),
        ));
        // The acknowledgement must precede anything `authenticated` sends.
        write_packets(session, results);
        handler.authenticated(&hostname, session);
    }
}

impl ExtProcessor for HandshakeProcessor {
    fn id(&self) -> &'static str {
        ids::HANDSHAKE
    }

    fn process(
        &self,
        packet: &Packet,
        session: &SessionRef,
        handler: &dyn ProtocolHandler,
        results: &mut VecDeque<Packet>,
    ) -> bool {
        if !Self::is_handshake(packet) {
            return false;
        }

        if session.data().is_authenticated() {
            debug!(session_id = %session.unique_id(), "Ignoring handshake on authenticated stream");
            return true;
        }

        match session.direction() {
            ConnectionDirection::Accept => self.verify(packet, session, handler, results),
            ConnectionDirection::Connect => match session.data().hostname() {
                Some(hostname) => {
                    crate::metrics::record_auth_attempt("handshake", true);
                    info!(
                        session_id = %session.unique_id(),
                        domain = %hostname,
                        "Handshake acknowledged by peer"
                    );
                    handler.authenticated(&hostname, session);
                }
                None => Self::reject(session, "Handshake acknowledged without hostname"),
            },
        }
        true
    }
}
