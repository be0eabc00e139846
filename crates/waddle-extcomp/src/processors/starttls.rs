//! STARTTLS negotiation (RFC 6120 Section 5).

use std::collections::VecDeque;

use minidom::Element;
use tracing::{debug, info, warn};

use super::{ids, ExtProcessor};
use crate::packet::Packet;
use crate::parser::ns;
use crate::protocol::ProtocolHandler;
use crate::session::{SessionRef, TlsRole};

#[derive(Debug, Default)]
pub struct StartTlsProcessor;

impl StartTlsProcessor {
    fn tls_element(name: &str) -> Packet {
        Packet::new(Element::builder(name, ns::TLS).build())
    }

    fn write_or_log(session: &SessionRef, packet: &Packet) {
        if let Err(e) = session.write_packet(packet) {
            debug!(session_id = %session.unique_id(), error = %e, "Failed to write TLS reply");
        }
    }
}

impl ExtProcessor for StartTlsProcessor {
    fn id(&self) -> &'static str {
        ids::STARTTLS
    }

    fn process(
        &self,
        packet: &Packet,
        session: &SessionRef,
        handler: &dyn ProtocolHandler,
        _results: &mut VecDeque<Packet>,
    ) -> bool {
        if packet.ns() != ns::TLS {
            return false;
        }

        match packet.name() {
            "starttls" => {
                if !session.can_start_tls() || session.is_tls_active() {
                    warn!(session_id = %session.unique_id(), "STARTTLS requested but unavailable");
                    Self::write_or_log(session, &Self::tls_element("failure"));
                    if let Err(e) = session.write_raw("</stream:stream>") {
                        debug!(error = %e, "Failed to close stream");
                    }
                    session.stop();
                    return true;
                }
                // <proceed/> must be on the wire before the handshake starts.
                Self::write_or_log(session, &Self::tls_element("proceed"));
                match session.start_tls(TlsRole::Server) {
                    Ok(()) => info!(session_id = %session.unique_id(), "TLS upgrade requested"),
                    Err(e) => {
                        warn!(session_id = %session.unique_id(), error = %e, "TLS upgrade failed");
                        session.stop();
                    }
                }
            }
            "proceed" => match session.start_tls(TlsRole::Client) {
                Ok(()) => {
                    info!(session_id = %session.unique_id(), "TLS upgrade requested");
                    handler.restart_stream(session);
                }
                Err(e) => {
                    warn!(session_id = %session.unique_id(), error = %e, "TLS upgrade failed");
                    session.stop();
                }
            },
            "failure" => {
                warn!(session_id = %session.unique_id(), "Peer refused STARTTLS");
                session.stop();
            }
            other => debug!(element = other, "Ignoring unexpected TLS element"),
        }
        true
    }

    fn start_processing(
        &self,
        _packet: Option<&Packet>,
        session: &SessionRef,
        _handler: &dyn ProtocolHandler,
        results: &mut VecDeque<Packet>,
    ) {
        debug!(session_id = %session.unique_id(), "Requesting STARTTLS");
        results.push_back(Self::tls_element("starttls"));
    }

    fn stream_features(&self, session: &SessionRef, _handler: &dyn ProtocolHandler) -> Vec<Element> {
        if session.can_start_tls() && !session.is_tls_active() {
            vec![Element::builder("starttls", ns::TLS).build()]
        } else {
            Vec::new()
        }
    }
}
