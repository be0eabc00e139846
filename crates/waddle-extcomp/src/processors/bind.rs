//! Extra hostname binding on an authenticated component stream.
//!
//! ```xml
//! <iq type='set' id='b1'>
//!   <bind xmlns='urn:xmpp:component:bind:0'><hostname>extra.example.com</hostname></bind>
//! </iq>
//! ```
//!
//! `<unbind/>` with the same payload releases a hostname. Either side may
//! send these; replies to our own requests are only logged.

use std::collections::VecDeque;

use jid::Jid;
use minidom::Element;
use tracing::{debug, info, warn};

use super::{ids, iq_error, iq_result, stream_ns, ExtProcessor};
use crate::error::StanzaErrorCondition;
use crate::packet::Packet;
use crate::parser::ns;
use crate::protocol::ProtocolHandler;
use crate::session::SessionRef;

const PENDING_PREFIX: &str = "bind.pending.";

#[derive(Debug, Default)]
pub struct BindProcessor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindAction {
    Bind,
    Unbind,
}

impl BindProcessor {
    fn action(packet: &Packet) -> Option<(BindAction, &Element)> {
        if packet.name() != "iq" {
            return None;
        }
        let element = packet.element();
        if let Some(child) = element.get_child("bind", ns::BIND) {
            return Some((BindAction::Bind, child));
        }
        element
            .get_child("unbind", ns::BIND)
            .map(|child| (BindAction::Unbind, child))
    }

    fn hostname(payload: &Element) -> Option<String> {
        let text = payload
            .get_child("hostname", ns::BIND)?
            .text()
            .trim()
            .to_lowercase();
        match Jid::new(&text) {
            Ok(jid) if jid.node().is_none() && jid.resource().is_none() => Some(text),
            _ => None,
        }
    }

    fn handle_response(packet: &Packet, session: &SessionRef) {
        let key = format!("{}{}", PENDING_PREFIX, packet.id().unwrap_or_default());
        let pending = session.data().update(|state| state.values.remove(&key));
        match (pending, packet.attr("type")) {
            (Some(hostname), Some("result")) => {
                info!(session_id = %session.unique_id(), hostname = %hostname, "Peer bound hostname")
            }
            (Some(hostname), _) => {
                warn!(session_id = %session.unique_id(), hostname = %hostname, "Peer refused hostname binding")
            }
            (None, _) => debug!(session_id = %session.unique_id(), "Unsolicited bind response"),
        }
    }
}

impl ExtProcessor for BindProcessor {
    fn id(&self) -> &'static str {
        ids::BIND
    }

    fn process(
        &self,
        packet: &Packet,
        session: &SessionRef,
        handler: &dyn ProtocolHandler,
        results: &mut VecDeque<Packet>,
    ) -> bool {
        let Some((action, payload)) = Self::action(packet) else {
            if packet.name() == "iq"
                && matches!(packet.attr("type"), Some("result") | Some("error"))
                && session
                    .data()
                    .value(&format!("{}{}", PENDING_PREFIX, packet.id().unwrap_or_default()))
                    .is_some()
            {
                Self::handle_response(packet, session);
                return true;
            }
            return false;
        };

        match packet.attr("type") {
            Some("set") => {}
            Some("result") | Some("error") => {
                Self::handle_response(packet, session);
                return true;
            }
            _ => {
                results.extend(iq_error(packet, session, StanzaErrorCondition::BadRequest, None));
                return true;
            }
        }

        if !session.data().is_authenticated() {
            warn!(session_id = %session.unique_id(), "Bind request on unauthenticated stream");
            results.extend(iq_error(
                packet,
                session,
                StanzaErrorCondition::NotAuthorized,
                Some("Stream is not authenticated"),
            ));
            return true;
        }

        let Some(hostname) = Self::hostname(payload) else {
            results.extend(iq_error(
                packet,
                session,
                StanzaErrorCondition::BadRequest,
                Some("Missing or invalid hostname"),
            ));
            return true;
        };

        match action {
            BindAction::Bind => handler.bind_hostname(&hostname, session),
            BindAction::Unbind => handler.unbind_hostname(&hostname, session),
        }
        results.push_back(iq_result(packet, session));
        true
    }

    fn start_processing(
        &self,
        _packet: Option<&Packet>,
        session: &SessionRef,
        _handler: &dyn ProtocolHandler,
        results: &mut VecDeque<Packet>,
    ) {
        let state = session.data().snapshot();
        let from = state.hostname.clone().unwrap_or_default();
        let stream_ns = stream_ns(session);

        for hostname in &state.bind_hostnames {
            let id = format!("bind-{}", uuid::Uuid::new_v4());
            session
                .data()
                .set_value(&format!("{}{}", PENDING_PREFIX, id), hostname.clone());

            debug!(session_id = %session.unique_id(), hostname = %hostname, "Requesting hostname binding");
            results.push_back(Packet::new(
                Element::builder("iq", stream_ns.clone())
                    .attr("type", "set")
                    .attr("id", id)
                    .attr("from", from.clone())
                    .append(
                        Element::builder("bind", ns::BIND)
                            .append(
                                Element::builder("hostname", ns::BIND)
                                    .append(hostname.clone())
                                    .build(),
                            )
                            .build(),
                    )
                    .build(),
            ));
        }
    }

    fn stream_features(&self, session: &SessionRef, _handler: &dyn ProtocolHandler) -> Vec<Element> {
        if session.data().is_authenticated() {
            vec![Element::builder("bind", ns::BIND).build()]
        } else {
            Vec::new()
        }
    }
}
