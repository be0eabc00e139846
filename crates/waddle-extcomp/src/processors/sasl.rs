//! SASL PLAIN authentication for feature-negotiated component streams.
//!
//! The component authenticates as its domain (authcid, or authzid when
//! present) with the repository secret as password.

use std::collections::VecDeque;

use base64::prelude::*;
use minidom::Element;
use tracing::{debug, info, warn};

use super::{constant_time_eq, ids, ExtProcessor};
use crate::packet::Packet;
use crate::parser::ns;
use crate::protocol::ProtocolHandler;
use crate::session::{write_packets, ConnectionDirection, SessionRef};
use crate::ExtCompError;

const MECHANISM_PLAIN: &str = "PLAIN";

#[derive(Debug, Default)]
pub struct SaslProcessor;

/// Decoded PLAIN credentials.
#[derive(Debug, PartialEq, Eq)]
struct PlainCredentials {
    domain: String,
    password: String,
}

fn decode_plain(payload: &str) -> Result<PlainCredentials, ExtCompError> {
    let raw = BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| ExtCompError::auth_failed(format!("Invalid base64: {}", e)))?;
    let text = String::from_utf8(raw)
        .map_err(|_| ExtCompError::auth_failed("PLAIN payload is not UTF-8"))?;

    let parts: Vec<&str> = text.split('\0').collect();
    let [authzid, authcid, password] = parts.as_slice() else {
        return Err(ExtCompError::auth_failed(format!(
            "Expected 3 PLAIN fields, got {}",
            parts.len()
        )));
    };
    let domain = if authzid.is_empty() { authcid } else { authzid };
    if domain.is_empty() {
        return Err(ExtCompError::auth_failed("Empty authentication identity"));
    }
    Ok(PlainCredentials {
        domain: domain.to_lowercase(),
        password: password.to_string(),
    })
}

fn encode_plain(domain: &str, secret: &str) -> String {
    BASE64_STANDARD.encode(format!("\0{}\0{}", domain, secret))
}

impl SaslProcessor {
    fn failure(condition: &str) -> Packet {
        Packet::new(
            Element::builder("failure", ns::SASL)
                .append(Element::builder(condition, ns::SASL).build())
                .build(),
        )
    }

    fn fail_and_close(session: &SessionRef, condition: &str) {
        crate::metrics::record_auth_attempt(MECHANISM_PLAIN, false);
        if let Err(e) = session.write_packet(&Self::failure(condition)) {
            debug!(error = %e, "Failed to write SASL failure");
        }
        if let Err(e) = session.write_raw("</stream:stream>") {
            debug!(error = %e, "Failed to close stream");
        }
        session.stop();
    }

    fn handle_auth(
        &self,
        packet: &Packet,
        session: &SessionRef,
        handler: &dyn ProtocolHandler,
        results: &mut VecDeque<Packet>,
    ) {
        if session.data().is_authenticated() {
            results.push_back(Self::failure("aborted"));
            return;
        }

        if packet.attr("mechanism") != Some(MECHANISM_PLAIN) {
            debug!(
                session_id = %session.unique_id(),
                mechanism = ?packet.attr("mechanism"),
                "Unsupported SASL mechanism"
            );
            results.push_back(Self::failure("invalid-mechanism"));
            return;
        }

        let credentials = match decode_plain(&packet.element().text()) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(session_id = %session.unique_id(), error = %e, "Malformed SASL PLAIN payload");
                Self::fail_and_close(session, "malformed-request");
                return;
            }
        };

        let item = handler.repo_item(&credentials.domain);
        let valid = item
            .as_ref()
            .map(|item| constant_time_eq(item.secret.as_bytes(), credentials.password.as_bytes()))
            .unwrap_or(false);

        if !valid {
            warn!(
                session_id = %session.unique_id(),
                domain = %credentials.domain,
                "SASL authentication failed"
            );
            Self::fail_and_close(session, "not-authorized");
            return;
        }

        crate::metrics::record_auth_attempt(MECHANISM_PLAIN, true);
        info!(
            session_id = %session.unique_id(),
            domain = %credentials.domain,
            "SASL authentication succeeded"
        );

        session.data().update(|state| {
            state.repo_item = item;
            state.hostname = Some(credentials.domain.clone());
        });
        results.push_back(Packet::new(Element::builder("success", ns::SASL).build()));
        write_packets(session, results);
        handler.authenticated(&credentials.domain, session);
    }
}

impl ExtProcessor for SaslProcessor {
    fn id(&self) -> &'static str {
        ids::SASL
    }

    fn process(
        &self,
        packet: &Packet,
        session: &SessionRef,
        handler: &dyn ProtocolHandler,
        results: &mut VecDeque<Packet>,
    ) -> bool {
        if packet.ns() != ns::SASL {
            return false;
        }

        match (packet.name(), session.direction()) {
            ("auth", ConnectionDirection::Accept) => {
                self.handle_auth(packet, session, handler, results)
            }
            ("success", ConnectionDirection::Connect) => match session.data().hostname() {
                Some(hostname) => {
                    crate::metrics::record_auth_attempt(MECHANISM_PLAIN, true);
                    info!(session_id = %session.unique_id(), domain = %hostname, "Authenticated to peer");
                    handler.restart_stream(session);
                    handler.authenticated(&hostname, session);
                }
                None => session.stop(),
            },
            ("failure", ConnectionDirection::Connect) => {
                crate::metrics::record_auth_attempt(MECHANISM_PLAIN, false);
                warn!(session_id = %session.unique_id(), "Peer rejected SASL authentication");
                session.stop();
            }
            (name, direction) => debug!(
                element = name,
                direction = %direction,
                "Ignoring unexpected SASL element"
            ),
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
        let Some(item) = session.data().repo_item() else {
            warn!(session_id = %session.unique_id(), "No repository item for SASL");
            session.stop();
            return;
        };
        debug!(session_id = %session.unique_id(), domain = %item.domain, "Sending SASL PLAIN auth");
        results.push_back(Packet::new(
            Element::builder("auth", ns::SASL)
                .attr("mechanism", MECHANISM_PLAIN)
                .append(encode_plain(&item.domain, &item.secret))
                .build(),
        ));
    }

    fn stream_features(&self, session: &SessionRef, _handler: &dyn ProtocolHandler) -> Vec<Element> {
        if session.data().is_authenticated() {
            return Vec::new();
        }
        vec![Element::builder("mechanisms", ns::SASL)
            .append(
                Element::builder("mechanism", ns::SASL)
                    .append(MECHANISM_PLAIN)
                    .build(),
            )
            .build()]
    }
}
