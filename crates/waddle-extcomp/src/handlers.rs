//! Stream open handlers.
//!
//! The namespace of a peer's opening `<stream:stream>` decides how we answer
//! it. Legacy XEP-0114 streams (`jabber:component:accept` and
//! `jabber:component:connect`) use the `<handshake/>` exchange; streams in
//! `jabber:client` go through STARTTLS/SASL/bind feature negotiation. Streams
//! with no or an unregistered namespace get the [`StreamOpenHandler::Unknown`]
//! handler, which auto-detects and never rejects the connection.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::{generate_stream_error, stream_errors};
use crate::parser::{element_to_string, ns, StreamHeader};
use crate::processors::handshake_digest;
use crate::protocol::ProtocolHandler;
use crate::repository::CompRepoItem;
use crate::session::{ConnectionDirection, SessionRef};

/// Data to write in answer to a stream open, and whether to close afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReply {
    pub data: String,
    pub close: bool,
}

impl StreamReply {
    fn open(data: String) -> Self {
        Self { data, close: false }
    }

    fn fatal(header: String, condition: &str, text: &str) -> Self {
        Self {
            data: header + &generate_stream_error(condition, Some(text)),
            close: true,
        }
    }
}

/// Behaviour selected by stream namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamOpenHandler {
    JabberClient,
    ComponentAccept,
    ComponentConnect,
    Unknown,
}

impl StreamOpenHandler {
    /// Handlers registered in the namespace table, in registration order.
    pub const REGISTERED: [StreamOpenHandler; 3] = [
        StreamOpenHandler::JabberClient,
        StreamOpenHandler::ComponentAccept,
        StreamOpenHandler::ComponentConnect,
    ];

    /// Namespaces this handler answers.
    pub fn xmlns(&self) -> &'static [&'static str] {
        match self {
            Self::JabberClient => &[ns::JABBER_CLIENT],
            Self::ComponentAccept => &[ns::COMPONENT_ACCEPT],
            Self::ComponentConnect => &[ns::COMPONENT_CONNECT],
            Self::Unknown => &[],
        }
    }

    /// Namespace to put on streams this handler opens.
    pub fn default_xmlns(&self) -> &'static str {
        match self {
            Self::JabberClient => ns::JABBER_CLIENT,
            Self::ComponentConnect => ns::COMPONENT_CONNECT,
            Self::ComponentAccept | Self::Unknown => ns::COMPONENT_ACCEPT,
        }
    }

    fn is_legacy(&self) -> bool {
        matches!(self, Self::ComponentAccept | Self::ComponentConnect)
    }

    /// Answer the peer's stream header.
    pub fn stream_opened(
        &self,
        session: &SessionRef,
        header: &StreamHeader,
        handler: &dyn ProtocolHandler,
    ) -> Option<StreamReply> {
        let xmlns = header
            .xmlns
            .clone()
            .unwrap_or_else(|| self.default_xmlns().to_string());

        if *self != Self::Unknown {
            session
                .data()
                .update(|state| state.xmlns = Some(xmlns.clone()));
        }

        match self {
            Self::Unknown => unknown_stream_opened(session, header, handler),
            legacy if legacy.is_legacy() => match session.direction() {
                ConnectionDirection::Accept => legacy_accept(session, header, &xmlns, handler),
                ConnectionDirection::Connect => legacy_connect(session, header),
            },
            _ => match session.direction() {
                ConnectionDirection::Accept => client_accept(session, header, &xmlns, handler),
                ConnectionDirection::Connect => {
                    session.data().update(|state| state.stream_id = header.id.clone());
                    None
                }
            },
        }
    }

    /// Opening data for an outbound session we just established.
    pub fn session_started(
        &self,
        session: &SessionRef,
        handler: &dyn ProtocolHandler,
    ) -> Option<String> {
        if session.direction() != ConnectionDirection::Connect {
            return None;
        }
        let item = session.data().repo_item()?;

        let resolved = match self {
            Self::Unknown => match item.xmlns.as_deref() {
                Some(xmlns) => match handler.stream_open_handler(Some(xmlns)) {
                    Self::Unknown => Self::ComponentAccept,
                    known => known,
                },
                None => Self::ComponentAccept,
            },
            known => *known,
        };

        let xmlns = resolved.default_xmlns().to_string();
        session.data().update(|state| state.xmlns = Some(xmlns.clone()));

        let header = StreamHeader {
            xmlns: Some(xmlns),
            to: Some(item.domain.clone()),
            version: (resolved == Self::JabberClient).then(|| "1.0".to_string()),
            ..Default::default()
        };
        debug!(
            session_id = %session.unique_id(),
            domain = %item.domain,
            handler = ?resolved,
            "Opening outbound component stream"
        );
        Some(header.render())
    }
}

fn reply_header(xmlns: &str, from: Option<&str>, id: &str, version_1: bool) -> String {
    StreamHeader {
        xmlns: Some(xmlns.to_string()),
        from: from.map(str::to_string),
        id: Some(id.to_string()),
        version: version_1.then(|| "1.0".to_string()),
        ..Default::default()
    }
    .render()
}

fn new_stream_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn features(session: &SessionRef, handler: &dyn ProtocolHandler) -> String {
    let body: String = handler
        .stream_features(session)
        .iter()
        .filter_map(|feature| element_to_string(feature).ok())
        .collect();
    format!("<stream:features>{}</stream:features>", body)
}

/// Resolve the addressed component or produce the fatal reply for it.
fn addressed_item(
    header: &StreamHeader,
    reply_ns: &str,
    version_1: bool,
    handler: &dyn ProtocolHandler,
) -> Result<CompRepoItem, StreamReply> {
    let id = new_stream_id();
    let Some(to) = header.to.as_deref() else {
        return Err(StreamReply::fatal(
            reply_header(reply_ns, None, &id, version_1),
            stream_errors::IMPROPER_ADDRESSING,
            "Missing 'to' attribute",
        ));
    };
    handler.repo_item(to).ok_or_else(|| {
        warn!(domain = %to, "Stream opened for unknown component");
        StreamReply::fatal(
            reply_header(reply_ns, Some(to), &id, version_1),
            stream_errors::HOST_UNKNOWN,
            "Unknown component domain",
        )
    })
}

fn legacy_accept(
    session: &SessionRef,
    header: &StreamHeader,
    xmlns: &str,
    handler: &dyn ProtocolHandler,
) -> Option<StreamReply> {
    let item = match addressed_item(header, xmlns, false, handler) {
        Ok(item) => item,
        Err(reply) => return Some(reply),
    };

    let stream_id = new_stream_id();
    let domain = item.domain.to_lowercase();
    session.data().update(|state| {
        state.hostname = Some(domain.clone());
        state.stream_id = Some(stream_id.clone());
        state.repo_item = Some(item);
    });

    debug!(session_id = %session.unique_id(), domain = %domain, "Legacy component stream opened");
    Some(StreamReply::open(reply_header(
        xmlns,
        Some(&domain),
        &stream_id,
        false,
    )))
}

fn legacy_connect(session: &SessionRef, header: &StreamHeader) -> Option<StreamReply> {
    let item = session.data().repo_item();
    let (Some(stream_id), Some(item)) = (header.id.clone(), item) else {
        return Some(StreamReply {
            data: generate_stream_error(stream_errors::BAD_FORMAT, Some("Missing stream id")),
            close: true,
        });
    };

    session
        .data()
        .update(|state| state.stream_id = Some(stream_id.clone()));

    debug!(session_id = %session.unique_id(), domain = %item.domain, "Sending handshake");
    Some(StreamReply::open(format!(
        "<handshake>{}</handshake>",
        handshake_digest(&stream_id, &item.secret)
    )))
}

fn client_accept(
    session: &SessionRef,
    header: &StreamHeader,
    xmlns: &str,
    handler: &dyn ProtocolHandler,
) -> Option<StreamReply> {
    if let Err(reply) = addressed_item(header, xmlns, true, handler) {
        return Some(reply);
    }

    let stream_id = new_stream_id();
    session
        .data()
        .update(|state| state.stream_id = Some(stream_id.clone()));

    Some(StreamReply::open(
        reply_header(xmlns, header.to.as_deref(), &stream_id, true) + &features(session, handler),
    ))
}

fn unknown_stream_opened(
    session: &SessionRef,
    header: &StreamHeader,
    handler: &dyn ProtocolHandler,
) -> Option<StreamReply> {
    let item = session
        .data()
        .repo_item()
        .or_else(|| header.to.as_deref().and_then(|to| handler.repo_item(to)));

    if let Some(item) = item {
        let detected = match item.xmlns.as_deref() {
            Some(xmlns) => handler.stream_open_handler(Some(xmlns)),
            None if header.is_version_1() => StreamOpenHandler::JabberClient,
            None => StreamOpenHandler::ComponentAccept,
        };
        if detected != StreamOpenHandler::Unknown {
            debug!(
                session_id = %session.unique_id(),
                domain = %item.domain,
                handler = ?detected,
                "Auto-detected stream handler"
            );
            let mut delegated = header.clone();
            delegated.xmlns = Some(detected.default_xmlns().to_string());
            return detected.stream_opened(session, &delegated, handler);
        }
    }

    // Nothing to go on: answer with a plain header and keep the session open.
    debug!(
        session_id = %session.unique_id(),
        xmlns = ?header.xmlns,
        "Stream namespace not recognized"
    );
    let xmlns = header
        .xmlns
        .clone()
        .unwrap_or_else(|| ns::COMPONENT_ACCEPT.to_string());
    let stream_id = new_stream_id();
    session.data().update(|state| {
        state.xmlns = Some(xmlns.clone());
        state.stream_id = Some(stream_id.clone());
    });

    let version_1 = header.is_version_1();
    let mut data = reply_header(&xmlns, header.to.as_deref(), &stream_id, version_1);
    if version_1 {
        data.push_str(&features(session, handler));
    }
    Some(StreamReply::open(data))
}

/// Namespace to handler table, built once.
#[derive(Debug, Clone)]
pub struct StreamOpenHandlers {
    by_xmlns: HashMap<&'static str, StreamOpenHandler>,
}

impl StreamOpenHandlers {
    /// Build the table from the registered handlers. When two handlers claim
    /// the same namespace the later one wins.
    pub fn new() -> Self {
        Self::from_handlers(&StreamOpenHandler::REGISTERED)
    }

    pub fn from_handlers(handlers: &[StreamOpenHandler]) -> Self {
        let mut table = Self {
            by_xmlns: HashMap::new(),
        };
        for handler in handlers {
            for xmlns in handler.xmlns() {
                table.register(xmlns, *handler);
            }
        }
        table
    }

    /// Bind `xmlns` to `handler`, replacing any earlier binding.
    pub fn register(&mut self, xmlns: &'static str, handler: StreamOpenHandler) {
        if let Some(previous) = self.by_xmlns.insert(xmlns, handler) {
            if previous != handler {
                debug!(xmlns, ?previous, ?handler, "Stream namespace handler replaced");
            }
        }
    }

    /// Handler for a stream namespace; missing or unregistered namespaces
    /// resolve to [`StreamOpenHandler::Unknown`].
    pub fn resolve(&self, xmlns: Option<&str>) -> StreamOpenHandler {
        xmlns
            .and_then(|x| self.by_xmlns.get(x).copied())
            .unwrap_or(StreamOpenHandler::Unknown)
    }
}

impl Default for StreamOpenHandlers {
    fn default() -> Self {
        Self::new()
    }
}
