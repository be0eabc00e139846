//! Error types for the external component server.

use thiserror::Error;

use crate::parser::ns;

/// External component protocol errors.
#[derive(Debug, Error)]
pub enum ExtCompError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Stream error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Routing fabric rejected an operation
    #[error("Routing error: {0}")]
    Routing(String),

    /// Component repository error
    #[error("Repository error: {0}")]
    Repository(String),

    /// The session is closed and cannot accept writes
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExtCompError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new authentication error (malformed or rejected credentials).
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new routing error.
    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    /// Create a new repository error.
    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Stanza error conditions used by the negotiation processors (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, missing hostname, etc.)
    BadRequest,
    /// Not authorized
    NotAuthorized,
    /// Service unavailable
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::NotAuthorized => "not-authorized",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }

    /// Default error type paired with this condition.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest => StanzaErrorType::Modify,
            Self::ServiceUnavailable => StanzaErrorType::Cancel,
            Self::NotAuthorized => StanzaErrorType::Auth,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Generate an IQ error response.
///
/// `to` and `from` are the addresses of the error reply, i.e. already swapped
/// relative to the request.
pub fn generate_iq_error(
    id: &str,
    to: Option<&str>,
    from: Option<&str>,
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
    text: Option<&str>,
) -> String {
    let mut iq = format!("<iq type='error' id='{}'", id);

    if let Some(to) = to {
        iq.push_str(&format!(" to='{}'", to));
    }

    if let Some(from) = from {
        iq.push_str(&format!(" from='{}'", from));
    }

    iq.push_str(&format!(
        "><error type='{}'><{} xmlns='{}'/>{}</error></iq>",
        error_type.as_str(),
        condition.as_str(),
        ns::STANZAS,
        text.map(|t| format!("<text xmlns='{}' xml:lang='en'>{}</text>", ns::STANZAS, t))
            .unwrap_or_default()
    ));

    iq
}

/// Generate a stream error and close tag.
///
/// Stream errors are fatal and must be followed by closing the stream.
pub fn generate_stream_error(condition: &str, text: Option<&str>) -> String {
    let mut error = format!(
        "<stream:error><{} xmlns='{}'/>",
        condition,
        ns::STREAM_ERRORS
    );

    if let Some(t) = text {
        error.push_str(&format!(
            "<text xmlns='{}' xml:lang='en'>{}</text>",
            ns::STREAM_ERRORS,
            t
        ));
    }

    error.push_str("</stream:error></stream:stream>");
    error
}

/// Stream error conditions raised during component negotiation.
pub mod stream_errors {
    /// Stream error: bad format
    pub const BAD_FORMAT: &str = "bad-format";
    /// Stream error: host unknown
    pub const HOST_UNKNOWN: &str = "host-unknown";
    /// Stream error: improper addressing
    pub const IMPROPER_ADDRESSING: &str = "improper-addressing";
    /// Stream error: not authorized
    pub const NOT_AUTHORIZED: &str = "not-authorized";
    /// Stream error: not well-formed
    pub const NOT_WELL_FORMED: &str = "not-well-formed";
    /// Stream error: system shutdown
    pub const SYSTEM_SHUTDOWN: &str = "system-shutdown";
}
