//! Stream framing for component connections.
//!
//! Component streams are a single long-lived `<stream:stream>` element whose
//! children are the packets. [`StreamParser`] accumulates raw bytes and emits
//! [`StreamEvent`]s: the (possibly restarted) stream header, each complete
//! top-level element, and the closing tag.

use minidom::Element;
use std::borrow::Cow;

use crate::ExtCompError;

/// XML namespaces used on component streams.
pub mod ns {
    /// Client namespace (feature-negotiated components)
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// Legacy component accept namespace (XEP-0114)
    pub const COMPONENT_ACCEPT: &str = "jabber:component:accept";
    /// Legacy component connect namespace (XEP-0114)
    pub const COMPONENT_CONNECT: &str = "jabber:component:connect";
    /// Stream namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error namespace
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// TLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Component hostname binding namespace
    pub const BIND: &str = "urn:xmpp:component:bind:0";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Service discovery items (XEP-0030)
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// Envelope for packets carried between routing nodes
    pub const ROUTE: &str = "urn:waddle:route:0";
}

/// Parsed stream header information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    /// The default namespace declared on the stream (`xmlns`)
    pub xmlns: Option<String>,
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by the receiving side)
    pub id: Option<String>,
    /// The 'version' attribute
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from raw XML data.
    ///
    /// The opening tag is intentionally unclosed, so attributes are
    /// extracted directly from the tag text.
    pub fn parse(data: &str) -> Result<Self, ExtCompError> {
        let stream_start = data
            .find("<stream:stream")
            .ok_or_else(|| ExtCompError::xml_parse("No stream:stream element found"))?;

        let stream_end = find_tag_end(data.as_bytes(), stream_start)
            .ok_or_else(|| ExtCompError::xml_parse("Incomplete stream header"))?;

        let tag = &data[stream_start..=stream_end];

        Ok(StreamHeader {
            xmlns: extract_attribute(tag, "xmlns"),
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            id: extract_attribute(tag, "id"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
        })
    }

    /// True when the peer asked for RFC 6120 feature negotiation.
    pub fn is_version_1(&self) -> bool {
        self.version.as_deref() == Some("1.0")
    }

    /// Render this header as an opening stream tag with XML declaration.
    pub fn render(&self) -> String {
        let mut out = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}'",
            escape_attribute(self.xmlns.as_deref().unwrap_or(ns::COMPONENT_ACCEPT)),
            ns::STREAM
        );
        for (name, value) in [
            ("to", &self.to),
            ("from", &self.from),
            ("id", &self.id),
            ("version", &self.version),
            ("xml:lang", &self.lang),
        ] {
            if let Some(value) = value {
                out.push_str(&format!(" {}='{}'", name, escape_attribute(value)));
            }
        }
        out.push('>');
        out
    }
}

/// Escape a value for a single-quoted XML attribute.
fn escape_attribute(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '\'', '"']) {
        return Cow::Borrowed(value);
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '\'' => escaped.push_str("&apos;"),
            '"' => escaped.push_str("&quot;"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Extract an attribute value from an XML tag string.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", name, quote);
        let mut offset = 0;
        while let Some(found) = tag[offset..].find(&pattern) {
            let start = offset + found;
            // Only whole attribute names: `to=` must not match inside `proto=`.
            let preceded_by_space = tag[..start]
                .chars()
                .last()
                .map(char::is_whitespace)
                .unwrap_or(false);
            let value_start = start + pattern.len();
            if preceded_by_space {
                return tag[value_start..]
                    .find(quote)
                    .map(|end| tag[value_start..value_start + end].to_string());
            }
            offset = value_start;
        }
    }
    None
}

/// Find the index of the `>` closing the tag that opens at `start`,
/// skipping quoted attribute values.
fn find_tag_end(data: &[u8], start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in data.iter().enumerate().skip(start) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

fn find_subslice(data: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    data.get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Events produced by [`StreamParser`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A stream header was received (initial or restart).
    Open(StreamHeader),
    /// A complete top-level element.
    Element(Element),
    /// The peer closed its stream.
    Close,
}

/// Incremental framer for a component stream.
#[derive(Debug)]
pub struct StreamParser {
    buffer: Vec<u8>,
    default_ns: String,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    /// Create a new parser. Until a header declares otherwise, fragments are
    /// parsed in the legacy component namespace.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            default_ns: ns::COMPONENT_ACCEPT.to_string(),
        }
    }

    /// Feed data into the parser.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Discard buffered data (after a TLS upgrade).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Pull the next complete event out of the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, ExtCompError> {
        loop {
            // Whitespace keepalives and stray text between packets are ignored.
            let Some(start) = self.buffer.iter().position(|&b| b == b'<') else {
                self.buffer.clear();
                return Ok(None);
            };
            if start > 0 {
                self.buffer.drain(..start);
            }

            if self.buffer.starts_with(b"<?") {
                match find_subslice(&self.buffer, 0, b"?>") {
                    Some(end) => {
                        self.buffer.drain(..end + 2);
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            if self.buffer.starts_with(b"<!--") {
                match find_subslice(&self.buffer, 0, b"-->") {
                    Some(end) => {
                        self.buffer.drain(..end + 3);
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            if self.buffer.starts_with(b"<stream:stream") {
                let Some(end) = find_tag_end(&self.buffer, 0) else {
                    return Ok(None);
                };
                let tag = std::str::from_utf8(&self.buffer[..=end])
                    .map_err(|e| ExtCompError::xml_parse(format!("Invalid UTF-8: {}", e)))?
                    .to_string();
                self.buffer.drain(..=end);
                let header = StreamHeader::parse(&tag)?;
                if let Some(xmlns) = &header.xmlns {
                    self.default_ns = xmlns.clone();
                }
                return Ok(Some(StreamEvent::Open(header)));
            }

            if self.buffer.starts_with(b"</stream:stream") {
                let Some(end) = find_tag_end(&self.buffer, 0) else {
                    return Ok(None);
                };
                self.buffer.drain(..=end);
                return Ok(Some(StreamEvent::Close));
            }

            let Some(end) = self.find_element_end()? else {
                return Ok(None);
            };
            let fragment: Vec<u8> = self.buffer.drain(..=end).collect();
            let fragment = String::from_utf8(fragment)
                .map_err(|e| ExtCompError::xml_parse(format!("Invalid UTF-8: {}", e)))?;
            let element = parse_fragment(&fragment, &self.default_ns)?;
            return Ok(Some(StreamEvent::Element(element)));
        }
    }

    /// Locate the end of the top-level element starting at offset 0.
    fn find_element_end(&self) -> Result<Option<usize>, ExtCompError> {
        let data = &self.buffer;
        let mut depth: usize = 0;
        let mut pos = 0;

        while let Some(rel) = data[pos..].iter().position(|&b| b == b'<') {
            let open = pos + rel;
            let rest = &data[open..];

            if rest.starts_with(b"<!--") {
                match find_subslice(data, open, b"-->") {
                    Some(end) => {
                        pos = end + 3;
                        continue;
                    }
                    None => return Ok(None),
                }
            }
            if rest.starts_with(b"<![CDATA[") {
                match find_subslice(data, open, b"]]>") {
                    Some(end) => {
                        pos = end + 3;
                        continue;
                    }
                    None => return Ok(None),
                }
            }

            let Some(close) = find_tag_end(data, open) else {
                return Ok(None);
            };

            if rest.starts_with(b"</") {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    ExtCompError::xml_parse("Unbalanced closing tag in stream")
                })?;
                if depth == 0 {
                    return Ok(Some(close));
                }
            } else if data[close - 1] == b'/' {
                if depth == 0 {
                    return Ok(Some(close));
                }
            } else {
                depth += 1;
            }
            pos = close + 1;
        }

        Ok(None)
    }
}

/// Parse a single top-level element in the context of a stream whose
/// default namespace is `default_ns`.
pub fn parse_fragment(fragment: &str, default_ns: &str) -> Result<Element, ExtCompError> {
    let wrapped = format!(
        "<stream:stream xmlns='{}' xmlns:stream='{}'>{}</stream:stream>",
        default_ns,
        ns::STREAM,
        fragment
    );
    let root: Element = wrapped
        .parse()
        .map_err(|e| ExtCompError::xml_parse(format!("Failed to parse element: {}", e)))?;
    root.children()
        .next()
        .cloned()
        .ok_or_else(|| ExtCompError::xml_parse("Empty stream fragment"))
}

/// Convert a minidom Element back to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, ExtCompError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| ExtCompError::xml_parse(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| ExtCompError::xml_parse(format!("Invalid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_header_parse() {
        let data = "<?xml version='1.0'?><stream:stream xmlns='jabber:component:accept' \
                    xmlns:stream='http://etherx.jabber.org/streams' to='muc.example.com'>";
        let header = StreamHeader::parse(data).unwrap();

        assert_eq!(header.xmlns.as_deref(), Some(ns::COMPONENT_ACCEPT));
        assert_eq!(header.to.as_deref(), Some("muc.example.com"));
        assert_eq!(header.version, None);
        assert!(!header.is_version_1());
    }

    #[test]
    fn test_stream_header_ignores_prefixed_xmlns() {
        let data = "<stream:stream xmlns:stream=\"http://etherx.jabber.org/streams\" \
                    xmlns=\"jabber:client\" version=\"1.0\">";
        let header = StreamHeader::parse(data).unwrap();
        assert_eq!(header.xmlns.as_deref(), Some(ns::JABBER_CLIENT));
        assert!(header.is_version_1());
    }

    #[test]
    fn test_stream_header_render_escapes_attributes() {
        let header = StreamHeader {
            xmlns: Some("urn:x'><evil/>".to_string()),
            to: Some("a&b\"c".to_string()),
            ..Default::default()
        };
        let rendered = header.render();
        assert!(rendered.contains("xmlns='urn:x&apos;&gt;&lt;evil/&gt;'"));
        assert!(rendered.contains("to='a&amp;b&quot;c'"));
        assert!(!rendered.contains("<evil/>"));
    }

    #[test]
    fn test_stream_header_render() {
        let header = StreamHeader {
            xmlns: Some(ns::COMPONENT_ACCEPT.to_string()),
            from: Some("muc.example.com".to_string()),
            id: Some("abc".to_string()),
            ..Default::default()
        };
        let xml = header.render();
        assert!(xml.contains("xmlns='jabber:component:accept'"));
        assert!(xml.contains("from='muc.example.com'"));
        assert!(xml.contains("id='abc'"));
        assert!(!xml.contains("version="));
        assert!(xml.ends_with('>'));
    }

    #[test]
    fn test_parser_emits_header_then_elements() {
        let mut parser = StreamParser::new();
        parser.feed(
            b"<?xml version='1.0'?><stream:stream xmlns='jabber:component:accept' \
              xmlns:stream='http://etherx.jabber.org/streams' to='c.example.com'>\
              <handshake>abc</handshake><message to='a@b'><body>x &gt; y</body></message>",
        );

        match parser.next_event().unwrap() {
            Some(StreamEvent::Open(h)) => assert_eq!(h.to.as_deref(), Some("c.example.com")),
            other => panic!("unexpected {:?}", other),
        }
        match parser.next_event().unwrap() {
            Some(StreamEvent::Element(e)) => {
                assert_eq!(e.name(), "handshake");
                assert_eq!(e.ns(), ns::COMPONENT_ACCEPT);
                assert_eq!(e.text(), "abc");
            }
            other => panic!("unexpected {:?}", other),
        }
        match parser.next_event().unwrap() {
            Some(StreamEvent::Element(e)) => {
                assert_eq!(e.name(), "message");
                assert_eq!(e.attr("to"), Some("a@b"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(parser.next_event().unwrap().is_none());
    }

    #[test]
    fn test_parser_waits_for_partial_element() {
        let mut parser = StreamParser::new();
        parser.feed(b"<iq type='set' id='1'><bind xmlns='urn:xmpp:component:bind:0'>");
        assert!(parser.next_event().unwrap().is_none());

        parser.feed(b"<hostname>x.example.com</hostname></bind></iq>");
        match parser.next_event().unwrap() {
            Some(StreamEvent::Element(e)) => {
                assert_eq!(e.name(), "iq");
                assert!(e.get_child("bind", ns::BIND).is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parser_handles_prefixed_stream_children() {
        let mut parser = StreamParser::new();
        parser.feed(b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>");
        match parser.next_event().unwrap() {
            Some(StreamEvent::Element(e)) => {
                assert!(e.is("features", ns::STREAM));
                assert!(e.get_child("starttls", ns::TLS).is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parser_stream_close_and_keepalive() {
        let mut parser = StreamParser::new();
        parser.feed(b"  \n </stream:stream>");
        assert!(matches!(parser.next_event().unwrap(), Some(StreamEvent::Close)));
    }

    #[test]
    fn test_parser_quoted_gt_in_attribute() {
        let mut parser = StreamParser::new();
        parser.feed(b"<presence status='a>b'/>");
        match parser.next_event().unwrap() {
            Some(StreamEvent::Element(e)) => assert_eq!(e.attr("status"), Some("a>b")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parser_rejects_malformed_fragment() {
        let mut parser = StreamParser::new();
        parser.feed(b"<a><b></a></b>");
        assert!(parser.next_event().is_err());
    }

    #[test]
    fn test_element_to_string() {
        let element = Element::builder("handshake", ns::COMPONENT_ACCEPT).build();
        let xml = element_to_string(&element).unwrap();
        assert!(xml.contains("handshake"));
    }
}
