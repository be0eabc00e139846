//! Packets exchanged with external components.
//!
//! A [`Packet`] wraps one top-level stream element. Packets travelling between
//! routing nodes may be wrapped in a `<route/>` envelope; the envelope's
//! `to`/`from` carry the routing addresses while the inner element keeps the
//! original stanza addressing (`elem_to`).

use std::fmt;

use jid::Jid;
use minidom::Element;

use crate::parser::{element_to_string, ns};
use crate::ExtCompError;

/// A single element received from or destined for a component stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    element: Element,
}

impl Packet {
    /// Wrap an element.
    pub fn new(element: Element) -> Self {
        Self { element }
    }

    /// Parse a packet from its serialized form in the given default namespace.
    pub fn parse(xml: &str, default_ns: &str) -> Result<Self, ExtCompError> {
        crate::parser::parse_fragment(xml, default_ns).map(Self::new)
    }

    /// The wrapped element.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Element name.
    pub fn name(&self) -> &str {
        self.element.name()
    }

    /// Element namespace.
    pub fn ns(&self) -> String {
        self.element.ns()
    }

    /// True when the element has the given name and namespace.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.element.is(name, namespace)
    }

    /// Value of an attribute on the wrapped element.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.element.attr(name)
    }

    /// `to` attribute of the outermost element.
    pub fn to(&self) -> Option<&str> {
        self.element.attr("to")
    }

    /// `from` attribute of the outermost element.
    pub fn from(&self) -> Option<&str> {
        self.element.attr("from")
    }

    /// Stanza id.
    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// `to` attribute of the stanza itself, looking through a route envelope.
    pub fn elem_to(&self) -> Option<&str> {
        match self.routed_child() {
            Some(inner) => inner.attr("to"),
            None => self.to(),
        }
    }

    /// Domain part of [`Packet::elem_to`].
    pub fn elem_to_host(&self) -> Option<String> {
        self.elem_to().and_then(address_host)
    }

    /// True when the packet is wrapped in a route envelope.
    pub fn is_routed(&self) -> bool {
        self.element.is("route", ns::ROUTE)
    }

    fn routed_child(&self) -> Option<&Element> {
        if self.is_routed() {
            self.element.children().next()
        } else {
            None
        }
    }

    /// Remove one level of route envelope.
    ///
    /// Returns the packet unchanged when it is not routed or the envelope is
    /// empty.
    pub fn unpack_routed(self) -> Packet {
        match self.routed_child() {
            Some(inner) => Packet::new(inner.clone()),
            None => self,
        }
    }

    /// Wrap this packet in a route envelope addressed from `from` to `to`.
    pub fn pack_routed(&self, from: &str, to: &str) -> Packet {
        let route = Element::builder("route", ns::ROUTE)
            .attr("from", from)
            .attr("to", to)
            .append(self.element.clone())
            .build();
        Packet::new(route)
    }

    /// Serialize the packet.
    pub fn to_xml(&self) -> Result<String, ExtCompError> {
        element_to_string(&self.element)
    }
}

impl From<Element> for Packet {
    fn from(element: Element) -> Self {
        Self::new(element)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_xml() {
            Ok(xml) => f.write_str(&xml),
            Err(_) => write!(f, "<{} xmlns='{}'/>", self.name(), self.ns()),
        }
    }
}

/// Domain part of an address, lower-cased.
///
/// Falls back to manual splitting for addresses `jid` refuses (component
/// streams occasionally carry sloppy addressing we still want to route).
pub fn address_host(address: &str) -> Option<String> {
    if let Ok(jid) = Jid::new(address) {
        return Some(jid.domain().as_str().to_lowercase());
    }
    let without_resource = address.split('/').next()?;
    let host = without_resource.rsplit('@').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}
