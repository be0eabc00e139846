//! Routing table maintenance for component domains.
//!
//! A bound domain `d` is reachable through three patterns: `d` itself,
//! `*@d` (any user at the component) and `*.d` (any subdomain). The
//! [`RoutingTableManager`] adds and removes these in the [`RoutingFabric`]
//! and keeps the service discovery listing in sync.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::packet::Packet;
use crate::ExtCompError;

/// Discovery description for connected components.
pub const DISCO_DESCRIPTION: &str = "External component";

/// A routing table entry for a component domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingPattern {
    /// The domain itself.
    Exact(String),
    /// Any user address at the domain (`*@domain`).
    AnyUser(String),
    /// Any subdomain of the domain (`*.domain`).
    AnySubdomain(String),
}

impl RoutingPattern {
    /// The three patterns installed for a bound domain.
    pub fn for_domain(domain: &str) -> [RoutingPattern; 3] {
        let domain = domain.to_lowercase();
        [
            RoutingPattern::Exact(domain.clone()),
            RoutingPattern::AnyUser(domain.clone()),
            RoutingPattern::AnySubdomain(domain),
        ]
    }

    /// Domain this pattern was created for.
    pub fn domain(&self) -> &str {
        match self {
            Self::Exact(d) | Self::AnyUser(d) | Self::AnySubdomain(d) => d,
        }
    }

    /// Whether `address` (bare domain, bare or full JID) matches.
    pub fn matches(&self, address: &str) -> bool {
        let bare = address.split('/').next().unwrap_or_default();
        let (node, host) = match bare.rsplit_once('@') {
            Some((node, host)) => (Some(node), host),
            None => (None, bare),
        };
        let host = host.to_lowercase();

        match self {
            Self::Exact(d) => node.is_none() && host == *d,
            Self::AnyUser(d) => node.is_some() && host == *d,
            Self::AnySubdomain(d) => {
                host.len() > d.len() + 1
                    && host.ends_with(d.as_str())
                    && host.as_bytes()[host.len() - d.len() - 1] == b'.'
            }
        }
    }
}

impl fmt::Display for RoutingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(d) => write!(f, "{}", d),
            Self::AnyUser(d) => write!(f, "*@{}", d),
            Self::AnySubdomain(d) => write!(f, "*.{}", d),
        }
    }
}

/// A service discovery item added or withdrawn for a component domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryAnnouncement {
    /// Component domain
    pub domain: String,
    /// Human-readable name
    pub name: String,
    /// Status note ("XEP-0114 connected" / "XEP-0114 disconnected")
    pub note: String,
    /// Discovery category label
    pub category: String,
    /// True when the item is withdrawn
    pub removed: bool,
}

/// The messaging fabric packets are routed into.
pub trait RoutingFabric: Send + Sync {
    /// Start routing addresses matching `pattern` to this server.
    fn add_routing_pattern(&self, pattern: &RoutingPattern) -> Result<(), ExtCompError>;

    /// Stop routing addresses matching `pattern` to this server.
    fn remove_routing_pattern(&self, pattern: &RoutingPattern) -> Result<(), ExtCompError>;

    /// Hand a packet received from a component to the fabric.
    fn deliver(&self, packet: Packet) -> Result<(), ExtCompError>;

    /// Publish or withdraw a discovery item.
    fn announce_discovery_item(
        &self,
        announcement: &DiscoveryAnnouncement,
    ) -> Result<(), ExtCompError>;
}

/// Translates domain bind/unbind transitions into fabric updates.
pub struct RoutingTableManager {
    fabric: std::sync::Arc<dyn RoutingFabric>,
    service_disco: bool,
    identity_type: String,
}

impl RoutingTableManager {
    pub fn new(
        fabric: std::sync::Arc<dyn RoutingFabric>,
        service_disco: bool,
        identity_type: impl Into<String>,
    ) -> Self {
        Self {
            fabric,
            service_disco,
            identity_type: identity_type.into(),
        }
    }

    /// Install the patterns for `domain` and announce it.
    pub fn bind_domain(&self, domain: &str) {
        for pattern in RoutingPattern::for_domain(domain) {
            match self.fabric.add_routing_pattern(&pattern) {
                Ok(()) => debug!(pattern = %pattern, "Routing pattern added"),
                Err(e) => warn!(pattern = %pattern, error = %e, "Failed to add routing pattern"),
            }
        }
        self.announce(domain, false);
        info!(domain = %domain, "Component domain routable");
    }

    /// Remove the patterns for `domain` and withdraw its announcement.
    pub fn unbind_domain(&self, domain: &str) {
        for pattern in RoutingPattern::for_domain(domain) {
            match self.fabric.remove_routing_pattern(&pattern) {
                Ok(()) => debug!(pattern = %pattern, "Routing pattern removed"),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Failed to remove routing pattern")
                }
            }
        }
        self.announce(domain, true);
        info!(domain = %domain, "Component domain no longer routable");
    }

    fn announce(&self, domain: &str, removed: bool) {
        if !self.service_disco {
            return;
        }
        let announcement = DiscoveryAnnouncement {
            domain: domain.to_lowercase(),
            name: DISCO_DESCRIPTION.to_string(),
            note: if removed {
                "XEP-0114 disconnected".to_string()
            } else {
                "XEP-0114 connected".to_string()
            },
            category: self.identity_type.clone(),
            removed,
        };
        if let Err(e) = self.fabric.announce_discovery_item(&announcement) {
            warn!(domain = %domain, error = %e, "Failed to announce discovery item");
        }
    }
}

impl fmt::Debug for RoutingTableManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTableManager")
            .field("service_disco", &self.service_disco)
            .field("identity_type", &self.identity_type)
            .finish()
    }
}

/// Routing fabric held in process memory.
///
/// Delivered packets are pushed into a channel consumed by the
/// [`PacketRouter`](crate::router::PacketRouter).
pub struct InMemoryRoutingTable {
    patterns: Mutex<HashSet<RoutingPattern>>,
    disco_items: DashMap<String, DiscoveryAnnouncement>,
    deliveries: mpsc::UnboundedSender<Packet>,
}

impl InMemoryRoutingTable {
    /// Create an empty table and the receiver for delivered packets.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                patterns: Mutex::new(HashSet::new()),
                disco_items: DashMap::new(),
                deliveries: tx,
            },
            rx,
        )
    }

    fn lock_patterns(&self) -> MutexGuard<'_, HashSet<RoutingPattern>> {
        self.patterns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn has_pattern(&self, pattern: &RoutingPattern) -> bool {
        self.lock_patterns().contains(pattern)
    }

    /// Rendered patterns, sorted.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.lock_patterns().iter().map(|p| p.to_string()).collect();
        patterns.sort();
        patterns
    }

    /// The component domain an address routes to, if any.
    ///
    /// Exact matches win over wildcard ones; among subdomain matches the
    /// longest domain wins.
    pub fn lookup(&self, address: &str) -> Option<String> {
        let patterns = self.lock_patterns();
        patterns
            .iter()
            .filter(|p| p.matches(address))
            .max_by_key(|p| {
                let rank = match p {
                    RoutingPattern::Exact(_) | RoutingPattern::AnyUser(_) => 1,
                    RoutingPattern::AnySubdomain(_) => 0,
                };
                (rank, p.domain().len())
            })
            .map(|p| p.domain().to_string())
    }

    /// Currently announced discovery items, sorted by domain.
    pub fn disco_items(&self) -> Vec<DiscoveryAnnouncement> {
        let mut items: Vec<_> = self.disco_items.iter().map(|e| e.value().clone()).collect();
        items.sort_by(|a, b| a.domain.cmp(&b.domain));
        items
    }
}

impl RoutingFabric for InMemoryRoutingTable {
    fn add_routing_pattern(&self, pattern: &RoutingPattern) -> Result<(), ExtCompError> {
        self.lock_patterns().insert(pattern.clone());
        Ok(())
    }

    fn remove_routing_pattern(&self, pattern: &RoutingPattern) -> Result<(), ExtCompError> {
        self.lock_patterns().remove(pattern);
        Ok(())
    }

    fn deliver(&self, packet: Packet) -> Result<(), ExtCompError> {
        self.deliveries
            .send(packet)
            .map_err(|_| ExtCompError::routing("Packet router is not running"))
    }

    fn announce_discovery_item(
        &self,
        announcement: &DiscoveryAnnouncement,
    ) -> Result<(), ExtCompError> {
        if announcement.removed {
            self.disco_items.remove(&announcement.domain);
        } else {
            self.disco_items
                .insert(announcement.domain.clone(), announcement.clone());
        }
        Ok(())
    }
}

impl fmt::Debug for InMemoryRoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRoutingTable")
            .field("patterns", &self.lock_patterns().len())
            .field("disco_items", &self.disco_items.len())
            .finish()
    }
}
