//! Component connection registry implementation.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use crate::session::{Session, SessionRef};

/// One session registered as serving one domain.
#[derive(Clone)]
pub struct ComponentConnection {
    domain: String,
    session_id: String,
    session: Weak<dyn Session>,
}

impl ComponentConnection {
    fn new(domain: &str, session: &SessionRef) -> Self {
        Self {
            domain: domain.to_string(),
            session_id: session.unique_id().to_string(),
            session: Arc::downgrade(session),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The session, if it has not been dropped.
    pub fn session(&self) -> Option<SessionRef> {
        self.session.upgrade()
    }

    /// True while the session exists and its transport is up.
    pub fn is_connected(&self) -> bool {
        self.session().map(|s| s.is_connected()).unwrap_or(false)
    }

    fn belongs_to(&self, session: &SessionRef) -> bool {
        self.session_id == session.unique_id()
    }
}

impl fmt::Debug for ComponentConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentConnection")
            .field("domain", &self.domain)
            .field("session_id", &self.session_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Result of removing a session from a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnbindOutcome {
    /// The domain was not registered at all.
    UnknownDomain,
    /// Another live session still serves the domain.
    StillServed,
    /// No live session serves the domain any more; the entry was dropped.
    Orphaned,
}

impl UnbindOutcome {
    /// True when a live connection remains for the domain.
    pub fn still_has_live(&self) -> bool {
        matches!(self, Self::StillServed)
    }
}

/// Registry counts for statistics output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatistics {
    /// Domains with at least one registered connection
    pub domains: usize,
    /// Registered connections across all domains
    pub connections: usize,
}

/// Domain to connections map.
///
/// Keys are lower-cased domains. Every stored vector is non-empty and holds
/// at most one connection per session.
pub struct ComponentConnectionRegistry {
    connections: DashMap<String, Arc<Vec<ComponentConnection>>>,
    write_lock: Mutex<()>,
}

impl ComponentConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        info!("Creating component connection registry");
        Self {
            connections: DashMap::new(),
            write_lock: Mutex::new(()),
        }
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `session` as serving `domain`.
    ///
    /// Returns `false` if the pair was already registered.
    #[instrument(skip(self, session), fields(session_id = %session.unique_id()))]
    pub fn bind(&self, domain: &str, session: &SessionRef) -> bool {
        let key = domain.to_lowercase();
        let _guard = self.lock_writes();

        let current = self
            .connections
            .get(&key)
            .map(|entry| Arc::clone(entry.value()));

        if let Some(existing) = &current {
            if existing.iter().any(|c| c.belongs_to(session)) {
                debug!("Session already bound to domain");
                return false;
            }
        }

        let mut updated: Vec<ComponentConnection> =
            current.map(|c| c.as_ref().clone()).unwrap_or_default();
        updated.push(ComponentConnection::new(&key, session));
        let count = updated.len();
        self.connections.insert(key.clone(), Arc::new(updated));

        session.data().update(|state| {
            state.bound_domains.insert(key.clone());
        });

        debug!(connections = count, "Bound component connection");
        true
    }

    /// Remove `session` from `domain`.
    ///
    /// When no remaining connection is live the domain entry is dropped
    /// entirely, so a domain is reported [`UnbindOutcome::Orphaned`] once.
    #[instrument(skip(self, session), fields(session_id = %session.unique_id()))]
    pub fn unbind(&self, domain: &str, session: &SessionRef) -> UnbindOutcome {
        let key = domain.to_lowercase();

        session.data().update(|state| {
            state.bound_domains.remove(&key);
        });

        let _guard = self.lock_writes();

        let Some(current) = self
            .connections
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
        else {
            warn!("Unbind for domain with no registered connections");
            return UnbindOutcome::UnknownDomain;
        };

        let remaining: Vec<ComponentConnection> = current
            .iter()
            .filter(|c| !c.belongs_to(session))
            .cloned()
            .collect();

        if remaining.len() == current.len() {
            debug!("Session was not bound to domain");
        }

        if remaining.iter().any(ComponentConnection::is_connected) {
            let count = remaining.len();
            self.connections.insert(key, Arc::new(remaining));
            debug!(connections = count, "Domain still served");
            UnbindOutcome::StillServed
        } else {
            self.connections.remove(&key);
            debug!(stale = remaining.len(), "Last live connection for domain removed");
            UnbindOutcome::Orphaned
        }
    }

    /// First connected session serving `domain`.
    pub fn select_outbound_session(&self, domain: &str) -> Option<SessionRef> {
        let snapshot = self.connections_for(domain);
        let selected = snapshot
            .iter()
            .filter_map(ComponentConnection::session)
            .find(|s| s.is_connected());

        if selected.is_none() {
            debug!(domain = %domain, "No connected component session for domain");
        }
        selected
    }

    /// Snapshot of the connections for a domain.
    pub fn connections_for(&self, domain: &str) -> Arc<Vec<ComponentConnection>> {
        self.connections
            .get(&domain.to_lowercase())
            .map(|entry| Arc::clone(entry.value()))
            .unwrap_or_default()
    }

    /// True if at least one connected session serves `domain`.
    pub fn has_live_connection(&self, domain: &str) -> bool {
        self.connections_for(domain)
            .iter()
            .any(ComponentConnection::is_connected)
    }

    /// All registered domains, sorted.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        domains.sort();
        domains
    }

    pub fn domain_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.iter().map(|e| e.value().len()).sum()
    }

    pub fn statistics(&self) -> RegistryStatistics {
        RegistryStatistics {
            domains: self.domain_count(),
            connections: self.connection_count(),
        }
    }
}

impl Default for ComponentConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ComponentConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentConnectionRegistry")
            .field("domain_count", &self.domain_count())
            .field("connection_count", &self.connection_count())
            .finish()
    }
}
