//! Session contract between the transport and the protocol core.
//!
//! The transport owns sockets and byte framing; the protocol core only sees
//! [`Session`] trait objects. Everything the core needs to remember about a
//! connection lives in that session's [`SessionData`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::packet::Packet;
use crate::reconnect::ConnectionSpec;
use crate::repository::CompRepoItem;
use crate::ExtCompError;

/// Which side opened the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionDirection {
    /// The component connected to us.
    #[default]
    Accept,
    /// We connected to the component.
    Connect,
}

impl ConnectionDirection {
    /// Configuration name of this direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Connect => "connect",
        }
    }
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionDirection {
    type Err = ExtCompError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" | "listen" => Ok(Self::Accept),
            "connect" => Ok(Self::Connect),
            other => Err(ExtCompError::config(format!(
                "Unknown connection direction: {}",
                other
            ))),
        }
    }
}

/// Side of a TLS handshake the session should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    /// We are the TLS server (peer sent `<starttls/>`).
    Server,
    /// We are the TLS client (peer answered `<proceed/>`).
    Client,
}

/// Protocol state recorded on a session.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Primary domain the component authenticated as.
    pub hostname: Option<String>,
    /// Whether the handshake or SASL exchange succeeded.
    pub authenticated: bool,
    /// Repository entry matched for this session.
    pub repo_item: Option<CompRepoItem>,
    /// Extra hostnames this session should ask the peer to bind.
    pub bind_hostnames: Vec<String>,
    /// Every domain this session is registered for.
    pub bound_domains: BTreeSet<String>,
    /// Stream id (ours on accept, the peer's on connect).
    pub stream_id: Option<String>,
    /// Namespace of the current stream.
    pub xmlns: Option<String>,
    /// Configuration an outbound session was dialed with.
    pub connection_spec: Option<ConnectionSpec>,
    /// Set once teardown ran.
    pub stopped: bool,
    /// Free-form values owned by individual processors.
    pub values: HashMap<String, String>,
}

/// Lock-protected [`SessionState`] shared between the transport task and the
/// protocol core.
#[derive(Debug, Default)]
pub struct SessionData {
    state: RwLock<SessionState>,
}

impl SessionData {
    /// Create empty session data.
    pub fn new() -> Self {
        Self::default()
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read the state under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.read_guard())
    }

    /// Mutate the state under the lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.write_guard())
    }

    /// Clone of the current state.
    pub fn snapshot(&self) -> SessionState {
        self.read_guard().clone()
    }

    pub fn hostname(&self) -> Option<String> {
        self.read_guard().hostname.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_guard().authenticated
    }

    pub fn repo_item(&self) -> Option<CompRepoItem> {
        self.read_guard().repo_item.clone()
    }

    pub fn stream_id(&self) -> Option<String> {
        self.read_guard().stream_id.clone()
    }

    pub fn xmlns(&self) -> Option<String> {
        self.read_guard().xmlns.clone()
    }

    /// Copy of the bound domain set, safe to iterate while other tasks bind
    /// or unbind.
    pub fn bound_domains(&self) -> Vec<String> {
        self.read_guard().bound_domains.iter().cloned().collect()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.read_guard().values.get(key).cloned()
    }

    pub fn set_value(&self, key: &str, value: impl Into<String>) {
        self.write_guard()
            .values
            .insert(key.to_string(), value.into());
    }

    /// Mark teardown as done. Returns `false` if it already ran.
    pub fn mark_stopped(&self) -> bool {
        let mut state = self.write_guard();
        if state.stopped {
            false
        } else {
            state.stopped = true;
            true
        }
    }
}

/// A live component connection as seen by the protocol core.
pub trait Session: Send + Sync {
    /// Stable identifier, unique per process.
    fn unique_id(&self) -> &str;

    /// Peer address, if known.
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Which side opened the connection.
    fn direction(&self) -> ConnectionDirection;

    /// True while the underlying transport can still carry data.
    fn is_connected(&self) -> bool;

    /// Protocol state attached to this session.
    fn data(&self) -> &SessionData;

    /// Take the next inbound packet waiting to be processed.
    fn poll_packet(&self) -> Option<Packet>;

    /// Queue a packet for writing.
    fn write_packet(&self, packet: &Packet) -> Result<(), ExtCompError>;

    /// Queue raw stream data (headers, stream errors) for writing.
    fn write_raw(&self, data: &str) -> Result<(), ExtCompError>;

    /// True when this session may negotiate TLS.
    fn can_start_tls(&self) -> bool {
        false
    }

    /// True once TLS is active.
    fn is_tls_active(&self) -> bool {
        false
    }

    /// Upgrade the transport to TLS after all previously queued writes.
    fn start_tls(&self, role: TlsRole) -> Result<(), ExtCompError> {
        let _ = role;
        Err(ExtCompError::stream("TLS is not available on this session"))
    }

    /// Close the session after flushing queued writes.
    fn stop(&self);
}

/// Shared handle to a session.
pub type SessionRef = Arc<dyn Session>;

/// Write every queued packet to the session, draining the queue.
///
/// Failed writes are logged; the remaining packets are still attempted.
pub fn write_packets(session: &SessionRef, queue: &mut std::collections::VecDeque<Packet>) {
    while let Some(packet) = queue.pop_front() {
        if let Err(e) = session.write_packet(&packet) {
            tracing::warn!(
                session_id = %session.unique_id(),
                error = %e,
                "Failed to write packet to session"
            );
        }
    }
}
