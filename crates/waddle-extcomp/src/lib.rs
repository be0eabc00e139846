//! # waddle-extcomp
//!
//! External component protocol server for Waddle Social.
//!
//! External components (XEP-0114) are services such as MUC or pubsub that run
//! outside the server process and connect over a dedicated stream. This crate
//! accepts those streams (or dials out to components), authenticates them,
//! binds their domains into the routing fabric and relays packets both ways.
//!
//! ## Architecture
//!
//! - **Transport**: TCP listener and dialer; one IO task per [`TcpSession`](transport::TcpSession)
//! - **Stream open handlers**: pick the negotiation style from the stream namespace
//! - **Processors**: handshake, stream features, STARTTLS, SASL and hostname binding
//! - **Connection registry**: domain to live session mapping, redundant sessions allowed
//! - **Routing**: routing patterns and discovery items published to the fabric
//! - **Reconnect scheduler**: re-dials outbound components after a drop
//!
//! ## Protocols
//!
//! - XEP-0114 (Jabber Component Protocol), accept and connect directions
//! - XEP-0225 style streams: STARTTLS, SASL PLAIN and hostname binding
//! - XEP-0030 disco#items for connected components

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod packet;
pub mod parser;
pub mod processors;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod repository;
pub mod router;
pub mod routing;
pub mod session;
pub mod transport;

mod error;

#[cfg(test)]
mod test_util;

pub use config::ComponentConfig;
pub use error::{
    generate_iq_error, generate_stream_error, stream_errors, ExtCompError, StanzaErrorCondition,
    StanzaErrorType,
};
pub use handlers::{StreamOpenHandler, StreamOpenHandlers, StreamReply};
pub use packet::Packet;
pub use parser::{ns, StreamHeader};
pub use protocol::{ComponentProtocol, ProtocolHandler, ProtocolStatistics, MAX_INACTIVE_TIME};
pub use reconnect::{ConnectionSpec, ReconnectScheduler};
pub use registry::{ComponentConnectionRegistry, UnbindOutcome};
pub use repository::{CompRepoItem, ComponentRepository, InMemoryRepository, RepositoryConfig};
pub use router::PacketRouter;
pub use routing::{InMemoryRoutingTable, RoutingFabric, RoutingPattern, RoutingTableManager};
pub use session::{ConnectionDirection, Session, SessionData, SessionRef, TlsRole};
