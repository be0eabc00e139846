//! Socket transport for component sessions.
//!
//! [`ComponentTransport`] accepts inbound component connections and dials
//! outbound ones as the reconnect scheduler asks for them. Every connection
//! becomes a [`TcpSession`] driven by its own IO task.

mod listener;
mod tcp;
pub mod tls;

pub use listener::ComponentTransport;
pub use tcp::TcpSession;
pub use tls::{load_tls_acceptor, load_tls_connector, TlsContext};
