//! Listening sockets and the outbound connection manager.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::tcp::TcpSession;
use super::tls::TlsContext;
use crate::protocol::ComponentProtocol;
use crate::reconnect::ConnectionSpec;
use crate::session::ConnectionDirection;
use crate::ExtCompError;

/// Owns the component listeners and dials outbound component connections.
pub struct ComponentTransport {
    protocol: Arc<ComponentProtocol>,
    tls: TlsContext,
    shutdown: CancellationToken,
    listening_ports: Mutex<HashSet<u16>>,
}

impl ComponentTransport {
    pub fn new(
        protocol: Arc<ComponentProtocol>,
        tls: TlsContext,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            tls,
            shutdown,
            listening_ports: Mutex::new(HashSet::new()),
        })
    }

    /// Bind `addr` and accept component connections on it.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<JoinHandle<()>, ExtCompError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.listening_ports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(local.port());
        Ok(self.serve(listener))
    }

    /// Accept component connections on an already bound listener.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        let addr = listener.local_addr().ok();
        info!(addr = ?addr, "Component listener started");

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = transport.shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept component connection");
                        continue;
                    }
                };

                let protocol = Arc::clone(&transport.protocol);
                let tls = transport.tls.clone();
                let shutdown = transport.shutdown.child_token();
                tokio::spawn(TcpSession::serve_inbound(stream, peer, protocol, tls, shutdown));
            }
            info!(addr = ?addr, "Component listener stopped");
        })
    }

    /// Consume connection specs from the reconnect scheduler.
    ///
    /// Connect specs are dialed; accept specs open a listener on their port
    /// unless one is already open.
    pub fn spawn_connection_manager(
        self: &Arc<Self>,
        mut specs: mpsc::UnboundedReceiver<ConnectionSpec>,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let spec = tokio::select! {
                    _ = transport.shutdown.cancelled() => break,
                    spec = specs.recv() => match spec {
                        Some(spec) => spec,
                        None => break,
                    },
                };
                match spec.direction {
                    ConnectionDirection::Connect => transport.dial(spec),
                    ConnectionDirection::Accept => transport.listen_for(spec).await,
                }
            }
            debug!("Connection manager stopped");
        })
    }

    fn dial(self: &Arc<Self>, spec: ConnectionSpec) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let protocol = Arc::clone(&transport.protocol);
            let shutdown = transport.shutdown.child_token();
            let address = spec.address();
            match TcpSession::connect_outbound(spec.clone(), protocol, transport.tls.clone(), shutdown)
                .await
            {
                Ok(()) => info!(domain = %spec.local_domain, address = %address, "Component connection established"),
                Err(e) => {
                    warn!(
                        domain = %spec.local_domain,
                        address = %address,
                        attempt = spec.attempt,
                        error = %e,
                        "Component connection failed"
                    );
                    if !transport.shutdown.is_cancelled() {
                        transport.protocol.scheduler().retry(&spec);
                    }
                }
            }
        });
    }

    async fn listen_for(self: &Arc<Self>, spec: ConnectionSpec) {
        let fresh = self
            .listening_ports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(spec.port);
        if !fresh {
            debug!(port = spec.port, domain = %spec.local_domain, "Port already listening");
            return;
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], spec.port));
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(addr = %addr, domain = %spec.local_domain, "Listening for component");
                self.serve(listener);
            }
            Err(e) => {
                error!(addr = %addr, domain = %spec.local_domain, error = %e, "Failed to open component port");
                self.listening_ports
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&spec.port);
            }
        }
    }
}

impl std::fmt::Debug for ComponentTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentTransport")
            .field("tls", &self.tls)
            .finish()
    }
}
