//! TCP (optionally TLS-upgraded) component session.
//!
//! Each connection is driven by one IO task. The [`TcpSession`] handed to the
//! protocol core only queues commands for that task, so the synchronous
//! [`Session`] methods never block on the socket.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::tls::TlsContext;
use crate::error::{generate_stream_error, stream_errors};
use crate::packet::Packet;
use crate::parser::{StreamEvent, StreamParser};
use crate::protocol::{ComponentProtocol, MAX_INACTIVE_TIME};
use crate::reconnect::ConnectionSpec;
use crate::session::{ConnectionDirection, Session, SessionData, SessionRef, TlsRole};
use crate::ExtCompError;

const READ_BUFFER: usize = 8192;

enum Command {
    Write(String),
    StartTls(TlsRole),
    Stop,
}

#[derive(Default)]
enum StreamInner {
    #[default]
    None,
    Tcp(TcpStream),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl StreamInner {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, ExtCompError> {
        match self {
            StreamInner::None => Err(ExtCompError::internal("Stream not initialized")),
            StreamInner::Tcp(s) => Ok(s.read(buf).await?),
            StreamInner::TlsServer(s) => Ok(s.read(buf).await?),
            StreamInner::TlsClient(s) => Ok(s.read(buf).await?),
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<(), ExtCompError> {
        match self {
            StreamInner::None => Err(ExtCompError::internal("Stream not initialized")),
            StreamInner::Tcp(s) => {
                s.write_all(buf).await?;
                Ok(s.flush().await?)
            }
            StreamInner::TlsServer(s) => {
                s.write_all(buf).await?;
                Ok(s.flush().await?)
            }
            StreamInner::TlsClient(s) => {
                s.write_all(buf).await?;
                Ok(s.flush().await?)
            }
        }
    }

    async fn shutdown(&mut self) {
        let result = match self {
            StreamInner::None => Ok(()),
            StreamInner::Tcp(s) => s.shutdown().await,
            StreamInner::TlsServer(s) => s.shutdown().await,
            StreamInner::TlsClient(s) => s.shutdown().await,
        };
        if let Err(e) = result {
            debug!(error = %e, "Socket shutdown failed");
        }
    }
}

/// A component connection over TCP.
pub struct TcpSession {
    id: String,
    remote: Option<SocketAddr>,
    direction: ConnectionDirection,
    connected: AtomicBool,
    tls_possible: bool,
    tls_active: AtomicBool,
    data: SessionData,
    inbound: Mutex<VecDeque<Packet>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl TcpSession {
    fn new(
        remote: Option<SocketAddr>,
        direction: ConnectionDirection,
        tls_possible: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            remote,
            direction,
            connected: AtomicBool::new(true),
            tls_possible,
            tls_active: AtomicBool::new(false),
            data: SessionData::new(),
            inbound: Mutex::new(VecDeque::new()),
            commands: tx,
        });
        (session, rx)
    }

    fn send(&self, command: Command) -> Result<(), ExtCompError> {
        if !self.is_connected() {
            return Err(ExtCompError::SessionClosed(self.id.clone()));
        }
        self.commands
            .send(command)
            .map_err(|_| ExtCompError::SessionClosed(self.id.clone()))
    }

    fn push_inbound(&self, packet: Packet) {
        self.inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(packet);
    }

    /// Serve an accepted socket until it closes.
    pub async fn serve_inbound(
        stream: TcpStream,
        peer: SocketAddr,
        protocol: Arc<ComponentProtocol>,
        tls: TlsContext,
        shutdown: CancellationToken,
    ) {
        let (session, commands) =
            TcpSession::new(Some(peer), ConnectionDirection::Accept, tls.acceptor.is_some());
        let span = info_span!(
            "extcomp.session",
            session_id = %session.id,
            peer = %peer,
            direction = "accept"
        );
        SessionDriver::new(session, StreamInner::Tcp(stream), commands, protocol, tls)
            .run(shutdown)
            .instrument(span)
            .await;
    }

    /// Dial the remote end of `spec` and serve the connection until it closes.
    ///
    /// Errors are returned only when the dial itself fails.
    pub async fn connect_outbound(
        spec: ConnectionSpec,
        protocol: Arc<ComponentProtocol>,
        tls: TlsContext,
        shutdown: CancellationToken,
    ) -> Result<(), ExtCompError> {
        let stream = TcpStream::connect(spec.address()).await?;
        let peer = stream.peer_addr().ok();
        let (session, commands) =
            TcpSession::new(peer, ConnectionDirection::Connect, tls.connector.is_some());
        let domain = spec.local_domain.clone();
        session
            .data
            .update(|state| state.connection_spec = Some(spec));

        let span = info_span!(
            "extcomp.session",
            session_id = %session.id,
            domain = %domain,
            direction = "connect"
        );
        let driver = SessionDriver::new(session, StreamInner::Tcp(stream), commands, protocol, tls);
        tokio::spawn(driver.run(shutdown).instrument(span));
        Ok(())
    }
}

impl Session for TcpSession {
    fn unique_id(&self) -> &str {
        &self.id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn data(&self) -> &SessionData {
        &self.data
    }

    fn poll_packet(&self) -> Option<Packet> {
        self.inbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    fn write_packet(&self, packet: &Packet) -> Result<(), ExtCompError> {
        self.send(Command::Write(packet.to_xml()?))
    }

    fn write_raw(&self, data: &str) -> Result<(), ExtCompError> {
        self.send(Command::Write(data.to_string()))
    }

    fn can_start_tls(&self) -> bool {
        self.tls_possible
    }

    fn is_tls_active(&self) -> bool {
        self.tls_active.load(Ordering::SeqCst)
    }

    fn start_tls(&self, role: TlsRole) -> Result<(), ExtCompError> {
        if !self.tls_possible {
            return Err(ExtCompError::stream("TLS is not configured"));
        }
        self.send(Command::StartTls(role))
    }

    fn stop(&self) {
        if self.commands.send(Command::Stop).is_err() {
            debug!(session_id = %self.id, "Session IO task already finished");
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// IO task state for one [`TcpSession`].
struct SessionDriver {
    session: Arc<TcpSession>,
    inner: StreamInner,
    parser: StreamParser,
    commands: mpsc::UnboundedReceiver<Command>,
    protocol: Arc<ComponentProtocol>,
    tls: TlsContext,
}

enum Flow {
    Continue,
    Close,
}

impl SessionDriver {
    fn new(
        session: Arc<TcpSession>,
        inner: StreamInner,
        commands: mpsc::UnboundedReceiver<Command>,
        protocol: Arc<ComponentProtocol>,
        tls: TlsContext,
    ) -> Self {
        Self {
            session,
            inner,
            parser: StreamParser::new(),
            commands,
            protocol,
            tls,
        }
    }

    fn session_ref(&self) -> SessionRef {
        self.session.clone()
    }

    async fn run(mut self, shutdown: CancellationToken) {
        let session = self.session_ref();
        info!(remote = ?session.remote_address(), "Component connection opened");

        if session.direction() == ConnectionDirection::Connect {
            self.protocol.session_started(&session);
        }

        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            let flow = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    let error = generate_stream_error(stream_errors::SYSTEM_SHUTDOWN, None);
                    let _ = self.inner.write_all(error.as_bytes()).await;
                    Flow::Close
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => Flow::Close,
                },
                read = tokio::time::timeout(MAX_INACTIVE_TIME, self.inner.read(&mut buf)) => match read {
                    Ok(Ok(0)) => {
                        debug!("Peer closed the connection");
                        Flow::Close
                    }
                    Ok(Ok(n)) => {
                        self.parser.feed(&buf[..n]);
                        self.drain_events().await
                    }
                    Ok(Err(e)) => {
                        debug!(error = %e, "Read failed");
                        Flow::Close
                    }
                    Err(_) => {
                        info!("Closing inactive component connection");
                        Flow::Close
                    }
                },
            };

            if matches!(flow, Flow::Close) {
                break;
            }
        }

        self.session.connected.store(false, Ordering::SeqCst);
        self.flush_pending_writes().await;
        self.inner.shutdown().await;
        self.protocol.session_stopped(&session);
        info!("Component connection closed");
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Write(data) => match self.inner.write_all(data.as_bytes()).await {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    debug!(error = %e, "Write failed");
                    Flow::Close
                }
            },
            Command::StartTls(role) => match self.upgrade(role).await {
                Ok(()) => Flow::Continue,
                Err(e) => {
                    warn!(error = %e, role = ?role, "TLS negotiation failed");
                    Flow::Close
                }
            },
            Command::Stop => Flow::Close,
        }
    }

    /// Write whatever was queued before the stop.
    async fn flush_pending_writes(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Write(data) = command {
                if self.inner.write_all(data.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn upgrade(&mut self, role: TlsRole) -> Result<(), ExtCompError> {
        let tcp = match std::mem::take(&mut self.inner) {
            StreamInner::Tcp(s) => s,
            StreamInner::None => return Err(ExtCompError::internal("Stream already taken")),
            _ => return Err(ExtCompError::stream("Already using TLS")),
        };

        self.inner = match role {
            TlsRole::Server => {
                let acceptor = self
                    .tls
                    .acceptor
                    .clone()
                    .ok_or_else(|| ExtCompError::stream("TLS acceptor not configured"))?;
                let tls = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| ExtCompError::internal(format!("TLS accept error: {}", e)))?;
                StreamInner::TlsServer(Box::new(tls))
            }
            TlsRole::Client => {
                let connector = self
                    .tls
                    .connector
                    .clone()
                    .ok_or_else(|| ExtCompError::stream("TLS connector not configured"))?;
                let name = self
                    .session
                    .data
                    .read(|state| state.connection_spec.as_ref().map(|s| s.remote_host.clone()))
                    .ok_or_else(|| ExtCompError::stream("No remote host for TLS"))?;
                let server_name = ServerName::try_from(name)
                    .map_err(|e| ExtCompError::stream(format!("Invalid TLS server name: {}", e)))?;
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| ExtCompError::internal(format!("TLS connect error: {}", e)))?;
                StreamInner::TlsClient(Box::new(tls))
            }
        };

        self.parser.reset();
        self.session.tls_active.store(true, Ordering::SeqCst);
        info!(role = ?role, "TLS upgrade complete");
        Ok(())
    }

    async fn drain_events(&mut self) -> Flow {
        let session = self.session_ref();
        loop {
            match self.parser.next_event() {
                Ok(None) => return Flow::Continue,
                Ok(Some(StreamEvent::Open(header))) => {
                    self.protocol.stream_opened(&session, &header);
                }
                Ok(Some(StreamEvent::Element(element))) => {
                    self.session.push_inbound(Packet::new(element));
                    self.protocol.process_socket_data(&session);
                }
                Ok(Some(StreamEvent::Close)) => {
                    debug!("Peer closed the stream");
                    let _ = self.inner.write_all(b"</stream:stream>").await;
                    return Flow::Close;
                }
                Err(e) => {
                    warn!(error = %e, "Malformed XML from component");
                    let error = generate_stream_error(stream_errors::NOT_WELL_FORMED, None);
                    let _ = self.inner.write_all(error.as_bytes()).await;
                    return Flow::Close;
                }
            }

            // Commands queued while handling the event (TLS upgrade, stop)
            // take effect before the next buffered event is parsed.
            while let Ok(command) = self.commands.try_recv() {
                if matches!(self.handle_command(command).await, Flow::Close) {
                    return Flow::Close;
                }
            }
        }
    }
}
