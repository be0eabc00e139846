//! Common test utilities for external component integration tests.
//!
//! Provides an in-memory [`MockSession`], a [`RecordingFabric`] that keeps
//! every routing change it sees, protocol builders, generated TLS credentials
//! and a raw socket client for transport tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::io::{BufReader, Cursor};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use waddle_extcomp::processors::ProcessorPipeline;
use waddle_extcomp::routing::DiscoveryAnnouncement;
use waddle_extcomp::{
    ns, CompRepoItem, ComponentConfig, ComponentProtocol, ConnectionDirection, ConnectionSpec,
    ExtCompError, Packet, ReconnectScheduler, RepositoryConfig, RoutingFabric, RoutingPattern,
    Session, SessionData, SessionRef, StreamHeader, TlsRole,
};

static INIT: Once = Once::new();

/// Install the rustls crypto provider and a test log writer, once per binary.
pub fn init_test() {
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// In-memory session driven directly by the tests.
pub struct MockSession {
    id: String,
    direction: ConnectionDirection,
    connected: AtomicBool,
    tls_possible: AtomicBool,
    tls_active: AtomicBool,
    data: SessionData,
    inbound: Mutex<VecDeque<Packet>>,
    written: Mutex<Vec<String>>,
    tls_requests: Mutex<Vec<TlsRole>>,
    stop_calls: AtomicUsize,
}

impl MockSession {
    pub fn new(id: &str, direction: ConnectionDirection) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            direction,
            connected: AtomicBool::new(true),
            tls_possible: AtomicBool::new(false),
            tls_active: AtomicBool::new(false),
            data: SessionData::new(),
            inbound: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            tls_requests: Mutex::new(Vec::new()),
            stop_calls: AtomicUsize::new(0),
        })
    }

    pub fn accept(id: &str) -> Arc<Self> {
        Self::new(id, ConnectionDirection::Accept)
    }

    pub fn connect(id: &str) -> Arc<Self> {
        Self::new(id, ConnectionDirection::Connect)
    }

    pub fn enable_tls(&self) {
        self.tls_possible.store(true, Ordering::SeqCst);
    }

    /// Queue an inbound element, parsed in the session's stream namespace.
    pub fn push(&self, xml: &str) {
        let default_ns = self
            .data
            .xmlns()
            .unwrap_or_else(|| ns::COMPONENT_ACCEPT.to_string());
        let packet = Packet::parse(xml, &default_ns).expect("test packet must parse");
        self.inbound.lock().unwrap().push_back(packet);
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    pub fn take_written(&self) -> Vec<String> {
        std::mem::take(&mut *self.written.lock().unwrap())
    }

    pub fn wrote(&self, needle: &str) -> bool {
        self.written.lock().unwrap().iter().any(|w| w.contains(needle))
    }

    pub fn tls_requests(&self) -> Vec<TlsRole> {
        self.tls_requests.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Drop the connection without going through `stop`.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Session for MockSession {
    fn unique_id(&self) -> &str {
        &self.id
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        None
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
        self.inbound.lock().unwrap().pop_front()
    }

    fn write_packet(&self, packet: &Packet) -> Result<(), ExtCompError> {
        self.written.lock().unwrap().push(packet.to_xml()?);
        Ok(())
    }

    fn write_raw(&self, data: &str) -> Result<(), ExtCompError> {
        self.written.lock().unwrap().push(data.to_string());
        Ok(())
    }

    fn can_start_tls(&self) -> bool {
        self.tls_possible.load(Ordering::SeqCst) && !self.is_tls_active()
    }

    fn is_tls_active(&self) -> bool {
        self.tls_active.load(Ordering::SeqCst)
    }

    fn start_tls(&self, role: TlsRole) -> Result<(), ExtCompError> {
        self.tls_requests.lock().unwrap().push(role);
        self.tls_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Routing fabric that records every call made to it.
#[derive(Default)]
pub struct RecordingFabric {
    patterns: Mutex<HashSet<RoutingPattern>>,
    adds: Mutex<Vec<RoutingPattern>>,
    removes: Mutex<Vec<RoutingPattern>>,
    delivered: Mutex<Vec<Packet>>,
    announcements: Mutex<Vec<DiscoveryAnnouncement>>,
}

impl RecordingFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Live patterns, rendered and sorted.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .patterns
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.to_string())
            .collect();
        patterns.sort();
        patterns
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        let patterns = self.patterns.lock().unwrap();
        RoutingPattern::for_domain(domain)
            .iter()
            .all(|p| patterns.contains(p))
    }

    pub fn add_count(&self, domain: &str) -> usize {
        self.adds
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.domain() == domain)
            .count()
    }

    pub fn remove_count(&self, domain: &str) -> usize {
        self.removes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.domain() == domain)
            .count()
    }

    pub fn delivered(&self) -> Vec<Packet> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn announcements(&self) -> Vec<DiscoveryAnnouncement> {
        self.announcements.lock().unwrap().clone()
    }
}

impl RoutingFabric for RecordingFabric {
    fn add_routing_pattern(&self, pattern: &RoutingPattern) -> Result<(), ExtCompError> {
        self.adds.lock().unwrap().push(pattern.clone());
        self.patterns.lock().unwrap().insert(pattern.clone());
        Ok(())
    }

    fn remove_routing_pattern(&self, pattern: &RoutingPattern) -> Result<(), ExtCompError> {
        self.removes.lock().unwrap().push(pattern.clone());
        self.patterns.lock().unwrap().remove(pattern);
        Ok(())
    }

    fn deliver(&self, packet: Packet) -> Result<(), ExtCompError> {
        self.delivered.lock().unwrap().push(packet);
        Ok(())
    }

    fn announce_discovery_item(
        &self,
        announcement: &DiscoveryAnnouncement,
    ) -> Result<(), ExtCompError> {
        self.announcements.lock().unwrap().push(announcement.clone());
        Ok(())
    }
}

/// Shared secret used by every fixture component.
pub const SECRET: &str = "s3cret";

/// Configuration with the given components in the in-memory repository.
pub fn config_with(items: Vec<CompRepoItem>) -> ComponentConfig {
    ComponentConfig {
        repository: RepositoryConfig {
            components: items,
            ..Default::default()
        },
        reconnect_delay_ms: 50,
        ..Default::default()
    }
}

/// Configuration with a single component, `muc.example.com`.
pub fn default_config() -> ComponentConfig {
    config_with(vec![CompRepoItem::new("muc.example.com", SECRET)])
}

/// A protocol under test with its fabric and the scheduler's spec receiver.
pub struct TestProtocol {
    pub protocol: Arc<ComponentProtocol>,
    pub fabric: Arc<RecordingFabric>,
    pub specs: mpsc::UnboundedReceiver<ConnectionSpec>,
}

impl TestProtocol {
    pub fn new(config: ComponentConfig) -> Self {
        Self::with_pipeline(config, ProcessorPipeline::standard())
    }

    pub fn with_pipeline(config: ComponentConfig, pipeline: ProcessorPipeline) -> Self {
        let fabric = RecordingFabric::new();
        let (scheduler, specs) = ReconnectScheduler::new(config.reconnect_delay());
        let protocol = Arc::new(ComponentProtocol::with_pipeline(
            fabric.clone(),
            Arc::new(scheduler),
            pipeline,
        ));
        protocol.apply_config(&config);
        Self {
            protocol,
            fabric,
            specs,
        }
    }

    /// Open a legacy accept stream addressed to `domain`.
    pub fn open_accept_stream(&self, session: &SessionRef, domain: &str) {
        self.protocol.stream_opened(
            session,
            &header(Some(ns::COMPONENT_ACCEPT), Some(domain), None),
        );
    }

    /// Run the full legacy accept handshake for `domain`.
    pub fn handshake(&self, mock: &Arc<MockSession>, domain: &str, secret: &str) {
        let session: SessionRef = mock.clone();
        self.open_accept_stream(&session, domain);
        let stream_id = session
            .data()
            .stream_id()
            .expect("stream id assigned on open");
        mock.push(&format!(
            "<handshake>{}</handshake>",
            waddle_extcomp::processors::handshake_digest(&stream_id, secret)
        ));
        self.protocol.process_socket_data(&session);
    }
}

pub fn header(xmlns: Option<&str>, to: Option<&str>, version: Option<&str>) -> StreamHeader {
    StreamHeader {
        xmlns: xmlns.map(str::to_string),
        to: to.map(str::to_string),
        version: version.map(str::to_string),
        ..Default::default()
    }
}

/// SASL PLAIN payload for a component domain.
pub fn encode_sasl_plain(domain: &str, secret: &str) -> String {
    use base64::prelude::*;
    BASE64_STANDARD.encode(format!("\0{}\0{}", domain, secret))
}

/// Generated TLS credentials for testing.
pub struct TestTlsCredentials {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub cert_der: CertificateDer<'static>,
}

impl TestTlsCredentials {
    /// Generate self-signed TLS credentials for testing.
    pub fn generate(domain: &str) -> Self {
        let subject_alt_names = vec![domain.to_string(), "localhost".to_string()];
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
            .expect("Failed to generate test certificate");

        Self {
            cert_pem: cert.pem().into_bytes(),
            key_pem: key_pair.serialize_pem().into_bytes(),
            cert_der: CertificateDer::from(cert.der().to_vec()),
        }
    }

    /// Create a TLS acceptor (server-side) from these credentials.
    pub fn tls_acceptor(&self) -> TlsAcceptor {
        use rustls_pemfile::{certs, pkcs8_private_keys};

        let certs: Vec<CertificateDer> = certs(&mut BufReader::new(Cursor::new(&self.cert_pem)))
            .filter_map(|r| r.ok())
            .collect();
        let key = pkcs8_private_keys(&mut BufReader::new(Cursor::new(&self.key_pem)))
            .filter_map(|r| r.ok())
            .next()
            .expect("No private key");

        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))
            .expect("Failed to create server config");

        TlsAcceptor::from(Arc::new(server_config))
    }

    /// Create a TLS connector (client-side) that trusts this certificate.
    pub fn tls_connector(&self) -> TlsConnector {
        let mut root_store = RootCertStore::empty();
        root_store.add(self.cert_der.clone()).expect("Failed to add cert");

        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        TlsConnector::from(Arc::new(client_config))
    }
}

/// Raw socket client speaking to a component listener.
pub struct RawComponentClient {
    tcp: Option<TcpStream>,
    tls: Option<tokio_rustls::client::TlsStream<TcpStream>>,
    buffer: String,
}

impl RawComponentClient {
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        Ok(Self {
            tcp: Some(tcp),
            tls: None,
            buffer: String::new(),
        })
    }

    pub async fn send(&mut self, data: &str) -> std::io::Result<()> {
        if let Some(ref mut tls) = self.tls {
            tls.write_all(data.as_bytes()).await?;
            tls.flush().await?;
        } else if let Some(ref mut tcp) = self.tcp {
            tcp.write_all(data.as_bytes()).await?;
            tcp.flush().await?;
        }
        Ok(())
    }

    /// Read once. Returns 0 when the peer closed.
    pub async fn read(&mut self, timeout_dur: Duration) -> std::io::Result<usize> {
        let mut buf = [0u8; 4096];
        let n = timeout(timeout_dur, async {
            if let Some(ref mut tls) = self.tls {
                tls.read(&mut buf).await
            } else if let Some(ref mut tcp) = self.tcp {
                tcp.read(&mut buf).await
            } else {
                Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "Not connected",
                ))
            }
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "Timeout"))??;

        self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
        Ok(n)
    }

    /// Read until `pattern` shows up in the buffer.
    pub async fn read_until(
        &mut self,
        pattern: &str,
        timeout_dur: Duration,
    ) -> std::io::Result<String> {
        let start = std::time::Instant::now();
        while !self.buffer.contains(pattern) {
            if start.elapsed() > timeout_dur {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("Timeout waiting for: {}", pattern),
                ));
            }
            let remaining = timeout_dur.saturating_sub(start.elapsed());
            if self.read(remaining).await? == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("Closed before: {}", pattern),
                ));
            }
        }
        Ok(self.buffer.clone())
    }

    /// Read until the peer closes the connection.
    pub async fn read_to_close(&mut self, timeout_dur: Duration) -> std::io::Result<String> {
        while self.read(timeout_dur).await? > 0 {}
        Ok(self.buffer.clone())
    }

    pub fn take_buffer(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    pub async fn upgrade_tls(&mut self, connector: TlsConnector, domain: &str) -> std::io::Result<()> {
        let tcp = self.tcp.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "No TCP connection or already TLS")
        })?;

        let server_name: rustls::pki_types::ServerName<'static> =
            domain.to_string().try_into().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid server name")
            })?;

        self.tls = Some(connector.connect(server_name, tcp).await?);
        self.buffer.clear();
        Ok(())
    }
}

/// Pull the `id` attribute out of a stream header.
pub fn extract_stream_id(data: &str) -> Option<String> {
    let start = data.find("<stream:stream")?;
    let header = &data[start..];
    let header = &header[..header.find('>')?];
    for quote in ['\'', '"'] {
        let needle = format!(" id={}", quote);
        if let Some(pos) = header.find(&needle) {
            let rest = &header[pos + needle.len()..];
            return rest.find(quote).map(|end| rest[..end].to_string());
        }
    }
    None
}
