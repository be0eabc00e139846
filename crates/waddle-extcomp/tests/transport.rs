//! Socket-level tests for the component transport.
//!
//! A [`ComponentTransport`] serves a loopback listener and a raw client plays
//! the component side of the stream.
//!
//! Run with: `cargo test -p waddle-extcomp --test transport`

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    default_config, encode_sasl_plain, extract_stream_id, init_test, RawComponentClient,
    RecordingFabric, TestProtocol, TestTlsCredentials, SECRET,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use waddle_extcomp::processors::handshake_digest;
use waddle_extcomp::transport::{ComponentTransport, TlsContext};
use waddle_extcomp::{ns, Packet};

const MUC: &str = "muc.example.com";
const TIMEOUT: Duration = Duration::from_secs(5);

async fn serve(test: &TestProtocol, tls: TlsContext) -> (std::net::SocketAddr, CancellationToken) {
    let shutdown = CancellationToken::new();
    let transport = ComponentTransport::new(Arc::clone(&test.protocol), tls, shutdown.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    transport.serve(listener);
    (addr, shutdown)
}

fn stream_open(xmlns: &str, version: Option<&str>) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' to='{}'{}>",
        xmlns,
        ns::STREAM,
        MUC,
        version
            .map(|v| format!(" version='{}'", v))
            .unwrap_or_default()
    )
}

async fn wait_for(fabric: &RecordingFabric, what: &str, check: impl Fn(&RecordingFabric) -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check(fabric) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_legacy_component_session_over_tcp() {
    init_test();
    let test = TestProtocol::new(default_config());
    let (addr, shutdown) = serve(&test, TlsContext::default()).await;

    let mut client = RawComponentClient::connect(addr).await.unwrap();
    client
        .send(&stream_open(ns::COMPONENT_ACCEPT, None))
        .await
        .unwrap();
    let header = client.read_until("'>", TIMEOUT).await.unwrap();
    let stream_id = extract_stream_id(&header).expect("stream id in reply header");
    client.take_buffer();

    client
        .send(&format!(
            "<handshake>{}</handshake>",
            handshake_digest(&stream_id, SECRET)
        ))
        .await
        .unwrap();
    client.read_until("<handshake", TIMEOUT).await.unwrap();
    assert!(test.fabric.has_domain(MUC));
    client.take_buffer();

    // Component to fabric.
    client
        .send("<message to='user@example.com' from='room@muc.example.com'><body>hi</body></message>")
        .await
        .unwrap();
    wait_for(&test.fabric, "delivery", |f| !f.delivered().is_empty()).await;
    assert_eq!(test.fabric.delivered()[0].to(), Some("user@example.com"));

    // Fabric to component.
    let packet = Packet::parse(
        "<message to='room@muc.example.com' from='user@example.com'><body>yo</body></message>",
        ns::COMPONENT_ACCEPT,
    )
    .unwrap();
    test.protocol.deliver_outbound(&packet).unwrap();
    client.read_until("yo</body>", TIMEOUT).await.unwrap();

    client.send("</stream:stream>").await.unwrap();
    let rest = client.read_to_close(TIMEOUT).await.unwrap();
    assert!(rest.contains("</stream:stream>"));

    wait_for(&test.fabric, "retraction", |f| f.patterns().is_empty()).await;
    assert_eq!(test.protocol.statistics().connections, 0);
    shutdown.cancel();
}

#[tokio::test]
async fn test_bad_handshake_closes_socket() {
    init_test();
    let test = TestProtocol::new(default_config());
    let (addr, shutdown) = serve(&test, TlsContext::default()).await;

    let mut client = RawComponentClient::connect(addr).await.unwrap();
    client
        .send(&stream_open(ns::COMPONENT_ACCEPT, None))
        .await
        .unwrap();
    client.read_until("'>", TIMEOUT).await.unwrap();
    client.send("<handshake>deadbeef</handshake>").await.unwrap();

    let rest = client.read_to_close(TIMEOUT).await.unwrap();
    assert!(rest.contains("not-authorized"));
    assert!(test.fabric.patterns().is_empty());
    shutdown.cancel();
}

#[tokio::test]
async fn test_malformed_xml_is_not_well_formed() {
    init_test();
    let test = TestProtocol::new(default_config());
    let (addr, shutdown) = serve(&test, TlsContext::default()).await;

    let mut client = RawComponentClient::connect(addr).await.unwrap();
    client
        .send(&stream_open(ns::COMPONENT_ACCEPT, None))
        .await
        .unwrap();
    client.read_until("'>", TIMEOUT).await.unwrap();
    client.send("<message><body></message></body>").await.unwrap();

    let rest = client.read_to_close(TIMEOUT).await.unwrap();
    assert!(rest.contains("not-well-formed"));
    shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_sends_system_shutdown() {
    init_test();
    let test = TestProtocol::new(default_config());
    let (addr, shutdown) = serve(&test, TlsContext::default()).await;

    let mut client = RawComponentClient::connect(addr).await.unwrap();
    client
        .send(&stream_open(ns::COMPONENT_ACCEPT, None))
        .await
        .unwrap();
    client.read_until("'>", TIMEOUT).await.unwrap();

    shutdown.cancel();
    let rest = client.read_to_close(TIMEOUT).await.unwrap();
    assert!(rest.contains("system-shutdown"));
}

#[tokio::test]
async fn test_client_stream_starttls_and_sasl() {
    init_test();
    let credentials = TestTlsCredentials::generate(MUC);
    let tls = TlsContext::new(Some(credentials.tls_acceptor()), None);
    let test = TestProtocol::new(default_config());
    let (addr, shutdown) = serve(&test, tls).await;

    let mut client = RawComponentClient::connect(addr).await.unwrap();
    client
        .send(&stream_open(ns::JABBER_CLIENT, Some("1.0")))
        .await
        .unwrap();
    let features = client
        .read_until("</stream:features>", TIMEOUT)
        .await
        .unwrap();
    assert!(features.contains(ns::TLS));
    client.take_buffer();

    client
        .send(&format!("<starttls xmlns='{}'/>", ns::TLS))
        .await
        .unwrap();
    client.read_until("<proceed", TIMEOUT).await.unwrap();
    client
        .upgrade_tls(credentials.tls_connector(), MUC)
        .await
        .unwrap();

    client
        .send(&stream_open(ns::JABBER_CLIENT, Some("1.0")))
        .await
        .unwrap();
    let features = client
        .read_until("</stream:features>", TIMEOUT)
        .await
        .unwrap();
    assert!(!features.contains(ns::TLS));
    assert!(features.contains("PLAIN"));
    client.take_buffer();

    client
        .send(&format!(
            "<auth xmlns='{}' mechanism='PLAIN'>{}</auth>",
            ns::SASL,
            encode_sasl_plain(MUC, SECRET)
        ))
        .await
        .unwrap();
    client.read_until("<success", TIMEOUT).await.unwrap();
    assert!(test.fabric.has_domain(MUC));

    shutdown.cancel();
}
