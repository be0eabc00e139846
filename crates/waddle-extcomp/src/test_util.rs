//! In-memory session used by unit tests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::packet::Packet;
use crate::session::{ConnectionDirection, Session, SessionData, TlsRole};
use crate::ExtCompError;

pub struct TestSession {
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

impl TestSession {
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

    pub fn push(&self, xml: &str) {
        let default_ns = self
            .data
            .xmlns()
            .unwrap_or_else(|| crate::parser::ns::COMPONENT_ACCEPT.to_string());
        let packet = Packet::parse(xml, &default_ns).unwrap();
        self.inbound.lock().unwrap().push_back(packet);
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    pub fn take_written(&self) -> Vec<String> {
        std::mem::take(&mut *self.written.lock().unwrap())
    }

    pub fn tls_requests(&self) -> Vec<TlsRole> {
        self.tls_requests.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl Session for TestSession {
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
