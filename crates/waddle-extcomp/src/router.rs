//! Packet router for the in-process routing fabric.
//!
//! Packets delivered by components land in the [`InMemoryRoutingTable`]
//! channel. The router spreads them over worker tasks by destination hash,
//! so packets for one address keep their order, and hands each one to the
//! component serving its destination.
//!
//! Service discovery queries addressed to the local domain are answered from
//! the table's announced items.

use std::sync::Arc;

use minidom::Element;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{generate_iq_error, StanzaErrorCondition};
use crate::packet::Packet;
use crate::parser::ns;
use crate::protocol::ComponentProtocol;
use crate::routing::InMemoryRoutingTable;

/// Queue depth per worker.
const WORKER_QUEUE: usize = 1024;

pub struct PacketRouter {
    protocol: Arc<ComponentProtocol>,
    table: Arc<InMemoryRoutingTable>,
    local_domain: String,
}

impl PacketRouter {
    pub fn new(
        protocol: Arc<ComponentProtocol>,
        table: Arc<InMemoryRoutingTable>,
        local_domain: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            table,
            local_domain: local_domain.into().to_lowercase(),
        }
    }

    /// Spawn the dispatcher and `workers` worker tasks.
    ///
    /// The returned handle completes once `shutdown` is cancelled or the
    /// delivery channel closes.
    pub fn spawn(
        self,
        mut deliveries: mpsc::UnboundedReceiver<Packet>,
        workers: usize,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let router = Arc::new(self);
        let workers = workers.max(1);

        let queues: Vec<mpsc::Sender<Packet>> = (0..workers)
            .map(|index| {
                let (tx, mut rx) = mpsc::channel::<Packet>(WORKER_QUEUE);
                let router = Arc::clone(&router);
                tokio::spawn(async move {
                    while let Some(packet) = rx.recv().await {
                        router.route(packet);
                    }
                    debug!(worker = index, "Router worker stopped");
                });
                tx
            })
            .collect();

        info!(workers, local_domain = %router.local_domain, "Packet router started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Packet router shutting down");
                        break;
                    }
                    packet = deliveries.recv() => {
                        let Some(packet) = packet else {
                            debug!("Delivery channel closed");
                            break;
                        };
                        let index = (router.protocol.packet_hash(&packet) % queues.len() as u64) as usize;
                        if queues[index].send(packet).await.is_err() {
                            warn!(worker = index, "Router worker is gone, dropping packet");
                        }
                    }
                }
            }
        })
    }

    /// Route one packet delivered by a component.
    pub fn route(&self, packet: Packet) {
        if let Some(reply) = self.local_disco_reply(&packet) {
            self.send_back(reply);
            return;
        }

        let destination = packet.elem_to().unwrap_or_default().to_string();
        if self.table.lookup(&destination).is_none() {
            debug!(to = %destination, element = packet.name(), "No route for packet");
            self.bounce(&packet);
            return;
        }

        if let Err(e) = self.protocol.deliver_outbound(&packet) {
            warn!(to = %destination, error = %e, "Failed to deliver packet to component");
            self.bounce(&packet);
        }
    }

    /// Answer `disco#items` queries addressed to the local domain.
    fn local_disco_reply(&self, packet: &Packet) -> Option<Packet> {
        if packet.name() != "iq" || packet.attr("type") != Some("get") {
            return None;
        }
        if packet.to().map(str::to_lowercase).as_deref() != Some(self.local_domain.as_str()) {
            return None;
        }
        packet.element().get_child("query", ns::DISCO_ITEMS)?;

        let items = self.table.disco_items().into_iter().map(|item| {
            Element::builder("item", ns::DISCO_ITEMS)
                .attr("jid", item.domain)
                .attr("name", item.name)
                .build()
        });

        let mut builder = Element::builder("iq", packet.ns())
            .attr("type", "result")
            .attr("from", self.local_domain.clone())
            .append(Element::builder("query", ns::DISCO_ITEMS).append_all(items).build());
        if let Some(id) = packet.id() {
            builder = builder.attr("id", id);
        }
        if let Some(from) = packet.from() {
            builder = builder.attr("to", from);
        }
        Some(Packet::new(builder.build()))
    }

    /// Reply `service-unavailable` to requests nobody can take.
    ///
    /// Other stanzas are dropped.
    fn bounce(&self, packet: &Packet) {
        let is_request = packet.name() == "iq" && matches!(packet.attr("type"), Some("get") | Some("set"));
        if !is_request {
            debug!(element = packet.name(), to = ?packet.to(), "Dropping undeliverable packet");
            return;
        }

        let condition = StanzaErrorCondition::ServiceUnavailable;
        let xml = generate_iq_error(
            packet.id().unwrap_or_default(),
            packet.from(),
            packet.to(),
            condition,
            condition.default_type(),
            None,
        );
        match Packet::parse(&xml, &packet.ns()) {
            Ok(reply) => self.send_back(reply),
            Err(e) => warn!(error = %e, "Failed to build error reply"),
        }
    }

    fn send_back(&self, reply: Packet) {
        if let Err(e) = self.protocol.deliver_outbound(&reply) {
            debug!(to = ?reply.to(), error = %e, "Reply is undeliverable");
        }
    }
}

impl std::fmt::Debug for PacketRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRouter")
            .field("local_domain", &self.local_domain)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComponentConfig;
    use crate::protocol::ProtocolHandler;
    use crate::reconnect::ReconnectScheduler;
    use crate::session::{Session, SessionRef};
    use crate::test_util::TestSession;
    use std::time::Duration;

    struct Fixture {
        protocol: Arc<ComponentProtocol>,
        router: PacketRouter,
    }

    fn fixture() -> Fixture {
        let (table, _rx) = InMemoryRoutingTable::new();
        let table = Arc::new(table);
        let (scheduler, _specs) = ReconnectScheduler::new(Duration::from_millis(10));
        let protocol = Arc::new(ComponentProtocol::new(table.clone(), Arc::new(scheduler)));
        protocol.apply_config(&ComponentConfig::default());
        let router = PacketRouter::new(Arc::clone(&protocol), table, "Example.com");
        Fixture { protocol, router }
    }

    fn packet(xml: &str) -> Packet {
        Packet::parse(xml, ns::COMPONENT_ACCEPT).unwrap()
    }

    #[test]
    fn test_routes_to_bound_component() {
        let f = fixture();
        let muc = TestSession::accept("muc");
        let session: SessionRef = muc.clone();
        f.protocol.authenticated("muc.example.com", &session);

        f.router
            .route(packet("<message to='room@muc.example.com' from='a@example.com'/>"));

        let written = muc.written();
        assert_eq!(written.len(), 1);
        assert!(written[0].contains("room@muc.example.com"));
    }

    #[test]
    fn test_unroutable_iq_bounces_to_sender() {
        let f = fixture();
        let muc = TestSession::accept("muc");
        let session: SessionRef = muc.clone();
        f.protocol.authenticated("muc.example.com", &session);

        f.router.route(packet(
            "<iq type='get' id='q1' to='nobody.example.org' from='muc.example.com'><query xmlns='jabber:iq:version'/></iq>",
        ));

        let written = muc.written();
        assert_eq!(written.len(), 1);
        assert!(written[0].contains("service-unavailable"));
        assert!(written[0].contains("q1"));
    }

    #[test]
    fn test_unroutable_message_is_dropped() {
        let f = fixture();
        let muc = TestSession::accept("muc");
        let session: SessionRef = muc.clone();
        f.protocol.authenticated("muc.example.com", &session);

        f.router
            .route(packet("<message to='x@nobody.example.org' from='muc.example.com'/>"));
        assert!(muc.written().is_empty());
    }

    #[test]
    fn test_local_disco_items_lists_components() {
        let f = fixture();
        let muc = TestSession::accept("muc");
        let session: SessionRef = muc.clone();
        f.protocol.authenticated("muc.example.com", &session);

        f.router.route(packet(
            "<iq type='get' id='d1' to='example.com' from='muc.example.com'><query xmlns='http://jabber.org/protocol/disco#items'/></iq>",
        ));

        let written = muc.written();
        assert_eq!(written.len(), 1);
        assert!(written[0].contains("jid=\"muc.example.com\"") || written[0].contains("jid='muc.example.com'"));
        assert!(written[0].contains("result"));
    }

    #[test]
    fn test_disconnected_component_gets_nothing() {
        let f = fixture();
        let muc = TestSession::accept("muc");
        let session: SessionRef = muc.clone();
        f.protocol.authenticated("muc.example.com", &session);
        session.stop();
        f.protocol.session_stopped(&session);

        f.router
            .route(packet("<message to='room@muc.example.com' from='a@example.com'/>"));
        assert!(muc.written().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_router_drains_channel() {
        let (table, rx) = InMemoryRoutingTable::new();
        let table = Arc::new(table);
        let (scheduler, _specs) = ReconnectScheduler::new(Duration::from_millis(10));
        let protocol = Arc::new(ComponentProtocol::new(table.clone(), Arc::new(scheduler)));

        let muc = TestSession::accept("muc");
        let session: SessionRef = muc.clone();
        protocol.authenticated("muc.example.com", &session);

        let shutdown = CancellationToken::new();
        let handle = PacketRouter::new(Arc::clone(&protocol), table.clone(), "example.com")
            .spawn(rx, 2, shutdown.clone());

        use crate::routing::RoutingFabric;
        for i in 0..5 {
            table
                .deliver(packet(&format!("<message to='r@muc.example.com' id='m{}'/>", i)))
                .unwrap();
        }

        for _ in 0..50 {
            if muc.written().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let written = muc.written();
        assert_eq!(written.len(), 5);
        for (i, xml) in written.iter().enumerate() {
            assert!(xml.contains(&format!("m{}", i)));
        }

        shutdown.cancel();
        handle.await.unwrap();
    }
}
