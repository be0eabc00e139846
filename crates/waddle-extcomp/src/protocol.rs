//! Component protocol coordinator.
//!
//! [`ComponentProtocol`] ties the pieces together: it answers stream opens
//! through the [`StreamOpenHandlers`] table, runs inbound packets through the
//! [`ProcessorPipeline`], keeps the [`ComponentConnectionRegistry`] and the
//! routing table in step as sessions authenticate and drop, and schedules
//! reconnects for outbound sessions.
//!
//! ## Architecture
//!
//! ```text
//!  transport ──opened/started/stopped──► ComponentProtocol ──deliver──► RoutingFabric
//!      ▲                                   │        │
//!      │ write_packet / write_raw          │        └─bind/unbind─► ComponentConnectionRegistry
//!      └───────────────────────────────────┘                              │
//!                                         RoutingTableManager ◄──orphaned──┘
//! ```
//!
//! Configuration is applied by building a fresh [`ProtocolState`] and
//! swapping it in; packets in flight finish with the state they started with.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use minidom::Element;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ComponentConfig;
use crate::handlers::{StreamOpenHandler, StreamOpenHandlers, StreamReply};
use crate::packet::Packet;
use crate::parser::StreamHeader;
use crate::processors::{ids, ExtProcessor, ProcessorPipeline};
use crate::reconnect::{ConnectionSpec, ReconnectScheduler};
use crate::registry::{ComponentConnectionRegistry, UnbindOutcome};
use crate::repository::{create_repository, CompRepoItem, ComponentRepository};
use crate::routing::{RoutingFabric, RoutingTableManager};
use crate::session::{write_packets, ConnectionDirection, SessionRef};
use crate::ExtCompError;

/// Idle time after which the transport may drop a component session.
pub const MAX_INACTIVE_TIME: Duration = Duration::from_secs(1000 * 24 * 60 * 60);

/// Callbacks available to processors and stream open handlers.
pub trait ProtocolHandler: Send + Sync {
    /// Repository entry for a component domain.
    fn repo_item(&self, domain: &str) -> Option<CompRepoItem>;

    /// The session proved its identity as `hostname`.
    fn authenticated(&self, hostname: &str, session: &SessionRef);

    /// Register the session for an additional domain.
    fn bind_hostname(&self, hostname: &str, session: &SessionRef);

    /// Release one domain of the session.
    fn unbind_hostname(&self, hostname: &str, session: &SessionRef);

    /// Features to advertise on a feature-negotiated stream.
    fn stream_features(&self, session: &SessionRef) -> Vec<Element>;

    /// Processor lookup by id.
    fn processor(&self, id: &str) -> Option<Arc<dyn ExtProcessor>>;

    /// Handler lookup by stream namespace.
    fn stream_open_handler(&self, xmlns: Option<&str>) -> StreamOpenHandler;

    /// Send a fresh stream header on an outbound session (after TLS or SASL).
    fn restart_stream(&self, session: &SessionRef);
}

/// Immutable settings derived from a [`ComponentConfig`].
pub struct ProtocolState {
    pub pipeline: ProcessorPipeline,
    pub routing: RoutingTableManager,
    pub repository: Option<Arc<dyn ComponentRepository>>,
    pub hostnames_to_bind: Vec<String>,
    pub pack_routed: bool,
    pub max_reconnects: u32,
}

impl ProtocolState {
    fn from_config(
        config: &ComponentConfig,
        pipeline: ProcessorPipeline,
        fabric: Arc<dyn RoutingFabric>,
    ) -> Self {
        let repository = match create_repository(&config.repository) {
            Ok(repository) => Some(repository),
            Err(e) => {
                error!(error = %e, "Component repository unavailable, components cannot authenticate");
                None
            }
        };

        let hostnames_to_bind = match config.hostnames_to_bind() {
            Ok(hostnames) => hostnames,
            Err(e) => {
                error!(error = %e, "Extra hostname binding disabled");
                Vec::new()
            }
        };

        Self {
            pipeline,
            routing: RoutingTableManager::new(fabric, config.service_disco, &config.identity_type),
            repository,
            hostnames_to_bind,
            pack_routed: config.pack_routed,
            max_reconnects: config.max_reconnects,
        }
    }
}

impl std::fmt::Debug for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolState")
            .field("pipeline", &self.pipeline)
            .field("routing", &self.routing)
            .field("repository", &self.repository.is_some())
            .field("hostnames_to_bind", &self.hostnames_to_bind)
            .field("pack_routed", &self.pack_routed)
            .finish()
    }
}

/// Counts reported by [`ComponentProtocol::statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolStatistics {
    /// Domains with at least one component connection
    pub domains: usize,
    /// Component connections across all domains
    pub connections: usize,
    /// Outbound connection attempts scheduled so far
    pub connection_attempts: u64,
}

/// The external component protocol coordinator.
pub struct ComponentProtocol {
    registry: ComponentConnectionRegistry,
    handlers: StreamOpenHandlers,
    fabric: Arc<dyn RoutingFabric>,
    scheduler: Arc<ReconnectScheduler>,
    /// Processor list every configuration apply starts from.
    pipeline: ProcessorPipeline,
    state: RwLock<Arc<ProtocolState>>,
    /// Serializes registry transitions with their routing table updates.
    transitions: Mutex<()>,
    /// Repository items already handed to the transport, by (domain, port).
    started_items: Mutex<HashSet<(String, u16)>>,
}

impl ComponentProtocol {
    /// Create a coordinator with default configuration and the standard
    /// processor pipeline.
    pub fn new(fabric: Arc<dyn RoutingFabric>, scheduler: Arc<ReconnectScheduler>) -> Self {
        Self::with_pipeline(fabric, scheduler, ProcessorPipeline::standard())
    }

    /// Create a coordinator dispatching through `pipeline`.
    pub fn with_pipeline(
        fabric: Arc<dyn RoutingFabric>,
        scheduler: Arc<ReconnectScheduler>,
        pipeline: ProcessorPipeline,
    ) -> Self {
        let state = ProtocolState::from_config(
            &ComponentConfig::default(),
            pipeline.clone(),
            Arc::clone(&fabric),
        );
        Self {
            registry: ComponentConnectionRegistry::new(),
            handlers: StreamOpenHandlers::new(),
            fabric,
            scheduler,
            pipeline,
            state: RwLock::new(Arc::new(state)),
            transitions: Mutex::new(()),
            started_items: Mutex::new(HashSet::new()),
        }
    }

    /// Apply configuration: rebuild the pipeline and routing settings, then
    /// hand every repository item with its own port to the transport.
    #[instrument(skip(self, config))]
    pub fn apply_config(&self, config: &ComponentConfig) {
        let state = Arc::new(ProtocolState::from_config(
            config,
            self.pipeline.clone(),
            Arc::clone(&self.fabric),
        ));

        info!(
            pipeline = ?state.pipeline,
            repository = state.repository.is_some(),
            bind_hostnames = ?state.hostnames_to_bind,
            pack_routed = state.pack_routed,
            service_disco = config.service_disco,
            "Applying component protocol configuration"
        );

        *self
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::clone(&state);

        let Some(repository) = &state.repository else {
            return;
        };

        let mut started = self.lock(&self.started_items);
        for item in repository.items().into_iter().filter(CompRepoItem::has_port) {
            if !started.insert((item.domain.to_lowercase(), item.port)) {
                continue;
            }
            self.scheduler
                .schedule_now(ConnectionSpec::from_item(&item, state.max_reconnects));
        }
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current protocol state.
    pub fn state(&self) -> Arc<ProtocolState> {
        Arc::clone(
            &self
                .state
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    pub fn registry(&self) -> &ComponentConnectionRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<ReconnectScheduler> {
        &self.scheduler
    }

    /// A peer opened (or restarted) its stream.
    ///
    /// The reply is written to the session here; when it carries a fatal
    /// stream error the session is stopped after the write.
    #[instrument(skip(self, session, header), fields(session_id = %session.unique_id(), xmlns = ?header.xmlns))]
    pub fn stream_opened(&self, session: &SessionRef, header: &StreamHeader) -> Option<StreamReply> {
        let handler = self.handlers.resolve(header.xmlns.as_deref());
        debug!(handler = ?handler, to = ?header.to, "Stream opened");

        let reply = handler.stream_opened(session, header, self);
        if let Some(reply) = &reply {
            if let Err(e) = session.write_raw(&reply.data) {
                warn!(error = %e, "Failed to write stream open reply");
            }
            if reply.close {
                session.stop();
            }
        }
        reply
    }

    /// An outbound session finished connecting.
    #[instrument(skip(self, session), fields(session_id = %session.unique_id()))]
    pub fn session_started(&self, session: &SessionRef) {
        let spec = session.data().read(|state| state.connection_spec.clone());
        match &spec {
            Some(spec) => session.data().update(|state| {
                state.repo_item = Some(spec.repo_item.clone());
                state.hostname = Some(spec.local_domain.to_lowercase());
            }),
            None if session.direction() == ConnectionDirection::Connect => {
                warn!("Outbound session without connection spec");
            }
            None => {}
        }

        let xmlns = spec.as_ref().and_then(|s| s.repo_item.xmlns.clone());
        let handler = self.handlers.resolve(xmlns.as_deref());
        if let Some(header) = handler.session_started(session, self) {
            if let Err(e) = session.write_raw(&header) {
                warn!(error = %e, "Failed to write stream header");
            }
        }

        for processor in self.state().pipeline.iter() {
            if let Some(packet) = processor.on_session_started(session) {
                if let Err(e) = session.write_packet(&packet) {
                    warn!(processor = processor.id(), error = %e, "Failed to write session start packet");
                }
            }
        }

        info!(direction = %session.direction(), "Component session started");
    }

    /// Drain and process every packet queued on the session.
    ///
    /// Returns the number of packets processed.
    pub fn process_socket_data(&self, session: &SessionRef) -> usize {
        let mut count = 0;
        while let Some(packet) = session.poll_packet() {
            self.process_packet(session, packet);
            count += 1;
        }
        count
    }

    /// Run one packet through the pipeline; deliver it if nobody claimed it.
    pub fn process_packet(&self, session: &SessionRef, packet: Packet) {
        let state = self.state();
        let mut results = VecDeque::new();
        let mut processed = false;

        for processor in state.pipeline.iter() {
            processed |= processor.process(&packet, session, self, &mut results);
            write_packets(session, &mut results);
        }

        crate::metrics::record_packet(processed);
        if processed {
            return;
        }

        let packet = if packet.is_routed() {
            packet.unpack_routed()
        } else {
            packet
        };

        if let Err(e) = self.fabric.deliver(packet) {
            warn!(session_id = %session.unique_id(), error = %e, "Failed to deliver packet");
        }
    }

    /// The transport closed the session.
    ///
    /// Releases every domain the session served, retracting routing for
    /// domains left without a live connection, and reschedules outbound
    /// sessions. Runs at most once per session.
    #[instrument(skip(self, session), fields(session_id = %session.unique_id()))]
    pub fn session_stopped(&self, session: &SessionRef) {
        if !session.data().mark_stopped() {
            debug!("Session teardown already ran");
            return;
        }

        let state = session.data().snapshot();
        if state.bound_domains.is_empty() {
            match &state.hostname {
                Some(hostname) => debug!(hostname = %hostname, "Session stopped before binding"),
                None => debug!("Session stopped before sending a stream open"),
            }
        }

        for domain in &state.bound_domains {
            self.release(domain, session);
        }

        if session.direction() == ConnectionDirection::Connect {
            match state.connection_spec {
                Some(spec) => {
                    info!(domain = %spec.local_domain, "Scheduling component reconnect");
                    self.scheduler.schedule(ConnectionSpec { attempt: 0, ..spec });
                }
                None => warn!("Outbound session stopped without connection spec"),
            }
        }

        info!(domains = state.bound_domains.len(), "Component session stopped");
    }

    fn release(&self, domain: &str, session: &SessionRef) {
        let state = self.state();
        let _transition = self.lock(&self.transitions);
        if self.registry.unbind(domain, session) == UnbindOutcome::Orphaned {
            state.routing.unbind_domain(domain);
        }
        self.record_registry_size();
    }

    fn record_registry_size(&self) {
        let stats = self.registry.statistics();
        crate::metrics::record_registry_size(stats.domains, stats.connections);
    }

    /// First connected session serving `domain`.
    pub fn select_outbound_session(&self, domain: &str) -> Option<SessionRef> {
        self.registry.select_outbound_session(domain)
    }

    /// Session that should receive `packet`, by its destination host.
    ///
    /// Subdomains of a bound domain go to the bound domain's component.
    pub fn session_for_packet(&self, packet: &Packet) -> Option<SessionRef> {
        let host = packet.elem_to_host()?;
        let mut candidate = host.as_str();
        loop {
            if let Some(session) = self.registry.select_outbound_session(candidate) {
                return Some(session);
            }
            match candidate.split_once('.') {
                Some((_, parent)) if parent.contains('.') => candidate = parent,
                _ => return None,
            }
        }
    }

    /// Write a packet from the fabric to the component serving its
    /// destination.
    pub fn deliver_outbound(&self, packet: &Packet) -> Result<(), ExtCompError> {
        let Some(session) = self.session_for_packet(packet) else {
            debug!(to = ?packet.elem_to(), "No component connection for packet");
            return Err(ExtCompError::routing(format!(
                "No component connection for {}",
                packet.elem_to_host().unwrap_or_default()
            )));
        };

        if self.state().pack_routed && !packet.is_routed() {
            let from = packet.from().unwrap_or_default().to_string();
            let to = packet.elem_to().unwrap_or_default().to_string();
            session.write_packet(&packet.pack_routed(&from, &to))
        } else {
            session.write_packet(packet)
        }
    }

    /// Distribution hash: packets for one destination hash alike.
    pub fn packet_hash(&self, packet: &Packet) -> u64 {
        let mut hasher = DefaultHasher::new();
        packet
            .elem_to()
            .or_else(|| packet.to())
            .unwrap_or_default()
            .to_lowercase()
            .hash(&mut hasher);
        hasher.finish()
    }

    /// Worker count for packet processing.
    pub fn processing_threads(&self) -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn max_inactive_time(&self) -> Duration {
        MAX_INACTIVE_TIME
    }

    pub fn statistics(&self) -> ProtocolStatistics {
        let registry = self.registry.statistics();
        ProtocolStatistics {
            domains: registry.domains,
            connections: registry.connections,
            connection_attempts: self.scheduler.scheduled_count(),
        }
    }
}

impl ProtocolHandler for ComponentProtocol {
    fn repo_item(&self, domain: &str) -> Option<CompRepoItem> {
        self.state().repository.as_ref()?.item(domain)
    }

    #[instrument(skip(self, session), fields(session_id = %session.unique_id()))]
    fn authenticated(&self, hostname: &str, session: &SessionRef) {
        let hostname = hostname.to_lowercase();
        session.data().update(|state| {
            state.authenticated = true;
            state.hostname.get_or_insert_with(|| hostname.clone());
        });

        self.bind_hostname(&hostname, session);

        let state = self.state();
        if state.hostnames_to_bind.is_empty() {
            return;
        }

        session
            .data()
            .update(|s| s.bind_hostnames = state.hostnames_to_bind.clone());

        if let Some(bind) = state.pipeline.get(ids::BIND) {
            let mut results = VecDeque::new();
            bind.start_processing(None, session, self, &mut results);
            write_packets(session, &mut results);
        }
    }

    #[instrument(skip(self, session), fields(session_id = %session.unique_id()))]
    fn bind_hostname(&self, hostname: &str, session: &SessionRef) {
        let state = self.state();
        let _transition = self.lock(&self.transitions);
        if self.registry.bind(hostname, session) {
            state.routing.bind_domain(hostname);
            info!("Component bound to domain");
        }
        self.record_registry_size();
    }

    #[instrument(skip(self, session), fields(session_id = %session.unique_id()))]
    fn unbind_hostname(&self, hostname: &str, session: &SessionRef) {
        self.release(hostname, session);
    }

    fn stream_features(&self, session: &SessionRef) -> Vec<Element> {
        self.state().pipeline.stream_features(session, self)
    }

    fn processor(&self, id: &str) -> Option<Arc<dyn ExtProcessor>> {
        self.state().pipeline.get(id)
    }

    fn stream_open_handler(&self, xmlns: Option<&str>) -> StreamOpenHandler {
        self.handlers.resolve(xmlns)
    }

    fn restart_stream(&self, session: &SessionRef) {
        let handler = self.handlers.resolve(session.data().xmlns().as_deref());
        if let Some(header) = handler.session_started(session, self) {
            if let Err(e) = session.write_raw(&header) {
                warn!(session_id = %session.unique_id(), error = %e, "Failed to restart stream");
            }
        }
    }
}

impl std::fmt::Debug for ComponentProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentProtocol")
            .field("registry", &self.registry)
            .field("state", &self.state())
            .finish()
    }
}
