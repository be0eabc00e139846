//! Outbound connection scheduling.
//!
//! Every repository item with its own port becomes a [`ConnectionSpec`].
//! Specs are pushed through a channel to the transport, which dials (or
//! listens) accordingly. When an outbound session drops, the protocol core
//! schedules exactly one new attempt with the same spec after a delay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::repository::CompRepoItem;
use crate::session::ConnectionDirection;

/// Everything needed to open (or reopen) a component connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    /// Port to dial or listen on
    pub port: u16,
    /// Our side of the link (the component domain we serve)
    pub local_domain: String,
    /// Host to dial
    pub remote_host: String,
    /// Connection direction
    pub direction: ConnectionDirection,
    /// Repository item the connection was created for
    pub repo_item: CompRepoItem,
    /// Attempts allowed before giving up
    pub max_reconnects: u32,
    /// Attempts made so far
    pub attempt: u32,
}

impl ConnectionSpec {
    /// Build the connection spec for a repository item.
    pub fn from_item(item: &CompRepoItem, max_reconnects: u32) -> Self {
        Self {
            port: item.port,
            local_domain: item.domain.clone(),
            remote_host: item.remote_host().to_string(),
            direction: item.direction,
            repo_item: item.clone(),
            max_reconnects,
            attempt: 0,
        }
    }

    /// The connection spec for the following attempt, or `None` once the ceiling is hit.
    pub fn next_attempt(&self) -> Option<Self> {
        if self.attempt >= self.max_reconnects {
            return None;
        }
        let mut next = self.clone();
        next.attempt += 1;
        Some(next)
    }

    /// `host:port` to dial.
    pub fn address(&self) -> String {
        format!("{}:{}", self.remote_host, self.port)
    }
}

/// Delayed one-shot delivery of connection specs to the transport.
#[derive(Debug)]
pub struct ReconnectScheduler {
    delay: Duration,
    tx: mpsc::UnboundedSender<ConnectionSpec>,
    scheduled: AtomicU64,
}

impl ReconnectScheduler {
    /// Create a scheduler and the receiver the transport consumes.
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<ConnectionSpec>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                delay,
                tx,
                scheduled: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Hand a spec to the transport right away (initial bootstrap).
    pub fn schedule_now(&self, spec: ConnectionSpec) {
        self.dispatch(spec, Duration::ZERO);
    }

    /// Reopen a dropped connection after the configured delay.
    pub fn schedule(&self, spec: ConnectionSpec) {
        self.dispatch(spec, self.delay);
    }

    /// Schedule the next attempt after a failed dial.
    ///
    /// Returns `false` when the connection spec ran out of attempts.
    pub fn retry(&self, spec: &ConnectionSpec) -> bool {
        match spec.next_attempt() {
            Some(next) => {
                self.schedule(next);
                true
            }
            None => {
                warn!(
                    domain = %spec.local_domain,
                    attempts = spec.attempt,
                    "Giving up on component connection"
                );
                false
            }
        }
    }

    /// Total number of specs dispatched so far.
    pub fn scheduled_count(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    fn dispatch(&self, spec: ConnectionSpec, delay: Duration) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_reconnect_scheduled(spec.direction.as_str());

        debug!(
            domain = %spec.local_domain,
            address = %spec.address(),
            direction = %spec.direction,
            attempt = spec.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling component connection"
        );

        if delay.is_zero() {
            if self.tx.send(spec).is_err() {
                warn!("Connection spec receiver dropped");
            }
            return;
        }

        let tx = self.tx.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(spec).is_err() {
                        warn!("Connection spec receiver dropped");
                    }
                });
            }
            Err(_) => warn!(
                domain = %spec.local_domain,
                "No async runtime available, reconnect dropped"
            ),
        }
    }
}
