//! External component metrics.
//!
//! Uses the global OpenTelemetry meter provider, which the host binary
//! installs at startup. Without one, the calls below are no-ops.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("waddle-extcomp"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for packets received from components.
pub fn packets_processed() -> Counter<u64> {
    meter()
        .u64_counter("extcomp.packets.processed")
        .with_description("Packets received on component streams")
        .with_unit("packet")
        .build()
}

/// Counter for handshake and SASL authentication attempts.
pub fn auth_attempts() -> Counter<u64> {
    meter()
        .u64_counter("extcomp.auth.attempts")
        .with_description("Component authentication attempts")
        .with_unit("attempt")
        .build()
}

/// Counter for outbound connection attempts handed to the transport.
pub fn reconnects_scheduled() -> Counter<u64> {
    meter()
        .u64_counter("extcomp.reconnects.scheduled")
        .with_description("Component connection attempts scheduled")
        .with_unit("attempt")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for domains with at least one live component connection.
pub fn domains_bound() -> Gauge<i64> {
    meter()
        .i64_gauge("extcomp.domains.bound")
        .with_description("Domains currently served by components")
        .with_unit("domain")
        .build()
}

/// Gauge for registered component connections.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("extcomp.connections.active")
        .with_description("Component connections currently registered")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a processed packet and whether a pipeline step claimed it.
pub fn record_packet(claimed: bool) {
    packets_processed().add(
        1,
        &[KeyValue::new(
            "outcome",
            if claimed { "claimed" } else { "delivered" },
        )],
    );
}

/// Record an authentication attempt.
pub fn record_auth_attempt(mechanism: &str, success: bool) {
    auth_attempts().add(
        1,
        &[
            KeyValue::new("mechanism", mechanism.to_string()),
            KeyValue::new("success", success),
        ],
    );
}

/// Record a scheduled connection attempt.
pub fn record_reconnect_scheduled(direction: &str) {
    reconnects_scheduled().add(1, &[KeyValue::new("direction", direction.to_string())]);
}

/// Record the registry size after a bind or unbind.
pub fn record_registry_size(domains: usize, connections: usize) {
    domains_bound().record(domains as i64, &[]);
    connections_active().record(connections as i64, &[]);
}
