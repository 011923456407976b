//! XMPP metrics for observability.
//!
//! Uses the global OpenTelemetry meter provider; exporter setup is up to
//! the host application.

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

static METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    METER.get_or_init(|| opentelemetry::global::meter("howl-xmpp"))
}

// ============================================================================
// Counters (Cumulative)
// ============================================================================

/// Counter for XMPP stanzas processed.
pub fn stanzas_processed() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.stanzas.processed")
        .with_description("Total XMPP stanzas processed")
        .with_unit("stanza")
        .build()
}

/// Counter for authentication attempts.
pub fn auth_attempts() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.auth.attempts")
        .with_description("Total authentication attempts")
        .with_unit("attempt")
        .build()
}

/// Counter for router outcomes.
pub fn route_outcomes() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.router.outcomes")
        .with_description("Stanzas routed, by outcome")
        .with_unit("stanza")
        .build()
}

/// Counter for stream management resumptions.
pub fn sm_resumptions() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.sm.resumptions")
        .with_description("XEP-0198 resumption attempts")
        .with_unit("resumption")
        .build()
}

/// Counter for S2S connection attempts.
pub fn s2s_connection_attempts() -> Counter<u64> {
    meter()
        .u64_counter("xmpp.s2s.connection.attempts")
        .with_description("Total S2S connection attempts")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Gauges (Current State)
// ============================================================================

/// Gauge for active XMPP connections.
pub fn connections_active() -> Gauge<i64> {
    meter()
        .i64_gauge("xmpp.connections.active")
        .with_description("Current number of active XMPP connections")
        .with_unit("connection")
        .build()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a stanza being processed.
pub fn record_stanza(stanza_type: &str, direction: &str) {
    stanzas_processed().add(
        1,
        &[
            KeyValue::new("type", stanza_type.to_string()),
            KeyValue::new("direction", direction.to_string()),
        ],
    );
}

/// Record an authentication attempt.
pub fn record_auth_attempt(mechanism: &str, success: bool) {
    auth_attempts().add(
        1,
        &[
            KeyValue::new("mechanism", mechanism.to_string()),
            KeyValue::new("result", if success { "success" } else { "failure" }),
        ],
    );
}

/// Record the outcome of one routing decision.
pub fn record_route(outcome: &'static str) {
    route_outcomes().add(1, &[KeyValue::new("outcome", outcome)]);
}

/// Record a resumption attempt.
pub fn record_sm_resumption(success: bool) {
    sm_resumptions().add(
        1,
        &[KeyValue::new("result", if success { "success" } else { "failure" })],
    );
}

/// Record an outgoing S2S dial.
pub fn record_s2s_connection_attempt(direct_tls: bool) {
    s2s_connection_attempts().add(1, &[KeyValue::new("direct_tls", direct_tls)]);
}

/// Record connection count change.
pub fn record_connection_count(count: i64, transport: &str) {
    connections_active().record(count, &[KeyValue::new("transport", transport.to_string())]);
}
