//! Prometheus instrumentation.
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`start_metrics_server`] installs the exporter.

use metrics::{counter, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use murmur_core::{Dispatched, SignalOutcome};
use std::net::{Ipv4Addr, SocketAddr};
use tracing::info;

pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "murmur_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "murmur_connections_active";
    pub const CONNECTIONS_REJECTED: &str = "murmur_connections_rejected_total";
    pub const FRAMES_TOTAL: &str = "murmur_frames_total";
    pub const FRAMES_BYTES: &str = "murmur_frames_bytes";
    pub const FRAMES_DROPPED: &str = "murmur_frames_dropped_total";
    pub const MESSAGES_TOTAL: &str = "murmur_messages_total";
    pub const OFFLINE_FLUSHED: &str = "murmur_offline_flushed_total";
    pub const SIGNALS_TOTAL: &str = "murmur_signals_total";
    pub const CALL_TRANSITIONS: &str = "murmur_call_transitions_total";
    pub const DISPATCH_SECONDS: &str = "murmur_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "murmur_errors_total";
}

const COUNTERS: [(&str, &str); 10] = [
    (names::CONNECTIONS_TOTAL, "Sockets accepted since start"),
    (names::CONNECTIONS_REJECTED, "Upgrades refused before a session opened"),
    (names::FRAMES_TOTAL, "Frames by type and direction"),
    (names::FRAMES_BYTES, "Frame payload bytes by direction"),
    (names::FRAMES_DROPPED, "Inbound frames dropped unhandled"),
    (names::MESSAGES_TOTAL, "Chat deliveries by path"),
    (names::OFFLINE_FLUSHED, "Offline items written on connect"),
    (names::SIGNALS_TOTAL, "Signaling actions by outcome"),
    (names::CALL_TRANSITIONS, "Call status changes by resulting status"),
    (names::ERRORS_TOTAL, "Errors by kind"),
];

/// Register descriptions for every murmur metric.
pub fn init_metrics() {
    for (name, help) in COUNTERS {
        metrics::describe_counter!(name, help);
    }
    metrics::describe_gauge!(names::CONNECTIONS_ACTIVE, "Sockets currently open");
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        Unit::Seconds,
        "Time to handle one inbound frame"
    );

    info!(counters = COUNTERS.len(), "Metrics described");
}

/// Install the Prometheus exporter on `port`, all interfaces.
///
/// # Errors
///
/// Returns an error if the listener cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Record a refused upgrade.
pub fn record_rejected(reason: &'static str) {
    counter!(names::CONNECTIONS_REJECTED, "reason" => reason).increment(1);
}

/// Record a frame crossing the socket.
pub fn record_frame(kind: &'static str, bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "type" => kind, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

pub fn record_dropped(reason: &'static str) {
    counter!(names::FRAMES_DROPPED, "reason" => reason).increment(1);
}

/// Record inbound handling latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Record offline items written on connect.
pub fn record_flushed(count: usize) {
    if count > 0 {
        counter!(names::OFFLINE_FLUSHED).increment(count as u64);
    }
}

/// Record what a dispatched frame did.
pub fn record_dispatched(dispatched: &Dispatched) {
    match dispatched {
        Dispatched::Message(outcome) => {
            let live = if outcome.message.is_group { "group" } else { "live" };
            if outcome.delivered > 0 {
                counter!(names::MESSAGES_TOTAL, "path" => live).increment(outcome.delivered as u64);
            }
            if outcome.queued > 0 {
                counter!(names::MESSAGES_TOTAL, "path" => "offline")
                    .increment(outcome.queued as u64);
            }
        }
        Dispatched::Signal { action, outcome } => {
            counter!(
                names::SIGNALS_TOTAL,
                "action" => *action,
                "outcome" => signal_label(outcome)
            )
            .increment(1);
            if let Some(status) = outcome.status() {
                counter!(names::CALL_TRANSITIONS, "status" => status.as_str()).increment(1);
            }
        }
        Dispatched::Pong => {}
    }
}

fn signal_label(outcome: &SignalOutcome) -> &'static str {
    match outcome {
        SignalOutcome::Relayed { .. } => "relayed",
        SignalOutcome::Unreachable { .. } => "unreachable",
        SignalOutcome::Ignored { .. } => "ignored",
    }
}

pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => kind).increment(1);
}

/// Counts one open socket for as long as it lives.
pub struct ActiveConnection(());

impl ActiveConnection {
    #[must_use]
    pub fn open() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Self(())
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}
