//! Metrics collection and exposition.
//!
//! # Metrics
//! - `render_proxy_connections_total` (counter): accepted client connections
//! - `render_proxy_active_connections` (gauge): connections being handled
//! - `render_proxy_protocol_errors_total` (counter): rejected frames
//! - `render_proxy_recordings_total` (counter): recordings by outcome
//! - `render_proxy_recorded_bytes_total` (counter): intercepted bytes by direction
//! - `render_proxy_recorded_chunks_dropped_total` (counter): chunks lost to a full session queue
//! - `render_proxy_recording_duration_seconds` (histogram)

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::recorder::session::Direction;

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection_opened() {
    metrics::counter!("render_proxy_connections_total").increment(1);
    metrics::gauge!("render_proxy_active_connections").increment(1.0);
}

pub fn record_connection_closed() {
    metrics::gauge!("render_proxy_active_connections").decrement(1.0);
}

pub fn record_protocol_error(kind: &'static str) {
    metrics::counter!("render_proxy_protocol_errors_total", "kind" => kind).increment(1);
}

/// A recording that ran to a seal.
pub fn record_recording(succeeded: bool, started: Instant) {
    let outcome = if succeeded { "success" } else { "child_failed" };
    metrics::counter!("render_proxy_recordings_total", "outcome" => outcome).increment(1);
    metrics::histogram!("render_proxy_recording_duration_seconds")
        .record(started.elapsed().as_secs_f64());
}

/// A recording aborted by a resource failure.
pub fn record_recording_failure() {
    metrics::counter!("render_proxy_recordings_total", "outcome" => "aborted").increment(1);
}

pub fn record_traffic(direction: Direction, bytes: usize) {
    metrics::counter!("render_proxy_recorded_bytes_total", "direction" => direction.as_str())
        .increment(bytes as u64);
}

pub fn record_dropped_chunk() {
    metrics::counter!("render_proxy_recorded_chunks_dropped_total").increment(1);
}
