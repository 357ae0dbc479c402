//! Prometheus metrics for the relay
//!
//! Features:
//! - Connection metrics (accepted, active workers, accept errors)
//! - Throughput metrics (plain bytes in, compressed bytes forwarded)
//! - Outcome metrics (forwarded / failed per phase and error kind)

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref CONNECTIONS_ACCEPTED: IntCounter = IntCounter::new(
        "bzrelay_connections_accepted_total",
        "Total inbound connections accepted"
    ).unwrap();

    pub static ref ACCEPT_ERRORS: IntCounter = IntCounter::new(
        "bzrelay_accept_errors_total",
        "Total failed accept calls"
    ).unwrap();

    pub static ref ACTIVE_WORKERS: IntGauge = IntGauge::new(
        "bzrelay_active_workers",
        "Workers currently tracked by the registry"
    ).unwrap();

    pub static ref BYTES_IN: IntCounter = IntCounter::new(
        "bzrelay_bytes_in_total",
        "Plain bytes received from inbound peers"
    ).unwrap();

    pub static ref BYTES_FORWARDED: IntCounter = IntCounter::new(
        "bzrelay_bytes_forwarded_total",
        "Compressed bytes delivered to storage endpoints"
    ).unwrap();

    pub static ref WORKERS_FORWARDED: IntCounter = IntCounter::new(
        "bzrelay_workers_forwarded_total",
        "Workers that delivered their stream"
    ).unwrap();

    pub static ref WORKERS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new("bzrelay_workers_failed_total", "Workers that terminated with an error"),
        &["phase", "kind"]
    ).unwrap();
}

/// Register all relay metrics. Safe to call more than once.
pub fn init_metrics() {
    METRICS_REGISTRY.register(Box::new(CONNECTIONS_ACCEPTED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(ACCEPT_ERRORS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(ACTIVE_WORKERS.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BYTES_IN.clone())).ok();
    METRICS_REGISTRY.register(Box::new(BYTES_FORWARDED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(WORKERS_FORWARDED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(WORKERS_FAILED.clone())).ok();

    info!("Metrics initialized");
}

pub fn record_forwarded(bytes_in: u64, bytes_out: u64) {
    WORKERS_FORWARDED.inc();
    BYTES_IN.inc_by(bytes_in);
    BYTES_FORWARDED.inc_by(bytes_out);
}

pub fn record_failed(phase: &str, kind: &str) {
    WORKERS_FAILED.with_label_values(&[phase, kind]).inc();
}

/// Export all metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics\n"))
}
