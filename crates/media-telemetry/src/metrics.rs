//! Prometheus metrics for the media gate.
//!
//! All metrics follow the naming convention: `media_<area>_<metric>_<unit>`

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Exchanges by terminal outcome (completed, remote_error, timed_out, cancelled, failed)
    pub static ref EXCHANGES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("media_exchanges_total", "Correlated exchanges by check and outcome"),
        &["check", "outcome"]
    ).expect("metric creation failed");

    /// Time from send to reply
    pub static ref EXCHANGE_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "media_exchange_duration_seconds",
            "Time from request send to matched reply"
        ).buckets(exponential_buckets(0.001, 2.0, 14).expect("valid buckets"))
    ).expect("metric creation failed");

    /// Collectors currently registered
    pub static ref COLLECTORS_ACTIVE: IntGauge = IntGauge::new(
        "media_collectors_active",
        "Collectors currently awaiting a reply"
    ).expect("metric creation failed");

    /// Inbound packets no exchange was waiting for
    pub static ref UNSOLICITED_PACKETS: IntCounter = IntCounter::new(
        "media_unsolicited_packets_total",
        "Inbound packets that matched no pending exchange"
    ).expect("metric creation failed");
}

/// Register all metrics with [`REGISTRY`].
pub fn register_metrics() -> Result<(), TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(EXCHANGES_TOTAL.clone()),
        Box::new(EXCHANGE_DURATION.clone()),
        Box::new(COLLECTORS_ACTIVE.clone()),
        Box::new(UNSOLICITED_PACKETS.clone()),
    ];

    for metric in metrics {
        REGISTRY
            .register(metric)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    }
    Ok(())
}

/// Render the registry in the Prometheus text exposition format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
