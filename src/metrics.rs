//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keygate_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");
    pub static ref HTTP_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "keygate_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Signature Metrics
    pub static ref SIGNATURE_VERIFICATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keygate_signature_verifications_total", "Signature verification outcomes"),
        &["result"]
    ).expect("metric can be created");
    pub static ref KEY_RESOLUTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keygate_key_resolutions_total", "Key resolutions by lookup path"),
        &["path"]
    ).expect("metric can be created");
    pub static ref KEY_REFRESHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keygate_key_refreshes_total", "Stale key refresh attempts"),
        &["strategy", "result"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keygate_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "keygate_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");

    // Circuit Breaker Metrics
    pub static ref CIRCUIT_BREAKER_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keygate_circuit_breaker_events_total", "Circuit breaker state events"),
        &["event"]
    ).expect("metric can be created");
    pub static ref CIRCUIT_BREAKER_TRACKED: IntGauge = IntGauge::new(
        "keygate_circuit_breaker_tracked",
        "Number of breaker names currently tracked"
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref ACTOR_CACHE_SIZE: IntGauge = IntGauge::new(
        "keygate_actor_cache_size",
        "Current number of actors in the key cache"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("keygate_errors_total", "Total number of errors"),
        &["error_type", "endpoint"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Safe to call more than once; later calls leave the registry untouched.
pub fn init_metrics() {
    let collectors: Vec<(&str, Box<dyn prometheus::core::Collector>)> = vec![
        ("HTTP_REQUESTS_TOTAL", Box::new(HTTP_REQUESTS_TOTAL.clone())),
        (
            "HTTP_REQUEST_DURATION_SECONDS",
            Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()),
        ),
        (
            "SIGNATURE_VERIFICATIONS_TOTAL",
            Box::new(SIGNATURE_VERIFICATIONS_TOTAL.clone()),
        ),
        ("KEY_RESOLUTIONS_TOTAL", Box::new(KEY_RESOLUTIONS_TOTAL.clone())),
        ("KEY_REFRESHES_TOTAL", Box::new(KEY_REFRESHES_TOTAL.clone())),
        (
            "FEDERATION_REQUESTS_TOTAL",
            Box::new(FEDERATION_REQUESTS_TOTAL.clone()),
        ),
        (
            "FEDERATION_REQUEST_DURATION_SECONDS",
            Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()),
        ),
        (
            "CIRCUIT_BREAKER_EVENTS_TOTAL",
            Box::new(CIRCUIT_BREAKER_EVENTS_TOTAL.clone()),
        ),
        ("CIRCUIT_BREAKER_TRACKED", Box::new(CIRCUIT_BREAKER_TRACKED.clone())),
        ("ACTOR_CACHE_SIZE", Box::new(ACTOR_CACHE_SIZE.clone())),
        ("ERRORS_TOTAL", Box::new(ERRORS_TOTAL.clone())),
    ];

    for (name, collector) in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(error) => tracing::error!(metric = name, %error, "Failed to register metric"),
        }
    }

    tracing::info!("Metrics registry initialized");
}
