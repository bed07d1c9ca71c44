//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Ingestion
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("aperture_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref INGRESS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("aperture_ingress_total", "Inbound requests by ingress point and outcome"),
        &["ingress", "outcome"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_VERIFICATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("aperture_signature_verifications_total", "HTTP signature verification results"),
        &["result"]
    ).expect("metric can be created");

    // Processing
    pub static ref JOBS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("aperture_jobs_total", "Processed queue jobs by queue and outcome"),
        &["queue", "outcome"]
    ).expect("metric can be created");
    pub static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("aperture_queue_depth", "Jobs waiting in each queue, sampled at scrape time"),
        &["queue", "status"]
    ).expect("metric can be created");

    // Delivery
    pub static ref DELIVERY_ATTEMPTS: IntCounterVec = IntCounterVec::new(
        Opts::new("aperture_delivery_attempts_total", "Outbound delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("aperture_delivery_events_total", "Concluded delivery events by result"),
        &["result"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "aperture_delivery_duration_seconds",
            "Duration of a whole delivery event in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0])
    ).expect("metric can be created");

    // Cache
    pub static ref KEY_CACHE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("aperture_key_cache_total", "Public key cache lookups by result"),
        &["result"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("aperture_errors_total", "Total number of errors"),
        &["error_type", "endpoint"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once; collectors are registered on the first call.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(ACTIVITIES_RECEIVED.clone()))
            .expect("ACTIVITIES_RECEIVED can be registered");
        REGISTRY
            .register(Box::new(INGRESS_TOTAL.clone()))
            .expect("INGRESS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(SIGNATURE_VERIFICATIONS.clone()))
            .expect("SIGNATURE_VERIFICATIONS can be registered");
        REGISTRY
            .register(Box::new(JOBS_TOTAL.clone()))
            .expect("JOBS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(QUEUE_DEPTH.clone()))
            .expect("QUEUE_DEPTH can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_ATTEMPTS.clone()))
            .expect("DELIVERY_ATTEMPTS can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_EVENTS.clone()))
            .expect("DELIVERY_EVENTS can be registered");
        REGISTRY
            .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
            .expect("DELIVERY_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(KEY_CACHE_TOTAL.clone()))
            .expect("KEY_CACHE_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}
