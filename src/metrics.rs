//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Once;

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // XRPC Metrics
    pub static ref XRPC_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("community_feed_xrpc_requests_total", "Total number of remote procedure calls"),
        &["method", "status"]
    ).expect("metric can be created");
    pub static ref XRPC_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "community_feed_xrpc_request_duration_seconds",
            "Remote procedure call duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["method"]
    ).expect("metric can be created");

    // Query Cache Metrics
    pub static ref QUERY_CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("community_feed_query_cache_hits_total", "Total number of fresh cache reads"),
        &["namespace"]
    ).expect("metric can be created");
    pub static ref QUERY_CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("community_feed_query_cache_misses_total", "Total number of reads that required a fetch"),
        &["namespace"]
    ).expect("metric can be created");
    pub static ref QUERY_CACHE_DEDUPLICATED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("community_feed_query_cache_deduplicated_total", "Total number of fetches joined to an in-flight request"),
        &["namespace"]
    ).expect("metric can be created");
    pub static ref QUERY_CACHE_DISCARDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("community_feed_query_cache_discarded_total", "Total number of late results dropped after cancellation"),
        &["namespace"]
    ).expect("metric can be created");
    pub static ref QUERY_CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("community_feed_query_cache_size", "Current number of cached queries"),
        &["namespace"]
    ).expect("metric can be created");

    // Session Metrics
    pub static ref LOGIN_OUTCOMES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("community_feed_login_outcomes_total", "Total number of OAuth callback outcomes"),
        &["outcome"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("community_feed_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

static INIT: Once = Once::new();

/// Initialize metrics registry.
///
/// Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(XRPC_REQUESTS_TOTAL.clone()))
            .expect("XRPC_REQUESTS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(XRPC_REQUEST_DURATION_SECONDS.clone()))
            .expect("XRPC_REQUEST_DURATION_SECONDS can be registered");
        REGISTRY
            .register(Box::new(QUERY_CACHE_HITS_TOTAL.clone()))
            .expect("QUERY_CACHE_HITS_TOTAL can be registered");
        REGISTRY
            .register(Box::new(QUERY_CACHE_MISSES_TOTAL.clone()))
            .expect("QUERY_CACHE_MISSES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(QUERY_CACHE_DEDUPLICATED_TOTAL.clone()))
            .expect("QUERY_CACHE_DEDUPLICATED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(QUERY_CACHE_DISCARDED_TOTAL.clone()))
            .expect("QUERY_CACHE_DISCARDED_TOTAL can be registered");
        REGISTRY
            .register(Box::new(QUERY_CACHE_SIZE.clone()))
            .expect("QUERY_CACHE_SIZE can be registered");
        REGISTRY
            .register(Box::new(LOGIN_OUTCOMES_TOTAL.clone()))
            .expect("LOGIN_OUTCOMES_TOTAL can be registered");
        REGISTRY
            .register(Box::new(ERRORS_TOTAL.clone()))
            .expect("ERRORS_TOTAL can be registered");

        tracing::info!("Metrics registry initialized");
    });
}

/// Render the registry in the text exposition format
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(error) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(%error, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
