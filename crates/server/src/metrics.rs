//! Prometheus metrics for the stowage engine.
//!
//! Exposes counters for request admission, scheduling sweeps, jobs, cluster lock
//! contention and group outcomes.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Labels only carry request kinds, sweep and lock names; never checksums, owners
//! or group ids. The endpoint should still be network-restricted to the scraper.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Request metrics
pub static REQUESTS_CREATED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_requests_created_total",
            "Total number of file request rows created",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static REQUESTS_SUCCEEDED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_requests_succeeded_total",
            "Total number of file requests that reached terminal success",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static REQUESTS_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_requests_failed_total",
            "Total number of file requests moved to ERROR",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static STALE_WRITE_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_stale_write_retries_total",
        "Total number of request updates retried after a version conflict",
    )
    .expect("metric creation failed")
});

// Sweep metrics
pub static SWEEPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("stowage_sweeps_total", "Total number of executed sweeps"),
        &["sweep"],
    )
    .expect("metric creation failed")
});

pub static SWEEP_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "stowage_sweep_duration_seconds",
            "Duration of executed sweeps",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["sweep"],
    )
    .expect("metric creation failed")
});

pub static LOCK_SKIPS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_lock_skips_total",
            "Total number of ticks skipped because another holder had the cluster lock",
        ),
        &["lock"],
    )
    .expect("metric creation failed")
});

// Job metrics
pub static JOBS_CREATED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("stowage_jobs_created_total", "Total number of jobs queued"),
        &["kind"],
    )
    .expect("metric creation failed")
});

pub static JOBS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "stowage_jobs_active",
        "Number of job tasks currently executing in this process",
    )
    .expect("metric creation failed")
});

pub static JOBS_CRASHED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_jobs_crashed_total",
        "Total number of jobs that terminated abnormally",
    )
    .expect("metric creation failed")
});

// Group metrics
pub static GROUP_EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "stowage_group_events_total",
            "Total number of group events published",
        ),
        &["kind", "state"],
    )
    .expect("metric creation failed")
});

pub static GROUPS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_groups_expired_total",
        "Total number of groups torn down after expiration",
    )
    .expect("metric creation failed")
});

// Cache metrics
pub static CACHE_FULL_WARNINGS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "stowage_cache_full_warnings_total",
        "Total number of cache saturation warnings",
    )
    .expect("metric creation failed")
});

// Session accounting
pub static SESSION_REQUESTS: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "stowage_session_requests",
            "Requests tracked by session accounting, per kind and counter",
        ),
        &["kind", "counter"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(REQUESTS_CREATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REQUESTS_SUCCEEDED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REQUESTS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(STALE_WRITE_RETRIES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SWEEPS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SWEEP_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(LOCK_SKIPS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_CREATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_ACTIVE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(JOBS_CRASHED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GROUP_EVENTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GROUPS_EXPIRED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CACHE_FULL_WARNINGS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSION_REQUESTS.clone()))
            .expect("metric registration failed");
    });
}

/// Handler for the /metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Count one group event.
pub fn record_group_event(kind: &str, state: &str) {
    GROUP_EVENTS.with_label_values(&[kind, state]).inc();
}
