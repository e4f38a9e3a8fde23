//! Prometheus metrics for the depot server.
//!
//! Exposes counters for chunk ingest, assembly and garbage collection.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! It exposes aggregate usage only (no upload ids or file names), but should
//! still be network-restricted to the scraper at the infrastructure level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload session metrics
pub static UPLOAD_SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_upload_sessions_created_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_upload_sessions_completed_total",
        "Total number of upload sessions assembled successfully",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_upload_sessions_failed_total",
        "Total number of upload sessions whose assembly failed",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_upload_sessions_expired_total",
        "Total number of upload sessions that expired",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_RECOVERED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_upload_sessions_recovered_total",
        "Total number of upload sessions loaded from storage at startup",
    )
    .expect("metric creation failed")
});

// Chunk metrics
pub static CHUNKS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_chunks_received_total",
        "Total number of chunks accepted",
    )
    .expect("metric creation failed")
});

pub static CHUNK_DUPLICATES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_chunk_duplicates_total",
        "Total number of accepted chunks that replaced an earlier copy of the same index",
    )
    .expect("metric creation failed")
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_bytes_received_total",
        "Total chunk bytes accepted",
    )
    .expect("metric creation failed")
});

// Timing metrics
pub static CHUNK_UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "depot_chunk_upload_duration_seconds",
            "Time taken to persist and record a single chunk",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .expect("metric creation failed")
});

pub static ASSEMBLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "depot_assembly_duration_seconds",
            "Time taken to merge chunks into the final artifact",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

// Error metrics
pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "depot_upload_errors_total",
            "Total upload errors by error type",
        ),
        &["error_type"],
    )
    .expect("metric creation failed")
});

// Current state gauges
pub static ACTIVE_UPLOAD_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "depot_active_upload_sessions",
        "Current number of open upload sessions",
    )
    .expect("metric creation failed")
});

// GC metrics
pub static GC_SESSIONS_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_gc_sessions_reclaimed_total",
        "Total number of expired or failed sessions deleted by the sweep",
    )
    .expect("metric creation failed")
});

pub static GC_BYTES_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_gc_bytes_reclaimed_total",
        "Total chunk bytes reclaimed",
    )
    .expect("metric creation failed")
});

pub static GC_DELETE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_gc_delete_failures_total",
        "Total number of storage deletions that failed and were left for the next sweep",
    )
    .expect("metric creation failed")
});

pub static GC_SWEEP_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("depot_gc_sweep_duration_seconds", "GC sweep duration")
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so integration tests can build many routers in one process.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOAD_SESSIONS_CREATED.clone()),
            Box::new(UPLOAD_SESSIONS_COMPLETED.clone()),
            Box::new(UPLOAD_SESSIONS_FAILED.clone()),
            Box::new(UPLOAD_SESSIONS_EXPIRED.clone()),
            Box::new(UPLOAD_SESSIONS_RECOVERED.clone()),
            Box::new(CHUNKS_RECEIVED.clone()),
            Box::new(CHUNK_DUPLICATES.clone()),
            Box::new(BYTES_RECEIVED.clone()),
            Box::new(CHUNK_UPLOAD_DURATION.clone()),
            Box::new(ASSEMBLY_DURATION.clone()),
            Box::new(UPLOAD_ERRORS.clone()),
            Box::new(ACTIVE_UPLOAD_SESSIONS.clone()),
            Box::new(GC_SESSIONS_RECLAIMED.clone()),
            Box::new(GC_BYTES_RECLAIMED.clone()),
            Box::new(GC_DELETE_FAILURES.clone()),
            Box::new(GC_SWEEP_DURATION.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
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

/// Helper to record upload errors by type.
pub fn record_upload_error(error_type: &str) {
    UPLOAD_ERRORS.with_label_values(&[error_type]).inc();
}
