use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Once;

use crate::error::{ArchiveError, Result};

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Pipeline Metrics
    // ============================================================================

    /// Records accepted into partition buffers
    pub static ref RECORDS_APPENDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("archivist_records_appended_total", "Total records appended to partition buffers"),
        &["topic"]
    ).expect("metric can be created");

    /// Sealed chunks by trigger
    pub static ref CHUNKS_SEALED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("archivist_chunks_sealed_total", "Total chunks sealed"),
        &["topic", "trigger"] // bytes, records, age, flush
    ).expect("metric can be created");

    /// Sealed bytes, before and after compression
    pub static ref SEALED_BYTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("archivist_sealed_bytes_total", "Total bytes sealed into chunks"),
        &["topic", "kind"] // compressed, uncompressed
    ).expect("metric can be created");

    /// Records left out of a chunk because they could not be rendered
    pub static ref RENDER_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("archivist_render_failures_total", "Total records that could not be rendered"),
        &["topic"]
    ).expect("metric can be created");

    /// Groups whose pointer update completed
    pub static ref GROUPS_PUBLISHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("archivist_groups_published_total", "Total chunk groups published"),
        &["topic", "partition"]
    ).expect("metric can be created");

    /// Last offset committed upstream
    pub static ref COMMITTED_OFFSET: IntGaugeVec = IntGaugeVec::new(
        Opts::new("archivist_committed_offset", "Last offset committed upstream"),
        &["topic", "partition"]
    ).expect("metric can be created");

    /// Partitions that hit a fatal error
    pub static ref PARTITION_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("archivist_partition_failures_total", "Total partitions moved to the failed state"),
        &["topic", "reason"]
    ).expect("metric can be created");

    // ============================================================================
    // Object Store Metrics
    // ============================================================================

    /// Object store calls by operation
    pub static ref STORE_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("archivist_store_requests_total", "Total object store requests"),
        &["operation"] // put_payload, put_index, put_pointer, get, get_range, list
    ).expect("metric can be created");

    /// Failed object store calls by operation
    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("archivist_store_errors_total", "Total object store errors"),
        &["operation", "error_type"] // timeout, transient, permanent
    ).expect("metric can be created");

    /// Object store call latency
    pub static ref STORE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("archivist_store_latency_seconds", "Object store request latency in seconds")
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["operation"]
    ).expect("metric can be created");
}

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(RECORDS_APPENDED_TOTAL.clone()))
            .expect("records_appended_total can be registered");
        REGISTRY
            .register(Box::new(CHUNKS_SEALED_TOTAL.clone()))
            .expect("chunks_sealed_total can be registered");
        REGISTRY
            .register(Box::new(SEALED_BYTES_TOTAL.clone()))
            .expect("sealed_bytes_total can be registered");
        REGISTRY
            .register(Box::new(RENDER_FAILURES_TOTAL.clone()))
            .expect("render_failures_total can be registered");
        REGISTRY
            .register(Box::new(GROUPS_PUBLISHED_TOTAL.clone()))
            .expect("groups_published_total can be registered");
        REGISTRY
            .register(Box::new(COMMITTED_OFFSET.clone()))
            .expect("committed_offset can be registered");
        REGISTRY
            .register(Box::new(PARTITION_FAILURES_TOTAL.clone()))
            .expect("partition_failures_total can be registered");
        REGISTRY
            .register(Box::new(STORE_REQUESTS_TOTAL.clone()))
            .expect("store_requests_total can be registered");
        REGISTRY
            .register(Box::new(STORE_ERRORS_TOTAL.clone()))
            .expect("store_errors_total can be registered");
        REGISTRY
            .register(Box::new(STORE_LATENCY.clone()))
            .expect("store_latency can be registered");
    });
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ArchiveError::SerializationError(format!("metrics encoding failed: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| ArchiveError::SerializationError(format!("metrics are not UTF-8: {}", e)))
}
