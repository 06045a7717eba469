//! Metrics and tracing facade for Gridscope.
//!
//! The helpers here emit both metrics (via the `metrics` crate) and lightweight tracing events.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tracing::trace;

/// Count assets and edges accepted from one ingest batch.
pub fn record_batch_accepted(assets: u64, edges: u64) {
    counter!("gridscope.ingest.batches_total").increment(1);
    counter!("gridscope.ingest.assets_total").increment(assets);
    counter!("gridscope.ingest.edges_total").increment(edges);
    trace!(assets, edges, "ingest batch accepted");
}

/// Count batches discarded because a newer request epoch superseded them.
pub fn record_batch_stale() {
    counter!("gridscope.ingest.stale_batches_total").increment(1);
    trace!("stale ingest batch discarded");
}

/// Count entries rejected by capacity truncation.
pub fn record_capacity_truncated(rejected: u64) {
    if rejected == 0 {
        return;
    }
    counter!("gridscope.ingest.truncated_total").increment(rejected);
    trace!(rejected, "capacity truncation recorded");
}

/// Count malformed wire records filtered before insertion.
pub fn record_malformed_dropped(dropped: u64) {
    if dropped == 0 {
        return;
    }
    counter!("gridscope.ingest.malformed_total").increment(dropped);
    trace!(dropped, "malformed records dropped");
}

/// Count one cull pass and what it removed.
pub fn record_cull_pass(assets_removed: u64, edges_removed: u64) {
    counter!("gridscope.cull.passes_total").increment(1);
    counter!("gridscope.cull.assets_total").increment(assets_removed);
    counter!("gridscope.cull.edges_total").increment(edges_removed);
    trace!(assets_removed, edges_removed, "cull pass recorded");
}

/// Count region fetches that returned an error.
pub fn record_fetch_failure() {
    counter!("gridscope.fetch.failures_total").increment(1);
    trace!("region fetch failure recorded");
}

/// Record clustering recompute latency in milliseconds.
pub fn record_recompute_latency(latency: Duration) {
    let ms = latency.as_secs_f64() * 1_000.0;
    histogram!("gridscope.recompute.latency_ms").record(ms);
    trace!(latency_ms = ms, "recompute latency observed");
}

/// Record end-to-end viewport request latency in milliseconds.
pub fn record_request_latency(latency: Duration) {
    let ms = latency.as_secs_f64() * 1_000.0;
    histogram!("gridscope.request.latency_ms").record(ms);
    trace!(latency_ms = ms, "viewport request latency observed");
}

/// Snapshot current residency (best-effort gauges).
pub fn record_resident(assets: u64, edges: u64, clusters: u64) {
    gauge!("gridscope.resident.assets").set(assets as f64);
    gauge!("gridscope.resident.edges").set(edges as f64);
    gauge!("gridscope.resident.clusters").set(clusters as f64);
    trace!(assets, edges, clusters, "residency recorded");
}
