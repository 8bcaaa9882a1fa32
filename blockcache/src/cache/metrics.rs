//! Metrics for [super::BlockCache].

use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for [super::BlockCache].
#[derive(Default)]
pub struct Metrics {
    /// Sections served by a resident or in-flight block.
    pub hits: Counter,
    /// Sections that required a block to be fetched.
    pub misses: Counter,
    /// Sections delayed because every block was in flight.
    pub delayed: Counter,
    /// Blocks recycled while holding data.
    pub evictions: Counter,
    /// Backend reads that failed.
    pub failed_reads: Counter,
    /// Requests read without touching the cache.
    pub bypassed: Counter,
    /// Block reads currently in flight.
    pub in_flight: Gauge,
    /// Sections waiting in the delayed queue.
    pub queued: Gauge,
}

impl Metrics {
    /// Create and register metrics with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "hits",
            "Sections served by a resident or in-flight block",
            metrics.hits.clone(),
        );
        registry.register(
            "misses",
            "Sections that required a block to be fetched",
            metrics.misses.clone(),
        );
        registry.register(
            "delayed",
            "Sections delayed because every block was in flight",
            metrics.delayed.clone(),
        );
        registry.register(
            "evictions",
            "Blocks recycled while holding data",
            metrics.evictions.clone(),
        );
        registry.register(
            "failed_reads",
            "Backend reads that failed",
            metrics.failed_reads.clone(),
        );
        registry.register(
            "bypassed",
            "Requests read without touching the cache",
            metrics.bypassed.clone(),
        );
        registry.register(
            "in_flight",
            "Block reads currently in flight",
            metrics.in_flight.clone(),
        );
        registry.register(
            "queued",
            "Sections waiting in the delayed queue",
            metrics.queued.clone(),
        );
        metrics
    }
}
