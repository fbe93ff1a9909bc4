/*!
Statistics of the relay engine.

Shared between the pipeline, the transport codec and the bridge; every
counter is updated with relaxed atomics so the hot path never takes a
lock. A [`StatsSnapshot`] is a point-in-time copy, individual fields
may be skewed relative to each other by in-flight updates.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::Instant;

use crate::time::clock_now;

/// Struct for various counters.
#[derive(Clone)]
pub struct Stats {
    /// Shared counters.
    pub counters: Arc<Counters>,
    started: Instant,
}

impl Stats {
    /// New `Stats` object.
    pub fn new() -> Self {
        Stats {
            counters: Arc::new(Counters::default()),
            started: clock_now(),
        }
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let processed = self.counters.processed();
        let elapsed = (clock_now() - self.started).as_secs_f64();
        let pool_hits = self.counters.pool_hits.load(Ordering::Relaxed);
        let pool_misses = self.counters.pool_misses.load(Ordering::Relaxed);
        let pipeline_served = self.counters.pipeline_served.load(Ordering::Relaxed);
        let direct_served = self.counters.direct_served.load(Ordering::Relaxed);
        let latency_us = self.counters.latency_us_total.load(Ordering::Relaxed);
        let latency_samples = self.counters.latency_samples.load(Ordering::Relaxed);

        StatsSnapshot {
            packets_processed: processed,
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
            replays_rejected: self.counters.replays_rejected.load(Ordering::Relaxed),
            integrity_rejected: self.counters.integrity_rejected.load(Ordering::Relaxed),
            throughput_pps: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
            avg_latency_ms: if latency_samples > 0 {
                latency_us as f64 / latency_samples as f64 / 1000.0
            } else {
                0.0
            },
            memory_pool_hit_rate: if pool_hits + pool_misses > 0 {
                pool_hits as f64 / (pool_hits + pool_misses) as f64
            } else {
                0.0
            },
            fallback_ratio: if pipeline_served + direct_served > 0 {
                direct_served as f64 / (pipeline_served + direct_served) as f64
            } else {
                0.0
            },
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new()
    }
}

/// Counters updated by the engine components.
#[derive(Default)]
pub struct Counters {
    /// Packets fully processed, relayed or delivered.
    packets_processed: AtomicU64,
    /// Packets dropped for any reason.
    packets_dropped: AtomicU64,
    /// Packets rejected by the replay guard.
    replays_rejected: AtomicU64,
    /// Packets rejected by a MAC or digest check.
    integrity_rejected: AtomicU64,
    /// Buffer pool reuses.
    pool_hits: AtomicU64,
    /// Buffer pool allocations.
    pool_misses: AtomicU64,
    /// Requests served by the batch pipeline.
    pipeline_served: AtomicU64,
    /// Requests served by the direct fallback.
    direct_served: AtomicU64,
    /// Sum of per-packet processing latency in microseconds.
    latency_us_total: AtomicU64,
    /// Number of latency samples in `latency_us_total`.
    latency_samples: AtomicU64,
    /// Frames received by the transport codec.
    incoming: AtomicU64,
    /// Frames sent by the transport codec.
    outgoing: AtomicU64,
}

impl Counters {
    /// Add 1 to the processed counter.
    pub fn increase_processed(&self) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Add 1 to the dropped counter.
    pub fn increase_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Add 1 to the replay-rejected counter. Counts as a drop as well.
    pub fn increase_replays_rejected(&self) {
        self.replays_rejected.fetch_add(1, Ordering::Relaxed);
        self.increase_dropped();
    }

    /// Add 1 to the integrity-rejected counter. Counts as a drop as well.
    pub fn increase_integrity_rejected(&self) {
        self.integrity_rejected.fetch_add(1, Ordering::Relaxed);
        self.increase_dropped();
    }

    /// Record a buffer pool reuse.
    pub fn increase_pool_hits(&self) {
        self.pool_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a buffer pool allocation.
    pub fn increase_pool_misses(&self) {
        self.pool_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request served by the batch pipeline.
    pub fn increase_pipeline_served(&self) {
        self.pipeline_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request served by the direct fallback.
    pub fn increase_direct_served(&self) {
        self.direct_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one per-packet processing latency sample.
    pub fn record_latency_us(&self, latency_us: u64) {
        self.latency_us_total.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Add 1 to the incoming frame counter.
    pub fn increase_incoming(&self) {
        self.incoming.fetch_add(1, Ordering::Relaxed);
    }

    /// Add 1 to the outgoing frame counter.
    pub fn increase_outgoing(&self) {
        self.outgoing.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the incoming frame counter.
    pub fn incoming(&self) -> u64 {
        self.incoming.load(Ordering::Relaxed)
    }

    /// Get the outgoing frame counter.
    pub fn outgoing(&self) -> u64 {
        self.outgoing.load(Ordering::Relaxed)
    }

    /// Get the processed counter.
    pub fn processed(&self) -> u64 {
        self.packets_processed.load(Ordering::Relaxed)
    }

    /// Get the dropped counter.
    pub fn dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }

    /// Get the replay-rejected counter.
    pub fn replays_rejected(&self) -> u64 {
        self.replays_rejected.load(Ordering::Relaxed)
    }

    /// Get the integrity-rejected counter.
    pub fn integrity_rejected(&self) -> u64 {
        self.integrity_rejected.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the engine counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Packets fully processed, relayed or delivered.
    pub packets_processed: u64,
    /// Packets dropped for any reason.
    pub packets_dropped: u64,
    /// Packets rejected by the replay guard.
    pub replays_rejected: u64,
    /// Packets rejected by a MAC or digest check.
    pub integrity_rejected: u64,
    /// Processed packets per second since startup.
    pub throughput_pps: f64,
    /// Mean per-packet processing latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Fraction of buffer requests served from the pool freelist.
    pub memory_pool_hit_rate: f64,
    /// Fraction of requests served by the direct fallback.
    pub fallback_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed() {
        let stats = Stats::new();
        assert_eq!(0, stats.counters.processed());
        stats.counters.increase_processed();
        assert_eq!(1, stats.counters.processed());
    }

    #[test]
    fn rejects_count_as_drops() {
        let stats = Stats::new();
        stats.counters.increase_replays_rejected();
        stats.counters.increase_integrity_rejected();
        assert_eq!(1, stats.counters.replays_rejected());
        assert_eq!(1, stats.counters.integrity_rejected());
        assert_eq!(2, stats.counters.dropped());
    }

    #[test]
    fn snapshot_rates() {
        let stats = Stats::new();
        stats.counters.increase_pool_hits();
        stats.counters.increase_pool_hits();
        stats.counters.increase_pool_hits();
        stats.counters.increase_pool_misses();
        stats.counters.increase_pipeline_served();
        stats.counters.increase_direct_served();
        stats.counters.record_latency_us(2_000);
        stats.counters.record_latency_us(4_000);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.memory_pool_hit_rate, 0.75);
        assert_eq!(snapshot.fallback_ratio, 0.5);
        assert_eq!(snapshot.avg_latency_ms, 3.0);
    }

    #[test]
    fn snapshot_empty_rates_are_zero() {
        let snapshot = Stats::new().snapshot();
        assert_eq!(snapshot.memory_pool_hit_rate, 0.0);
        assert_eq!(snapshot.fallback_ratio, 0.0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
    }
}
