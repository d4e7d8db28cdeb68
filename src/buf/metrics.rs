//! Buffer pool metrics
//!
//! Counters live in a per-pool prometheus [`Registry`] so several pools can
//! coexist in one process; hosts export them with [`PoolMetrics::export_text`]
//! or merge [`PoolMetrics::registry`] into their own.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Error, Result};

const NAMESPACE: &str = "bufpool";

/// Prometheus counters and gauges of one pool
#[derive(Clone)]
pub struct PoolMetrics {
    registry: Registry,

    // Page access
    pub page_hits: IntCounter,
    pub page_misses: IntCounter,
    pub pages_read: IntCounter,
    pub pages_created: IntCounter,
    pub pages_written: IntCounter,
    pub read_errors: IntCounter,

    // Replacement
    pub evictions: IntCounter,
    pub made_young: IntCounter,
    pub free_slot_waits: IntCounter,
    pub flush_requests: IntCounter,
    pub tablespace_evictions: IntCounter,

    // Read-ahead
    pub read_ahead_random: IntCounter,
    pub read_ahead_linear: IntCounter,

    // Buddy
    pub buddy_splits: IntCounter,
    pub buddy_merges: IntCounter,
    pub buddy_relocations: IntCounter,
    pub buddy_relocation_failures: IntCounter,

    // Occupancy (sampled)
    pub free_slots: IntGauge,
    pub lru_len: IntGauge,
    pub lru_old_len: IntGauge,
    pub pending_reads: IntGauge,
    pub wait_reserved: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge> {
    let g = IntGauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl PoolMetrics {
    pub fn new() -> Result<Self> {
        let r = Registry::new();
        Ok(Self {
            page_hits: counter(&r, "page_hits_total", "Page requests served from the pool")?,
            page_misses: counter(&r, "page_misses_total", "Page requests that needed a read")?,
            pages_read: counter(&r, "pages_read_total", "Pages read from the store")?,
            pages_created: counter(&r, "pages_created_total", "Pages initialised without a read")?,
            pages_written: counter(&r, "pages_written_total", "Pages written back to the store")?,
            read_errors: counter(&r, "read_errors_total", "Failed page reads")?,
            evictions: counter(&r, "evictions_total", "Slots reclaimed from the LRU tail")?,
            made_young: counter(&r, "made_young_total", "Pages moved to the LRU head")?,
            free_slot_waits: counter(&r, "free_slot_waits_total", "Failed free slot search rounds")?,
            flush_requests: counter(&r, "flush_requests_total", "Write-back requests to the flusher")?,
            tablespace_evictions: counter(&r, "tablespace_evictions_total", "Slots freed by dropping tablespaces")?,
            read_ahead_random: counter(&r, "read_ahead_random_total", "Pages read by random read-ahead")?,
            read_ahead_linear: counter(&r, "read_ahead_linear_total", "Pages read by linear read-ahead")?,
            buddy_splits: counter(&r, "buddy_splits_total", "Buddy block splits")?,
            buddy_merges: counter(&r, "buddy_merges_total", "Buddy block merges")?,
            buddy_relocations: counter(&r, "buddy_relocations_total", "Compressed images moved between blocks")?,
            buddy_relocation_failures: counter(&r, "buddy_relocation_failures_total", "Refused buddy relocations")?,
            free_slots: gauge(&r, "free_slots", "Slots on the free list")?,
            lru_len: gauge(&r, "lru_len", "Slots on the LRU list")?,
            lru_old_len: gauge(&r, "lru_old_len", "Slots in the old LRU segment")?,
            pending_reads: gauge(&r, "pending_reads", "Submitted asynchronous reads")?,
            wait_reserved: gauge(&r, "wait_reserved_cells", "Reserved wait array cells")?,
            registry: r,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every metric
    pub fn export_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Config(format!("metrics are not UTF-8: {}", e)))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            page_hits: self.page_hits.get(),
            page_misses: self.page_misses.get(),
            pages_read: self.pages_read.get(),
            pages_created: self.pages_created.get(),
            pages_written: self.pages_written.get(),
            read_errors: self.read_errors.get(),
            evictions: self.evictions.get(),
            made_young: self.made_young.get(),
            free_slot_waits: self.free_slot_waits.get(),
            flush_requests: self.flush_requests.get(),
            tablespace_evictions: self.tablespace_evictions.get(),
            read_ahead_random: self.read_ahead_random.get(),
            read_ahead_linear: self.read_ahead_linear.get(),
            buddy_splits: self.buddy_splits.get(),
            buddy_merges: self.buddy_merges.get(),
            buddy_relocations: self.buddy_relocations.get(),
            buddy_relocation_failures: self.buddy_relocation_failures.get(),
        }
    }

    /// Hit ratio over the pool's lifetime
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.page_hits.get() as f64;
        let total = hits + self.page_misses.get() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

impl std::fmt::Debug for PoolMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Counter values at one point in time
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub page_hits: u64,
    pub page_misses: u64,
    pub pages_read: u64,
    pub pages_created: u64,
    pub pages_written: u64,
    pub read_errors: u64,
    pub evictions: u64,
    pub made_young: u64,
    pub free_slot_waits: u64,
    pub flush_requests: u64,
    pub tablespace_evictions: u64,
    pub read_ahead_random: u64,
    pub read_ahead_linear: u64,
    pub buddy_splits: u64,
    pub buddy_merges: u64,
    pub buddy_relocations: u64,
    pub buddy_relocation_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let m = PoolMetrics::new().unwrap();
        m.page_hits.inc();
        m.page_hits.inc();
        m.page_misses.inc();
        m.buddy_splits.inc_by(3);

        let s = m.snapshot();
        assert_eq!(s.page_hits, 2);
        assert_eq!(s.buddy_splits, 3);
        assert!((m.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_export_text() {
        let m = PoolMetrics::new().unwrap();
        m.evictions.inc();
        m.free_slots.set(12);
        let text = m.export_text().unwrap();
        assert!(text.contains("bufpool_evictions_total 1"));
        assert!(text.contains("bufpool_free_slots 12"));
    }

    #[test]
    fn test_independent_registries() {
        let a = PoolMetrics::new().unwrap();
        let b = PoolMetrics::new().unwrap();
        a.pages_read.inc();
        assert_eq!(b.pages_read.get(), 0);
    }
}
