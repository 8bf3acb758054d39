//! Metrics collection for observability
//!
//! Prometheus metrics for monitoring a validator. Every collector lives in a
//! private [`Registry`], so several nodes can run in one process.
//!
//! # Metrics
//!
//! - `validator_blocks_finalized_total` - Blocks finalized
//! - `validator_revisions_total` - Finality attempts that fell through to a new revision
//! - `validator_bans_total` - Validators banned in evaluated rounds
//! - `validator_peer_fetch_failures_total` - Peer pulls that failed after the retry
//! - `validator_merge_rejections_total` - Envelopes discarded on merge
//! - `validator_joins_accepted_total` / `validator_joins_rejected_total` - Join requests
//! - `validator_block_id` - Id of the current snapshot
//! - `validator_peer_fetch_seconds` - Latency of peer pulls

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Blocks finalized
    pub blocks_finalized: IntCounter,

    /// Revisions started after a failed finality attempt
    pub revisions: IntCounter,

    /// Banned validators
    pub bans: IntCounter,

    /// Failed peer fetches
    pub peer_fetch_failures: IntCounter,

    /// Rejected envelopes
    pub merge_rejections: IntCounter,

    /// Accepted join requests
    pub joins_accepted: IntCounter,

    /// Rejected join requests
    pub joins_rejected: IntCounter,

    /// Current snapshot id
    pub block_id: IntGauge,

    /// Peer fetch latency
    pub peer_fetch_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_finalized = counter(&registry, "validator_blocks_finalized_total", "Blocks finalized")?;
        let revisions = counter(
            &registry,
            "validator_revisions_total",
            "Finality attempts that fell through to a new revision",
        )?;
        let bans = counter(&registry, "validator_bans_total", "Validators banned in evaluated rounds")?;
        let peer_fetch_failures = counter(
            &registry,
            "validator_peer_fetch_failures_total",
            "Peer pulls that failed after the retry",
        )?;
        let merge_rejections = counter(
            &registry,
            "validator_merge_rejections_total",
            "Envelopes discarded on merge",
        )?;
        let joins_accepted = counter(&registry, "validator_joins_accepted_total", "Join requests accepted")?;
        let joins_rejected = counter(&registry, "validator_joins_rejected_total", "Join requests rejected")?;

        let block_id = IntGauge::new("validator_block_id", "Id of the current snapshot")?;
        registry.register(Box::new(block_id.clone()))?;

        let peer_fetch_duration = Histogram::with_opts(
            HistogramOpts::new("validator_peer_fetch_seconds", "Latency of peer pulls")
                .buckets(vec![0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5]),
        )?;
        registry.register(Box::new(peer_fetch_duration.clone()))?;

        Ok(Self {
            blocks_finalized,
            revisions,
            bans,
            peer_fetch_failures,
            merge_rejections,
            joins_accepted,
            joins_rejected,
            block_id,
            peer_fetch_duration,
            registry,
        })
    }

    /// Record block finalization
    pub fn record_block_finalized(&self, block_id: u64) {
        self.blocks_finalized.inc();
        self.block_id.set(block_id as i64);
    }

    /// Record a failed finality attempt
    pub fn record_new_revision(&self, banned: usize) {
        self.revisions.inc();
        self.bans.inc_by(banned as u64);
    }

    /// Record a join decision
    pub fn record_join(&self, accepted: bool) {
        if accepted {
            self.joins_accepted.inc();
        } else {
            self.joins_rejected.inc();
        }
    }

    /// Prometheus text exposition of all collectors
    pub fn export(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.blocks_finalized.get(), 0);
        assert_eq!(metrics.block_id.get(), 0);
    }

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();
        first.record_block_finalized(7);

        assert_eq!(first.block_id.get(), 7);
        assert_eq!(second.blocks_finalized.get(), 0);
    }

    #[test]
    fn test_record_revision_and_joins() {
        let metrics = Metrics::new().unwrap();
        metrics.record_new_revision(2);
        metrics.record_join(true);
        metrics.record_join(false);
        metrics.record_join(false);

        assert_eq!(metrics.revisions.get(), 1);
        assert_eq!(metrics.bans.get(), 2);
        assert_eq!(metrics.joins_accepted.get(), 1);
        assert_eq!(metrics.joins_rejected.get(), 2);
    }

    #[test]
    fn test_export() {
        let metrics = Metrics::new().unwrap();
        metrics.record_block_finalized(3);
        let text = metrics.export().unwrap();
        assert!(text.contains("validator_blocks_finalized_total 1"));
        assert!(text.contains("validator_block_id 3"));
    }
}
