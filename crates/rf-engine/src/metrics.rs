//! # Engine metrics
//!
//! Prometheus counters shared by every engine component. Cloning is cheap; all clones
//! update the same underlying atomics.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;
use rf_core::FeedError;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    pub posts_queued: Counter,
    pub posts_dropped: Counter,
    pub posts_persisted: Counter,
    pub posts_indexed: Counter,
    pub index_drift: Counter,
    pub votes_applied: Counter,
}

impl EngineMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "posts_queued",
            "Post-creation events accepted by the broker",
            self.posts_queued.clone(),
        );
        registry.register(
            "posts_dropped",
            "Post-creation events dropped on a saturated queue",
            self.posts_dropped.clone(),
        );
        registry.register(
            "posts_persisted",
            "Posts written to the durable store by the ingestion consumer",
            self.posts_persisted.clone(),
        );
        registry.register(
            "posts_indexed",
            "Posts inserted into the ranking index",
            self.posts_indexed.clone(),
        );
        registry.register(
            "index_drift",
            "Derived index updates that failed after the primary write succeeded",
            self.index_drift.clone(),
        );
        registry.register(
            "votes_applied",
            "Vote transitions that changed a stored direction",
            self.votes_applied.clone(),
        );
    }

    /// Logs a derived-update failure as drift. The caller carries on.
    pub fn record_drift(&self, what: &str, target_id: i64, err: &FeedError) {
        self.index_drift.inc();
        let drift = FeedError::IndexDrift(format!("{what} for {target_id}: {err}"));
        warn!(target_id, error = %drift, "index left stale, reconcile to repair");
    }
}
