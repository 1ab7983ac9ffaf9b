//! rusty-feed/crates/rf-engine/src/lib.rs
//!
//! The ranking and consistency engine: vote aggregation, rank index maintenance, thread
//! counters, pagination and the async ingestion pipeline, all written against the ports
//! in `rf-core`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rf_core::WireFormat;

pub mod counter;
pub mod guard;
pub mod ids;
pub mod ingest;
pub mod keys;
pub mod metrics;
pub mod pagination;
pub mod ranking;
pub mod reconcile;
pub mod service;
pub mod vote;

pub use guard::StoreGuard;
pub use ingest::{IngestConsumer, IngestState, Submission};
pub use metrics::EngineMetrics;
pub use pagination::PageRequest;
pub use reconcile::{Recount, Reconciler};
pub use service::FeedService;
pub use vote::{VoteOutcome, VotePolicy};

/// Everything the engine needs to know that is not a port.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub machine_id: u16,
    pub id_epoch: DateTime<Utc>,
    pub key_prefix: String,
    /// Lifetime of materialised community and liked-post intersections
    pub intersection_ttl: Duration,
    pub vote: VotePolicy,
    pub wire_format: WireFormat,
    pub redelivery_backoff: Duration,
    pub guard: StoreGuard,
    pub max_page_size: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            machine_id: 1,
            // 2024-01-01T00:00:00Z
            id_epoch: DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default(),
            key_prefix: "feed:".into(),
            intersection_ttl: Duration::from_secs(60),
            vote: VotePolicy::default(),
            wire_format: WireFormat::Protobuf,
            redelivery_backoff: Duration::from_secs(1),
            guard: StoreGuard::default(),
            max_page_size: 100,
        }
    }
}
