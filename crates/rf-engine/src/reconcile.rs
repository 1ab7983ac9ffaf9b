//! # Reconciler
//!
//! Repairs drift by recomputing derived index state from the durable store. Callers decide
//! when to run it; nothing here schedules sweeps.

use std::sync::Arc;

use rf_core::{DurableStore, FeedError, Result, TargetKind};
use tracing::{info, instrument};

use crate::counter::ThreadCounter;
use crate::guard::StoreGuard;
use crate::ranking::{time_rank, RankingIndex};
use crate::vote::VotePolicy;

/// Counter values written by [`Reconciler::recount_post`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recount {
    pub total: u64,
    /// (top-level comment id, replies in its thread)
    pub replies: Vec<(i64, u64)>,
}

pub struct Reconciler {
    durable: Arc<dyn DurableStore>,
    ranking: Arc<RankingIndex>,
    counter: Arc<ThreadCounter>,
    policy: VotePolicy,
    guard: StoreGuard,
}

impl Reconciler {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        ranking: Arc<RankingIndex>,
        counter: Arc<ThreadCounter>,
        policy: VotePolicy,
        guard: StoreGuard,
    ) -> Self {
        Self {
            durable,
            ranking,
            counter,
            policy,
            guard,
        }
    }

    /// Rewrites the post's comment total and every thread's reply count.
    #[instrument(skip(self))]
    pub async fn recount_post(&self, post_id: i64) -> Result<Recount> {
        let total = self
            .guard
            .retry("count comments", || self.durable.count_comments(post_id))
            .await?;
        let roots = self
            .guard
            .retry("list threads", || self.durable.list_top_level_ids(post_id))
            .await?;
        let mut replies = Vec::with_capacity(roots.len());
        for root_id in roots {
            let n = self
                .guard
                .retry("count replies", || self.durable.count_replies(root_id))
                .await?;
            replies.push((root_id, n));
        }
        self.counter.reset(post_id, total, &replies).await?;
        info!(total, threads = replies.len(), "post recounted");
        Ok(Recount { total, replies })
    }

    /// Re-ranks a durable post missing from the index. Returns false if it was ranked already.
    ///
    /// Votes are summed at full weight since the time each was cast is not stored.
    #[instrument(skip(self))]
    pub async fn reindex_post(&self, post_id: i64) -> Result<bool> {
        let post = self
            .guard
            .retry("load post", || self.durable.get_post(post_id))
            .await?
            .ok_or_else(|| FeedError::not_found("post", post_id))?;
        if self.ranking.is_ranked(post_id).await? {
            return Ok(false);
        }
        let net = self
            .guard
            .retry("sum votes", || self.durable.sum_votes(TargetKind::Post, post_id))
            .await?;
        let score = time_rank(post.created_at) + net as f64 * self.policy.score_per_vote;
        self.ranking.seed_post(&post, score).await?;
        self.recount_post(post_id).await?;
        info!(net_votes = net, score, "post reindexed");
        Ok(true)
    }
}
