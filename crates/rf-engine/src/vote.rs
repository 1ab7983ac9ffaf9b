//! # Vote Aggregator
//!
//! Turns a voter's direction change into a weighted score delta. Only the difference from
//! the previously stored direction is ever charged, so replaying the same direction moves
//! nothing and a sequence of toggles telescopes to the last direction.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rf_core::{
    Clock, DurableStore, IndexOp, OrderedIndex, Result, TargetKind, Vote, VoteDirection,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::guard::StoreGuard;
use crate::keys::IndexKeys;
use crate::metrics::EngineMetrics;

const LOCK_STRIPES: usize = 256;

/// Age-based weighting of a vote's score contribution.
#[derive(Debug, Clone, PartialEq)]
pub struct VotePolicy {
    pub score_per_vote: f64,
    /// Votes on targets at most this old count in full
    pub grace_window: Duration,
    pub post_reduced_weight: f64,
    pub comment_reduced_weight: f64,
}

impl Default for VotePolicy {
    fn default() -> Self {
        Self {
            score_per_vote: 432.0,
            grace_window: Duration::from_secs(7 * 24 * 3600),
            post_reduced_weight: 0.8,
            comment_reduced_weight: 0.5,
        }
    }
}

impl VotePolicy {
    /// `age` is measured against the post, or the top-level ancestor for a comment.
    pub fn weight(&self, kind: TargetKind, age: chrono::Duration) -> f64 {
        let within_grace = age
            .to_std()
            .map(|age| age <= self.grace_window)
            // negative age: created "in the future" relative to our clock
            .unwrap_or(true);
        match (within_grace, kind) {
            (true, _) => 1.0,
            (false, TargetKind::Post) => self.post_reduced_weight,
            (false, TargetKind::Comment) => self.comment_reduced_weight,
        }
    }

    pub fn score_delta(&self, delta: i8, weight: f64) -> f64 {
        f64::from(delta) * self.score_per_vote * weight
    }
}

/// A vote target resolved against the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteTarget {
    Post { post_id: i64 },
    Comment {
        comment_id: i64,
        post_id: i64,
        /// Only top-level comments hold a score rank.
        top_level: bool,
    },
}

impl VoteTarget {
    pub fn kind(&self) -> TargetKind {
        match self {
            VoteTarget::Post { .. } => TargetKind::Post,
            VoteTarget::Comment { .. } => TargetKind::Comment,
        }
    }

    pub fn id(&self) -> i64 {
        match *self {
            VoteTarget::Post { post_id } => post_id,
            VoteTarget::Comment { comment_id, .. } => comment_id,
        }
    }
}

/// What a single `apply_vote` call changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoteOutcome {
    pub previous: VoteDirection,
    pub current: VoteDirection,
    pub delta: i8,
    pub weight: f64,
    /// Amount added to the target's score rank (0 when it has none)
    pub score_delta: f64,
}

impl VoteOutcome {
    pub fn is_noop(&self) -> bool {
        self.delta == 0
    }
}

pub struct VoteAggregator {
    durable: Arc<dyn DurableStore>,
    index: Arc<dyn OrderedIndex>,
    keys: IndexKeys,
    policy: VotePolicy,
    clock: Arc<dyn Clock>,
    guard: StoreGuard,
    metrics: EngineMetrics,
    stripes: Vec<Mutex<()>>,
}

impl VoteAggregator {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        index: Arc<dyn OrderedIndex>,
        keys: IndexKeys,
        policy: VotePolicy,
        clock: Arc<dyn Clock>,
        guard: StoreGuard,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            durable,
            index,
            keys,
            policy,
            clock,
            guard,
            metrics,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn policy(&self) -> &VotePolicy {
        &self.policy
    }

    /// Applies `direction` for `voter_id` on `target`.
    ///
    /// `target_created_at` is the post's creation time, or the top-level ancestor's for a
    /// comment. Calls for the same (voter, target) are serialised; the previous direction is
    /// read from the index under that lock, so retrying after a failure recomputes the diff.
    #[instrument(skip(self), fields(kind = target.kind().as_str(), target_id = target.id()))]
    pub async fn apply_vote(
        &self,
        voter_id: i64,
        target: VoteTarget,
        direction: VoteDirection,
        target_created_at: DateTime<Utc>,
    ) -> Result<VoteOutcome> {
        let kind = target.kind();
        let target_id = target.id();
        let _serial = self.stripe(voter_id, kind, target_id).lock().await;

        // 1. Previous direction, defaulting to cancelled
        let voted_key = self.keys.voted(kind, target_id);
        let voter = voter_id.to_string();
        let previous = self
            .guard
            .retry("read previous vote", || self.index.zscore(&voted_key, &voter))
            .await?
            .map(VoteDirection::from_score)
            .unwrap_or_default();

        let delta = direction.value() - previous.value();
        let weight = self
            .policy
            .weight(kind, self.clock.now() - target_created_at);
        if delta == 0 {
            debug!(voter_id, direction = direction.value(), "vote unchanged");
            return Ok(VoteOutcome {
                previous,
                current: direction,
                delta: 0,
                weight,
                score_delta: 0.0,
            });
        }

        // 2. Durable relation first; upserting a direction is idempotent
        let vote = Vote {
            voter_id,
            kind,
            target_id,
            direction,
        };
        self.guard
            .retry("persist vote", || self.durable.upsert_vote(&vote))
            .await?;

        // 3. Score, voted set and liked set move together or not at all
        let score_delta = match self.score_key(target) {
            Some(_) => self.policy.score_delta(delta, weight),
            None => 0.0,
        };
        let ops = self.index_ops(target, voter_id, direction, score_delta);
        self.guard.once("apply vote batch", self.index.atomic(ops)).await?;

        self.metrics.votes_applied.inc();
        info!(
            voter_id,
            previous = previous.value(),
            direction = direction.value(),
            delta,
            weight,
            score_delta,
            "vote applied"
        );
        Ok(VoteOutcome {
            previous,
            current: direction,
            delta,
            weight,
            score_delta,
        })
    }

    fn score_key(&self, target: VoteTarget) -> Option<String> {
        match target {
            VoteTarget::Post { .. } => Some(self.keys.post_score()),
            VoteTarget::Comment {
                post_id,
                top_level: true,
                ..
            } => Some(self.keys.comment_score(post_id)),
            VoteTarget::Comment { .. } => None,
        }
    }

    fn index_ops(
        &self,
        target: VoteTarget,
        voter_id: i64,
        direction: VoteDirection,
        score_delta: f64,
    ) -> Vec<IndexOp> {
        let kind = target.kind();
        let member = target.id().to_string();
        let voter = voter_id.to_string();
        let mut ops = Vec::with_capacity(3);

        if let Some(key) = self.score_key(target) {
            ops.push(IndexOp::ZIncrBy {
                key,
                member: member.clone(),
                delta: score_delta,
            });
        }

        let voted = self.keys.voted(kind, target.id());
        ops.push(match direction {
            VoteDirection::Cancel => IndexOp::ZRem {
                key: voted,
                members: vec![voter],
            },
            _ => IndexOp::ZAdd {
                key: voted,
                member: voter,
                score: f64::from(direction.value()),
            },
        });

        let liked = self.keys.user_liked(kind, voter_id);
        ops.push(match direction {
            VoteDirection::Up => IndexOp::SAdd { key: liked, member },
            _ => IndexOp::SRem { key: liked, member },
        });
        ops
    }

    fn stripe(&self, voter_id: i64, kind: TargetKind, target_id: i64) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        (voter_id, kind, target_id).hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }
}
