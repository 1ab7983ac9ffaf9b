//! # Core Traits (Ports)
//!
//! Any plugin must implement these traits to be used by the engine.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Comment, Community, Post, TargetKind, UserBrief, Vote, VoteDirection};

/// Data persistence contract for communities, users, posts, comments and votes.
///
/// The durable store owns referential truth. Every ranked or counted value in the
/// [`OrderedIndex`] can be rebuilt from it.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DurableStore: Send + Sync {
    // Community Operations
    /// Fails with `Conflict` when the name is taken.
    async fn insert_community(&self, community: &Community) -> Result<()>;
    async fn get_community(&self, id: i64) -> Result<Option<Community>>;
    async fn list_communities(&self) -> Result<Vec<Community>>;

    // User Operations
    async fn upsert_user(&self, user: &UserBrief) -> Result<()>;
    async fn get_user_brief(&self, id: i64) -> Result<Option<UserBrief>>;

    // Post Operations
    /// Fails with `Conflict` when the id already exists.
    async fn insert_post(&self, post: &Post) -> Result<()>;
    async fn get_post(&self, id: i64) -> Result<Option<Post>>;
    /// Returns posts in the order of `ids`, silently skipping missing ones.
    async fn get_posts_by_ids(&self, ids: &[i64]) -> Result<Vec<Post>>;
    /// Newest first, with the author's total post count.
    async fn list_posts_by_author(
        &self,
        author_id: i64,
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<Post>, u64)>;
    /// Removes the post with all of its comments and votes. Returns false if absent.
    async fn delete_post(&self, id: i64) -> Result<bool>;

    // Comment Operations
    async fn insert_comment(&self, comment: &Comment) -> Result<()>;
    async fn get_comment(&self, id: i64) -> Result<Option<Comment>>;
    /// Returns comments in the order of `ids`, silently skipping missing ones.
    async fn get_comments_by_ids(&self, ids: &[i64]) -> Result<Vec<Comment>>;
    /// Replies under a top-level comment, oldest first, with the thread's reply total.
    async fn list_replies(&self, root_id: i64, limit: u64, offset: u64)
        -> Result<(Vec<Comment>, u64)>;
    async fn list_top_level_ids(&self, post_id: i64) -> Result<Vec<i64>>;
    /// Every comment on the post, top-level and replies.
    async fn list_comment_ids(&self, post_id: i64) -> Result<Vec<i64>>;
    /// Every reply in the thread rooted at `root_id`.
    async fn list_reply_ids(&self, root_id: i64) -> Result<Vec<i64>>;
    async fn count_comments(&self, post_id: i64) -> Result<u64>;
    async fn count_replies(&self, root_id: i64) -> Result<u64>;
    /// Removes the comment (and, for a top-level comment, its whole reply thread).
    /// Returns the number of comment rows removed.
    async fn delete_comment(&self, id: i64) -> Result<u64>;

    // Vote Operations
    /// Inserts or replaces the voter's direction; `Cancel` deletes the row.
    async fn upsert_vote(&self, vote: &Vote) -> Result<()>;
    async fn get_vote(&self, voter_id: i64, kind: TargetKind, target_id: i64)
        -> Result<VoteDirection>;
    /// Net sum of live directions on a target.
    async fn sum_votes(&self, kind: TargetKind, target_id: i64) -> Result<i64>;
}

/// A single mutation inside an atomic [`OrderedIndex::atomic`] batch.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOp {
    /// Insert or overwrite a member's score in a ranked set.
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Add `delta` to a member's score, creating it at `delta` if absent.
    ZIncrBy {
        key: String,
        member: String,
        delta: f64,
    },
    ZRem {
        key: String,
        members: Vec<String>,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Del {
        keys: Vec<String>,
    },
}

/// Contract of the low-latency ordered-index service (ranked sets, plain sets, expiry).
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait OrderedIndex: Send + Sync {
    /// Applies every op or none of them.
    async fn atomic(&self, ops: Vec<IndexOp>) -> Result<()>;

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    /// Batched `zscore` against one key, answered in member order.
    async fn zscores(&self, key: &str, members: &[String]) -> Result<Vec<Option<f64>>>;
    async fn zcard(&self, key: &str) -> Result<u64>;
    /// Members by descending score within the inclusive rank range `[start, stop]`.
    async fn zrevrange(&self, key: &str, start: u64, stop: u64) -> Result<Vec<String>>;
    /// All members by ascending score.
    async fn zrange_all(&self, key: &str) -> Result<Vec<String>>;
    /// Batched count of members with `min <= score <= max`, one per key.
    async fn zcount_each(&self, keys: &[String], min: f64, max: f64) -> Result<Vec<u64>>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Stores the intersection of a plain set and a ranked set into `dest` (scores
    /// aggregated with MAX, plain-set members counting as 1) and expires `dest` after `ttl`.
    /// Returns the cardinality of `dest`.
    async fn zinterstore_max(
        &self,
        dest: &str,
        set_key: &str,
        zset_key: &str,
        ttl: Duration,
    ) -> Result<u64>;
}

/// One message handed to a consumer. It stays in flight until acked or nacked.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub offset: u64,
    pub key: String,
    pub payload: Bytes,
    /// 1 on first delivery, incremented on each redelivery
    pub attempt: u32,
}

/// Message broker contract: non-blocking publish, pull-based consumption, manual ack.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Never blocks; fails with `QueueSaturated` when the outbound queue is full.
    fn try_publish(&self, key: &str, payload: Bytes) -> Result<()>;
    /// Waits for the next delivery; `None` once the broker is closed and drained.
    async fn poll(&self) -> Result<Option<Delivery>>;
    async fn ack(&self, offset: u64) -> Result<()>;
    /// Returns the delivery to the queue for another attempt.
    async fn nack(&self, offset: u64) -> Result<()>;
}

/// Source of "now", injectable so age-dependent policy can be tested with literal timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
