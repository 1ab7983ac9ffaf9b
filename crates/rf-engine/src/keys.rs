//! # Index key layout
//!
//! Every key the engine reads or writes in the ordered index, behind one configurable prefix.
//! Components never format keys themselves.

use rf_core::{SortOrder, TargetKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKeys {
    prefix: String,
}

impl Default for IndexKeys {
    fn default() -> Self {
        Self::new("feed:")
    }
}

impl IndexKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Ranked set of all posts by creation time.
    pub fn post_time(&self) -> String {
        format!("{}post:time", self.prefix)
    }

    /// Ranked set of all posts by score.
    pub fn post_score(&self) -> String {
        format!("{}post:score", self.prefix)
    }

    pub fn post_rank(&self, order: SortOrder) -> String {
        match order {
            SortOrder::Time => self.post_time(),
            SortOrder::Score => self.post_score(),
        }
    }

    /// Plain set of the post ids published into a community.
    pub fn community(&self, community_id: i64) -> String {
        format!("{}community:{community_id}", self.prefix)
    }

    /// Materialised (community x rank) intersection, short-lived.
    pub fn community_rank(&self, order: SortOrder, community_id: i64) -> String {
        format!("{}:community:{community_id}", self.post_rank(order))
    }

    /// post id -> total comments on the post
    pub fn post_comment_count(&self) -> String {
        format!("{}post:comment_num", self.prefix)
    }

    /// top-level comment id -> replies in its thread
    pub fn reply_count(&self) -> String {
        format!("{}comment:num", self.prefix)
    }

    pub fn comment_time(&self, post_id: i64) -> String {
        format!("{}comment:time:{post_id}", self.prefix)
    }

    pub fn comment_score(&self, post_id: i64) -> String {
        format!("{}comment:score:{post_id}", self.prefix)
    }

    pub fn comment_rank(&self, order: SortOrder, post_id: i64) -> String {
        match order {
            SortOrder::Time => self.comment_time(post_id),
            SortOrder::Score => self.comment_score(post_id),
        }
    }

    /// voter id -> direction for one target
    pub fn voted(&self, kind: TargetKind, target_id: i64) -> String {
        format!("{}{}:voted:{target_id}", self.prefix, kind.as_str())
    }

    /// Plain set of the targets a user has up-voted.
    pub fn user_liked(&self, kind: TargetKind, user_id: i64) -> String {
        format!("{}user_liked:{}s:{user_id}", self.prefix, kind.as_str())
    }

    /// The user's liked posts intersected with the live time rank, short-lived.
    pub fn user_liked_rank(&self, user_id: i64) -> String {
        format!("{}:ranked", self.user_liked(TargetKind::Post, user_id))
    }
}
