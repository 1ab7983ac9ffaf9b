//! # Ranking Index Manager
//!
//! Owns the post rank entries: time rank, score rank, community membership and the comment
//! counter seed. Community feeds and a user's liked feed are served from short-lived
//! materialised intersections, so they may lag writes by up to the intersection TTL.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rf_core::{FeedScope, IndexOp, OrderedIndex, Post, Result, SortOrder, TargetKind};
use tracing::{debug, instrument, warn};

use crate::guard::StoreGuard;
use crate::keys::IndexKeys;
use crate::pagination::PageRequest;

/// Rank key for a creation time: unix seconds with millisecond precision.
pub fn time_rank(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

pub struct RankingIndex {
    index: Arc<dyn OrderedIndex>,
    keys: IndexKeys,
    guard: StoreGuard,
    intersection_ttl: Duration,
}

impl RankingIndex {
    pub fn new(
        index: Arc<dyn OrderedIndex>,
        keys: IndexKeys,
        guard: StoreGuard,
        intersection_ttl: Duration,
    ) -> Self {
        Self {
            index,
            keys,
            guard,
            intersection_ttl,
        }
    }

    /// Inserts a new post with its score seeded to its creation time.
    ///
    /// The seed is added to the score rather than written over it: on the async path a vote
    /// can reach the post between its durable insert and this call. A post that already has
    /// a time rank is left alone, so a redelivered event does not add the seed twice.
    #[instrument(skip(self, post), fields(post_id = post.id))]
    pub async fn on_post_created(&self, post: &Post) -> Result<()> {
        if self.is_ranked(post.id).await? {
            debug!("post already ranked");
            return Ok(());
        }
        let seed = time_rank(post.created_at);
        let score = IndexOp::ZIncrBy {
            key: self.keys.post_score(),
            member: post.id.to_string(),
            delta: seed,
        };
        self.guard
            .once("index post", self.index.atomic(self.entry_ops(post, score)))
            .await?;
        debug!(community_id = post.community_id, seed, "post ranked");
        Ok(())
    }

    /// Inserts every rank entry of a post, overwriting its score with `score`.
    #[instrument(skip(self, post), fields(post_id = post.id))]
    pub async fn seed_post(&self, post: &Post, score: f64) -> Result<()> {
        let score_op = IndexOp::ZAdd {
            key: self.keys.post_score(),
            member: post.id.to_string(),
            score,
        };
        self.guard
            .once("reseed post", self.index.atomic(self.entry_ops(post, score_op)))
            .await?;
        debug!(community_id = post.community_id, score, "post reseeded");
        Ok(())
    }

    /// Time rank, `score_op`, community membership and the comment counter. The counter is
    /// incremented by zero so comments counted before the post was ranked survive.
    fn entry_ops(&self, post: &Post, score_op: IndexOp) -> Vec<IndexOp> {
        let member = post.id.to_string();
        vec![
            IndexOp::ZAdd {
                key: self.keys.post_time(),
                member: member.clone(),
                score: time_rank(post.created_at),
            },
            score_op,
            IndexOp::SAdd {
                key: self.keys.community(post.community_id),
                member: member.clone(),
            },
            IndexOp::ZIncrBy {
                key: self.keys.post_comment_count(),
                member,
                delta: 0.0,
            },
        ]
    }

    /// Removes a post's rank, membership and counter entries together with the entries of
    /// its comments. Top-level comment ids are enumerated from the index; `comment_ids` adds
    /// the ids known to the durable store (replies included).
    #[instrument(skip(self, post, comment_ids), fields(post_id = post.id, comments = comment_ids.len()))]
    pub async fn on_post_deleted(&self, post: &Post, comment_ids: &[i64]) -> Result<()> {
        let comment_time = self.keys.comment_time(post.id);
        let indexed = self
            .guard
            .retry("list top-level comments", || self.index.zrange_all(&comment_time))
            .await?;

        let mut comments: BTreeSet<String> = indexed.into_iter().collect();
        comments.extend(comment_ids.iter().map(i64::to_string));

        let member = post.id.to_string();
        let mut stale_keys = vec![
            self.keys.voted(TargetKind::Post, post.id),
            comment_time,
            self.keys.comment_score(post.id),
        ];
        stale_keys.extend(comments.iter().filter_map(|c| {
            c.parse()
                .map(|id| self.keys.voted(TargetKind::Comment, id))
                .ok()
        }));

        let mut ops = vec![
            IndexOp::ZRem {
                key: self.keys.post_time(),
                members: vec![member.clone()],
            },
            IndexOp::ZRem {
                key: self.keys.post_score(),
                members: vec![member.clone()],
            },
            IndexOp::SRem {
                key: self.keys.community(post.community_id),
                member: member.clone(),
            },
            IndexOp::ZRem {
                key: self.keys.post_comment_count(),
                members: vec![member],
            },
            IndexOp::Del { keys: stale_keys },
        ];
        if !comments.is_empty() {
            ops.push(IndexOp::ZRem {
                key: self.keys.reply_count(),
                members: comments.into_iter().collect(),
            });
        }
        self.guard.once("unindex post", self.index.atomic(ops)).await
    }

    /// One rank-descending page of post ids plus the size of the ranked collection.
    #[instrument(skip(self))]
    pub async fn query_rank_page(
        &self,
        scope: FeedScope,
        order: SortOrder,
        page: PageRequest,
    ) -> Result<(Vec<i64>, u64)> {
        let key = match scope {
            FeedScope::All => self.keys.post_rank(order),
            FeedScope::Community(community_id) => {
                let dest = self.keys.community_rank(order, community_id);
                self.materialise(&dest, &self.keys.community(community_id), &self.keys.post_rank(order))
                    .await?;
                dest
            }
        };
        self.page_of(&key, page).await
    }

    /// Top-level comments of a post, rank-descending.
    pub async fn query_comment_page(
        &self,
        post_id: i64,
        order: SortOrder,
        page: PageRequest,
    ) -> Result<(Vec<i64>, u64)> {
        self.page_of(&self.keys.comment_rank(order, post_id), page).await
    }

    /// The user's liked posts that are still live, most recent first.
    pub async fn query_liked_page(&self, user_id: i64, page: PageRequest) -> Result<(Vec<i64>, u64)> {
        let dest = self.keys.user_liked_rank(user_id);
        self.materialise(
            &dest,
            &self.keys.user_liked(TargetKind::Post, user_id),
            &self.keys.post_time(),
        )
        .await?;
        self.page_of(&dest, page).await
    }

    pub async fn is_ranked(&self, post_id: i64) -> Result<bool> {
        let key = self.keys.post_time();
        let member = post_id.to_string();
        Ok(self
            .guard
            .retry("check post rank", || self.index.zscore(&key, &member))
            .await?
            .is_some())
    }

    /// Recomputes `dest` only when the previous copy has expired.
    async fn materialise(&self, dest: &str, set_key: &str, zset_key: &str) -> Result<()> {
        if self.guard.retry("check intersection", || self.index.exists(dest)).await? {
            return Ok(());
        }
        let size = self
            .guard
            .retry("intersect", || {
                self.index
                    .zinterstore_max(dest, set_key, zset_key, self.intersection_ttl)
            })
            .await?;
        debug!(dest, size, ttl = ?self.intersection_ttl, "intersection materialised");
        Ok(())
    }

    async fn page_of(&self, key: &str, page: PageRequest) -> Result<(Vec<i64>, u64)> {
        let total = self.guard.retry("count rank", || self.index.zcard(key)).await?;
        let (start, stop) = page.rank_range();
        if start >= total {
            return Ok((Vec::new(), total));
        }
        let members = self
            .guard
            .retry("read rank page", || self.index.zrevrange(key, start, stop))
            .await?;
        Ok((parse_ids(key, members), total))
    }
}

/// Index members are decimal ids; anything else is logged and skipped.
pub(crate) fn parse_ids(key: &str, members: Vec<String>) -> Vec<i64> {
    members
        .into_iter()
        .filter_map(|m| match m.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(key, member = %m, "non-numeric member in rank");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rf_index_memory::MemoryIndex;

    fn post(id: i64, community_id: i64, minute: u32) -> Post {
        Post {
            id,
            author_id: 1,
            community_id,
            content: format!("post {id}"),
            image: None,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap(),
        }
    }

    fn ranking(index: Arc<MemoryIndex>) -> RankingIndex {
        RankingIndex::new(
            index,
            IndexKeys::default(),
            StoreGuard::default(),
            Duration::from_secs(60),
        )
    }

    fn page(page: u64, size: u64) -> PageRequest {
        PageRequest::new(page, size, 100).unwrap()
    }

    #[tokio::test]
    async fn score_is_seeded_from_creation_time() {
        let index = Arc::new(MemoryIndex::new());
        let ranks = ranking(index.clone());
        let p = post(1, 3, 0);
        ranks.on_post_created(&p).await.unwrap();

        let seed = time_rank(p.created_at);
        assert_eq!(index.zscore("feed:post:score", "1").await.unwrap(), Some(seed));
        assert_eq!(index.zscore("feed:post:comment_num", "1").await.unwrap(), Some(0.0));
        assert!(index.sismember("feed:community:3", "1").await.unwrap());
    }

    #[tokio::test]
    async fn vote_before_indexing_is_kept() {
        let index = Arc::new(MemoryIndex::new());
        let ranks = ranking(index.clone());
        let p = post(1, 3, 0);
        index
            .atomic(vec![IndexOp::ZIncrBy {
                key: "feed:post:score".into(),
                member: "1".into(),
                delta: 432.0,
            }])
            .await
            .unwrap();

        ranks.on_post_created(&p).await.unwrap();
        ranks.on_post_created(&p).await.unwrap();

        let seed = time_rank(p.created_at);
        assert_eq!(index.zscore("feed:post:score", "1").await.unwrap(), Some(seed + 432.0));
        assert_eq!(index.zscore("feed:post:time", "1").await.unwrap(), Some(seed));
    }

    #[tokio::test]
    async fn reseed_overwrites_the_score() {
        let index = Arc::new(MemoryIndex::new());
        let ranks = ranking(index.clone());
        let p = post(1, 3, 0);
        ranks.on_post_created(&p).await.unwrap();
        ranks.seed_post(&p, 5.0).await.unwrap();
        assert_eq!(index.zscore("feed:post:score", "1").await.unwrap(), Some(5.0));
    }

    #[tokio::test]
    async fn community_page_is_intersected_and_cached() {
        let index = Arc::new(MemoryIndex::new());
        let ranks = ranking(index.clone());
        for (id, community) in [(1, 3), (2, 4), (3, 3), (4, 3)] {
            ranks.on_post_created(&post(id, community, id as u32)).await.unwrap();
        }

        let (ids, total) = ranks
            .query_rank_page(FeedScope::Community(3), SortOrder::Time, page(1, 2))
            .await
            .unwrap();
        assert_eq!(ids, vec![4, 3]);
        assert_eq!(total, 3);

        // a newer post stays invisible until the cached intersection expires
        ranks.on_post_created(&post(5, 3, 9)).await.unwrap();
        let (_, total) = ranks
            .query_rank_page(FeedScope::Community(3), SortOrder::Time, page(1, 2))
            .await
            .unwrap();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn page_past_the_end_is_empty() {
        let index = Arc::new(MemoryIndex::new());
        let ranks = ranking(index.clone());
        ranks.on_post_created(&post(1, 3, 0)).await.unwrap();
        let (ids, total) = ranks
            .query_rank_page(FeedScope::All, SortOrder::Score, page(2, 10))
            .await
            .unwrap();
        assert!(ids.is_empty());
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn delete_clears_comment_entries() {
        let index = Arc::new(MemoryIndex::new());
        let ranks = ranking(index.clone());
        let p = post(1, 3, 0);
        ranks.on_post_created(&p).await.unwrap();
        index
            .atomic(vec![
                IndexOp::ZAdd { key: "feed:comment:time:1".into(), member: "10".into(), score: 1.0 },
                IndexOp::ZAdd { key: "feed:comment:num".into(), member: "10".into(), score: 1.0 },
                IndexOp::ZAdd { key: "feed:comment:voted:10".into(), member: "7".into(), score: 1.0 },
                IndexOp::ZAdd { key: "feed:comment:voted:11".into(), member: "7".into(), score: 1.0 },
            ])
            .await
            .unwrap();

        ranks.on_post_deleted(&p, &[10, 11]).await.unwrap();

        assert!(!ranks.is_ranked(1).await.unwrap());
        assert!(!index.sismember("feed:community:3", "1").await.unwrap());
        assert!(!index.exists("feed:comment:time:1").await.unwrap());
        assert!(!index.exists("feed:comment:voted:10").await.unwrap());
        assert!(!index.exists("feed:comment:voted:11").await.unwrap());
        assert_eq!(index.zscore("feed:comment:num", "10").await.unwrap(), None);
    }
}
