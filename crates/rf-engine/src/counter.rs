//! # Thread Counter
//!
//! Incremental comment counters: the total per post and the reply count per top-level
//! comment. Every update is one atomic index batch. The durable store stays the source of
//! truth; [`crate::reconcile::Reconciler`] rebuilds these values from it.

use std::sync::Arc;

use rf_core::{Comment, IndexOp, OrderedIndex, Result, TargetKind};
use tracing::{debug, instrument, warn};

use crate::guard::StoreGuard;
use crate::keys::IndexKeys;
use crate::ranking::time_rank;

pub struct ThreadCounter {
    index: Arc<dyn OrderedIndex>,
    keys: IndexKeys,
    guard: StoreGuard,
}

impl ThreadCounter {
    pub fn new(index: Arc<dyn OrderedIndex>, keys: IndexKeys, guard: StoreGuard) -> Self {
        Self { index, keys, guard }
    }

    #[instrument(skip(self, comment), fields(comment_id = comment.id, post_id = comment.post_id))]
    pub async fn on_comment_created(&self, comment: &Comment) -> Result<()> {
        let member = comment.id.to_string();
        let mut ops = vec![IndexOp::ZIncrBy {
            key: self.keys.post_comment_count(),
            member: comment.post_id.to_string(),
            delta: 1.0,
        }];
        match comment.root_id {
            None => {
                let seed = time_rank(comment.created_at);
                ops.extend([
                    IndexOp::ZAdd {
                        key: self.keys.reply_count(),
                        member: member.clone(),
                        score: 0.0,
                    },
                    IndexOp::ZAdd {
                        key: self.keys.comment_time(comment.post_id),
                        member: member.clone(),
                        score: seed,
                    },
                    IndexOp::ZAdd {
                        key: self.keys.comment_score(comment.post_id),
                        member,
                        score: seed,
                    },
                ]);
            }
            Some(root_id) => ops.push(IndexOp::ZIncrBy {
                key: self.keys.reply_count(),
                member: root_id.to_string(),
                delta: 1.0,
            }),
        }
        self.guard.once("count new comment", self.index.atomic(ops)).await
    }

    /// `reply_ids` are the replies removed along with a top-level comment; their
    /// vote-membership keys are cleared too. Ignored for a reply.
    #[instrument(skip(self, comment, reply_ids), fields(comment_id = comment.id, post_id = comment.post_id))]
    pub async fn on_comment_deleted(&self, comment: &Comment, reply_ids: &[i64]) -> Result<()> {
        let member = comment.id.to_string();
        let post = comment.post_id.to_string();
        let ops = match comment.root_id {
            None => {
                // The thread's size has to be known before its counter goes away.
                let reply_key = self.keys.reply_count();
                let replies = self
                    .guard
                    .retry("read reply count", || self.index.zscore(&reply_key, &member))
                    .await?
                    .unwrap_or_else(|| {
                        warn!("reply counter missing, assuming an empty thread");
                        0.0
                    });
                debug!(replies, "removing thread");

                let mut voted = vec![self.keys.voted(TargetKind::Comment, comment.id)];
                voted.extend(
                    reply_ids
                        .iter()
                        .map(|id| self.keys.voted(TargetKind::Comment, *id)),
                );
                vec![
                    IndexOp::ZRem {
                        key: self.keys.comment_time(comment.post_id),
                        members: vec![member.clone()],
                    },
                    IndexOp::ZRem {
                        key: self.keys.comment_score(comment.post_id),
                        members: vec![member.clone()],
                    },
                    IndexOp::ZRem {
                        key: reply_key,
                        members: vec![member],
                    },
                    IndexOp::Del { keys: voted },
                    IndexOp::ZIncrBy {
                        key: self.keys.post_comment_count(),
                        member: post,
                        delta: -(1.0 + replies),
                    },
                ]
            }
            Some(root_id) => vec![
                IndexOp::Del {
                    keys: vec![self.keys.voted(TargetKind::Comment, comment.id)],
                },
                IndexOp::ZIncrBy {
                    key: self.keys.post_comment_count(),
                    member: post,
                    delta: -1.0,
                },
                IndexOp::ZIncrBy {
                    key: self.keys.reply_count(),
                    member: root_id.to_string(),
                    delta: -1.0,
                },
            ],
        };
        self.guard.once("uncount comment", self.index.atomic(ops)).await
    }

    /// Overwrites a post's counters with recomputed values.
    pub async fn reset(&self, post_id: i64, total: u64, replies: &[(i64, u64)]) -> Result<()> {
        let mut ops = vec![IndexOp::ZAdd {
            key: self.keys.post_comment_count(),
            member: post_id.to_string(),
            score: total as f64,
        }];
        ops.extend(replies.iter().map(|(root_id, n)| IndexOp::ZAdd {
            key: self.keys.reply_count(),
            member: root_id.to_string(),
            score: *n as f64,
        }));
        // absolute values, so a replay after a timeout lands on the same state
        self.guard
            .retry("reset counters", || self.index.atomic(ops.clone()))
            .await
    }

    pub async fn comment_total(&self, post_id: i64) -> Result<i64> {
        self.read(&self.keys.post_comment_count(), post_id).await
    }

    pub async fn reply_total(&self, root_id: i64) -> Result<i64> {
        self.read(&self.keys.reply_count(), root_id).await
    }

    async fn read(&self, key: &str, id: i64) -> Result<i64> {
        let member = id.to_string();
        Ok(self
            .guard
            .retry("read counter", || self.index.zscore(key, &member))
            .await?
            .map(|v| v.round() as i64)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rf_index_memory::MemoryIndex;

    fn comment(id: i64, root_id: Option<i64>) -> Comment {
        Comment {
            id,
            post_id: 1,
            author_id: 9,
            content: "hi".into(),
            parent_id: root_id,
            root_id,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn thread_delete_subtracts_the_whole_thread() {
        let counter = ThreadCounter::new(
            Arc::new(MemoryIndex::new()),
            IndexKeys::default(),
            StoreGuard::default(),
        );
        let root = comment(10, None);
        counter.on_comment_created(&root).await.unwrap();
        counter.on_comment_created(&comment(20, None)).await.unwrap();
        for id in [11, 12, 13] {
            counter.on_comment_created(&comment(id, Some(10))).await.unwrap();
        }
        assert_eq!(counter.comment_total(1).await.unwrap(), 5);
        assert_eq!(counter.reply_total(10).await.unwrap(), 3);

        counter.on_comment_deleted(&comment(12, Some(10)), &[]).await.unwrap();
        assert_eq!(counter.comment_total(1).await.unwrap(), 4);
        assert_eq!(counter.reply_total(10).await.unwrap(), 2);

        counter.on_comment_deleted(&root, &[11, 13]).await.unwrap();
        assert_eq!(counter.comment_total(1).await.unwrap(), 1);
        assert_eq!(counter.reply_total(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reset_overwrites_drifted_values() {
        let index = Arc::new(MemoryIndex::new());
        let counter = ThreadCounter::new(index.clone(), IndexKeys::default(), StoreGuard::default());
        counter.on_comment_created(&comment(10, None)).await.unwrap();
        counter.on_comment_created(&comment(11, Some(10))).await.unwrap();

        counter.reset(1, 7, &[(10, 6)]).await.unwrap();
        assert_eq!(counter.comment_total(1).await.unwrap(), 7);
        assert_eq!(counter.reply_total(10).await.unwrap(), 6);
    }
}
