//! # Pagination Engine
//!
//! Turns `(order, page, size)` into a rank-range query, then hydrates the id page from the
//! durable store and re-reads live like/comment counts from the index.
//!
//! Enrichment is best-effort per record: a record whose author or community cannot be
//! resolved is skipped and logged, the rest of the page is still served.

use std::collections::HashMap;
use std::sync::Arc;

use rf_core::{
    Comment, CommentView, CommunityBrief, DurableStore, FeedError, FeedScope, OrderedIndex, Page,
    Post, PostView, Result, SortOrder, TargetKind, UserBrief,
};
use tracing::{error, instrument, warn};

use crate::guard::StoreGuard;
use crate::keys::IndexKeys;
use crate::ranking::RankingIndex;

/// A validated 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u64,
    pub size: u64,
}

impl PageRequest {
    pub fn new(page: u64, size: u64, max_size: u64) -> Result<Self> {
        if page < 1 {
            return Err(FeedError::Validation(format!("page must be >= 1, got {page}")));
        }
        if size < 1 || size > max_size {
            return Err(FeedError::Validation(format!(
                "page size must be within 1..={max_size}, got {size}"
            )));
        }
        Ok(Self { page, size })
    }

    /// Inclusive rank range `[(p-1)*s, p*s - 1]`.
    pub fn rank_range(&self) -> (u64, u64) {
        let start = self.offset();
        (start, start.saturating_add(self.size - 1))
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.size)
    }
}

/// Per-page cache of user lookups; `None` records a failed lookup.
type Authors = HashMap<i64, Option<UserBrief>>;

pub struct PaginationEngine {
    durable: Arc<dyn DurableStore>,
    index: Arc<dyn OrderedIndex>,
    ranking: Arc<RankingIndex>,
    keys: IndexKeys,
    guard: StoreGuard,
    max_page_size: u64,
}

impl PaginationEngine {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        index: Arc<dyn OrderedIndex>,
        ranking: Arc<RankingIndex>,
        keys: IndexKeys,
        guard: StoreGuard,
        max_page_size: u64,
    ) -> Self {
        Self {
            durable,
            index,
            ranking,
            keys,
            guard,
            max_page_size,
        }
    }

    pub fn request(&self, page: u64, size: u64) -> Result<PageRequest> {
        PageRequest::new(page, size, self.max_page_size)
    }

    #[instrument(skip(self))]
    pub async fn feed_page(
        &self,
        scope: FeedScope,
        order: SortOrder,
        page: u64,
        size: u64,
        viewer_id: Option<i64>,
    ) -> Result<Page<PostView>> {
        let req = self.request(page, size)?;
        let (ids, total) = self.ranking.query_rank_page(scope, order, req).await?;
        self.post_page(&ids, total, viewer_id).await
    }

    #[instrument(skip(self))]
    pub async fn liked_page(
        &self,
        user_id: i64,
        page: u64,
        size: u64,
        viewer_id: Option<i64>,
    ) -> Result<Page<PostView>> {
        let req = self.request(page, size)?;
        let (ids, total) = self.ranking.query_liked_page(user_id, req).await?;
        self.post_page(&ids, total, viewer_id).await
    }

    /// A user's own posts straight from the durable store, newest first.
    #[instrument(skip(self))]
    pub async fn author_page(
        &self,
        author_id: i64,
        page: u64,
        size: u64,
        viewer_id: Option<i64>,
    ) -> Result<Page<PostView>> {
        let req = self.request(page, size)?;
        let (posts, total) = self
            .guard
            .retry("list author posts", || {
                self.durable.list_posts_by_author(author_id, req.size, req.offset())
            })
            .await?;
        Ok(Page {
            items: self.hydrate_posts(posts, viewer_id).await,
            total,
        })
    }

    /// Top-level comments of a post.
    #[instrument(skip(self))]
    pub async fn thread_page(
        &self,
        post_id: i64,
        order: SortOrder,
        page: u64,
        size: u64,
        viewer_id: Option<i64>,
    ) -> Result<Page<CommentView>> {
        let req = self.request(page, size)?;
        let (ids, total) = self.ranking.query_comment_page(post_id, order, req).await?;
        if ids.is_empty() {
            return Ok(Page::empty(total));
        }
        let comments = self
            .guard
            .retry("load comments", || self.durable.get_comments_by_ids(&ids))
            .await?;
        Ok(Page {
            items: self.hydrate_comments(comments, viewer_id).await,
            total,
        })
    }

    /// Replies under a top-level comment, oldest first.
    #[instrument(skip(self))]
    pub async fn replies_page(
        &self,
        root_id: i64,
        page: u64,
        size: u64,
        viewer_id: Option<i64>,
    ) -> Result<Page<CommentView>> {
        let req = self.request(page, size)?;
        let (replies, total) = self
            .guard
            .retry("list replies", || {
                self.durable.list_replies(root_id, req.size, req.offset())
            })
            .await?;
        Ok(Page {
            items: self.hydrate_comments(replies, viewer_id).await,
            total,
        })
    }

    async fn post_page(&self, ids: &[i64], total: u64, viewer_id: Option<i64>) -> Result<Page<PostView>> {
        if ids.is_empty() {
            return Ok(Page::empty(total));
        }
        let posts = self
            .guard
            .retry("load posts", || self.durable.get_posts_by_ids(ids))
            .await?;
        Ok(Page {
            items: self.hydrate_posts(posts, viewer_id).await,
            total,
        })
    }

    /// Builds post views in input order, skipping records that cannot be enriched.
    pub async fn hydrate_posts(&self, posts: Vec<Post>, viewer_id: Option<i64>) -> Vec<PostView> {
        let ids: Vec<i64> = posts.iter().map(|p| p.id).collect();
        let likes = self.like_counts(TargetKind::Post, &ids).await;
        let comments = self.comment_counts(&ids).await;

        let mut authors = Authors::new();
        let mut communities: HashMap<i64, Option<CommunityBrief>> = HashMap::new();
        let mut views = Vec::with_capacity(posts.len());
        for (i, post) in posts.into_iter().enumerate() {
            let Some(author) = self.author(&mut authors, post.author_id).await else {
                continue;
            };
            if !communities.contains_key(&post.community_id) {
                let brief = match self.durable.get_community(post.community_id).await {
                    Ok(Some(c)) => Some(CommunityBrief::from(&c)),
                    Ok(None) => {
                        warn!(post_id = post.id, community_id = post.community_id, "community missing, post skipped");
                        None
                    }
                    Err(e) => {
                        error!(post_id = post.id, error = %e, "community lookup failed, post skipped");
                        None
                    }
                };
                communities.insert(post.community_id, brief);
            }
            let Some(Some(community)) = communities.get(&post.community_id).cloned() else {
                continue;
            };
            let Some(liked) = self.liked(TargetKind::Post, post.id, viewer_id).await else {
                continue;
            };
            views.push(PostView {
                id: post.id,
                content: post.content,
                image: post.image,
                author,
                community,
                like_count: likes.get(i).copied().unwrap_or_default(),
                liked,
                comment_count: comments.get(i).copied().unwrap_or_default(),
                created_at: post.created_at,
            });
        }
        views
    }

    /// Builds comment views in input order. Top-level comments get their reply count;
    /// deeper replies get their parent's author.
    pub async fn hydrate_comments(&self, comments: Vec<Comment>, viewer_id: Option<i64>) -> Vec<CommentView> {
        let ids: Vec<i64> = comments.iter().map(|c| c.id).collect();
        let likes = self.like_counts(TargetKind::Comment, &ids).await;
        let top_level: Vec<String> = comments
            .iter()
            .filter(|c| c.is_top_level())
            .map(|c| c.id.to_string())
            .collect();
        let reply_counts: HashMap<String, i64> = self
            .scores(&self.keys.reply_count(), &top_level)
            .await
            .into_iter()
            .zip(top_level.iter().cloned())
            .map(|(n, id)| (id, n))
            .collect();

        let mut authors = Authors::new();
        let mut views = Vec::with_capacity(comments.len());
        for (i, comment) in comments.into_iter().enumerate() {
            let Some(author) = self.author(&mut authors, comment.author_id).await else {
                continue;
            };
            let parent = match comment.parent_id.filter(|_| comment.is_deep_reply()) {
                Some(parent_id) => match self.parent_author(&mut authors, parent_id).await {
                    Some(brief) => Some(brief),
                    None => {
                        warn!(comment_id = comment.id, parent_id, "parent author unresolved, reply skipped");
                        continue;
                    }
                },
                None => None,
            };
            let Some(liked) = self.liked(TargetKind::Comment, comment.id, viewer_id).await else {
                continue;
            };
            let replies_count = comment
                .is_top_level()
                .then(|| reply_counts.get(&comment.id.to_string()).copied().unwrap_or_default());
            views.push(CommentView {
                id: comment.id,
                content: comment.content,
                author,
                like_count: likes.get(i).copied().unwrap_or_default(),
                liked,
                replies_count,
                parent,
                root_id: comment.root_id,
                parent_id: comment.parent_id,
                created_at: comment.created_at,
            });
        }
        views
    }

    /// Number of live up-votes per target, zero when the index cannot answer.
    async fn like_counts(&self, kind: TargetKind, ids: &[i64]) -> Vec<u64> {
        if ids.is_empty() {
            return Vec::new();
        }
        let keys: Vec<String> = ids.iter().map(|id| self.keys.voted(kind, *id)).collect();
        match self
            .guard
            .retry("count likes", || self.index.zcount_each(&keys, 1.0, 1.0))
            .await
        {
            Ok(counts) => counts,
            Err(e) => {
                warn!(error = %e, "like counts unavailable, serving zeros");
                vec![0; ids.len()]
            }
        }
    }

    async fn comment_counts(&self, post_ids: &[i64]) -> Vec<i64> {
        let members: Vec<String> = post_ids.iter().map(i64::to_string).collect();
        self.scores(&self.keys.post_comment_count(), &members).await
    }

    async fn scores(&self, key: &str, members: &[String]) -> Vec<i64> {
        if members.is_empty() {
            return Vec::new();
        }
        match self
            .guard
            .retry("read counters", || self.index.zscores(key, members))
            .await
        {
            Ok(scores) => scores
                .into_iter()
                .map(|s| s.map(|v| v.round() as i64).unwrap_or_default())
                .collect(),
            Err(e) => {
                warn!(key, error = %e, "counters unavailable, serving zeros");
                vec![0; members.len()]
            }
        }
    }

    /// `Some(false)` for anonymous viewers; `None` when the lookup failed.
    async fn liked(&self, kind: TargetKind, target_id: i64, viewer_id: Option<i64>) -> Option<bool> {
        let Some(viewer_id) = viewer_id else {
            return Some(false);
        };
        let key = self.keys.user_liked(kind, viewer_id);
        let member = target_id.to_string();
        match self
            .guard
            .retry("check liked", || self.index.sismember(&key, &member))
            .await
        {
            Ok(liked) => Some(liked),
            Err(e) => {
                error!(target_id, viewer_id, error = %e, "liked lookup failed, record skipped");
                None
            }
        }
    }

    async fn author(&self, cache: &mut Authors, user_id: i64) -> Option<UserBrief> {
        if let Some(hit) = cache.get(&user_id) {
            return hit.clone();
        }
        let brief = match self
            .guard
            .retry("load author", || self.durable.get_user_brief(user_id))
            .await
        {
            Ok(Some(brief)) => Some(brief),
            Ok(None) => {
                warn!(user_id, "author missing, record skipped");
                None
            }
            Err(e) => {
                error!(user_id, error = %e, "author lookup failed, record skipped");
                None
            }
        };
        cache.insert(user_id, brief.clone());
        brief
    }

    async fn parent_author(&self, cache: &mut Authors, parent_id: i64) -> Option<UserBrief> {
        let parent = match self
            .guard
            .retry("load parent comment", || self.durable.get_comment(parent_id))
            .await
        {
            Ok(Some(parent)) => parent,
            Ok(None) => return None,
            Err(e) => {
                error!(parent_id, error = %e, "parent lookup failed");
                return None;
            }
        };
        self.author(cache, parent.author_id).await
    }
}
