//! # FeedService
//!
//! The operations collaborators call. Every write goes to the durable store first; derived
//! index updates that fail afterwards are recorded as drift instead of failing the call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rf_core::{
    Clock, Comment, CommentView, Community, DurableStore, FeedError, FeedScope, MessageBroker,
    NewComment, NewPost, OrderedIndex, Page, Post, PostView, Result, SortOrder, TargetKind,
    UserBrief, VoteDirection,
};
use tracing::{info, instrument};

use crate::counter::ThreadCounter;
use crate::guard::StoreGuard;
use crate::ids::IdGenerator;
use crate::ingest::{IngestConsumer, IngestPublisher, Submission};
use crate::keys::IndexKeys;
use crate::metrics::EngineMetrics;
use crate::pagination::PaginationEngine;
use crate::ranking::RankingIndex;
use crate::reconcile::Reconciler;
use crate::vote::{VoteAggregator, VoteOutcome, VoteTarget};
use crate::EngineConfig;

pub struct FeedService {
    durable: Arc<dyn DurableStore>,
    broker: Arc<dyn MessageBroker>,
    clock: Arc<dyn Clock>,
    ids: Arc<IdGenerator>,
    ranking: Arc<RankingIndex>,
    counter: Arc<ThreadCounter>,
    votes: VoteAggregator,
    pages: PaginationEngine,
    publisher: IngestPublisher,
    guard: StoreGuard,
    metrics: EngineMetrics,
    config: EngineConfig,
}

impl FeedService {
    pub fn new(
        config: EngineConfig,
        durable: Arc<dyn DurableStore>,
        index: Arc<dyn OrderedIndex>,
        broker: Arc<dyn MessageBroker>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let keys = IndexKeys::new(config.key_prefix.clone());
        let guard = config.guard.clone();
        let metrics = EngineMetrics::default();
        let ids = Arc::new(IdGenerator::new(config.id_epoch, config.machine_id)?);

        let ranking = Arc::new(RankingIndex::new(
            index.clone(),
            keys.clone(),
            guard.clone(),
            config.intersection_ttl,
        ));
        let counter = Arc::new(ThreadCounter::new(index.clone(), keys.clone(), guard.clone()));
        let votes = VoteAggregator::new(
            durable.clone(),
            index.clone(),
            keys.clone(),
            config.vote.clone(),
            clock.clone(),
            guard.clone(),
            metrics.clone(),
        );
        let pages = PaginationEngine::new(
            durable.clone(),
            index,
            ranking.clone(),
            keys,
            guard.clone(),
            config.max_page_size,
        );
        let publisher = IngestPublisher::new(
            broker.clone(),
            ids.clone(),
            clock.clone(),
            config.wire_format,
            metrics.clone(),
        );

        Ok(Self {
            durable,
            broker,
            clock,
            ids,
            ranking,
            counter,
            votes,
            pages,
            publisher,
            guard,
            metrics,
            config,
        })
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// A consumer for the async creation path, sharing this service's stores and metrics.
    pub fn ingest_consumer(&self) -> IngestConsumer {
        IngestConsumer::new(
            self.broker.clone(),
            self.durable.clone(),
            self.ranking.clone(),
            self.guard.clone(),
            self.config.wire_format,
            self.config.redelivery_backoff,
            self.metrics.clone(),
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.durable.clone(),
            self.ranking.clone(),
            self.counter.clone(),
            self.config.vote.clone(),
            self.guard.clone(),
        )
    }

    // ── Communities ─────────────────────────────────────────

    #[instrument(skip(self, introduction))]
    pub async fn create_community(&self, name: &str, introduction: &str) -> Result<Community> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FeedError::Validation("community name is empty".into()));
        }
        let community = Community {
            id: self.ids.next_id(),
            name: name.to_string(),
            introduction: introduction.to_string(),
            created_at: self.clock.now(),
        };
        self.guard
            .once("insert community", self.durable.insert_community(&community))
            .await?;
        info!(community_id = community.id, "community created");
        Ok(community)
    }

    pub async fn get_community(&self, id: i64) -> Result<Community> {
        self.guard
            .retry("load community", || self.durable.get_community(id))
            .await?
            .ok_or_else(|| FeedError::not_found("community", id))
    }

    pub async fn list_communities(&self) -> Result<Vec<Community>> {
        self.guard
            .retry("list communities", || self.durable.list_communities())
            .await
    }

    // ── Posts ───────────────────────────────────────────────

    /// Persists and ranks the post before returning it.
    #[instrument(skip(self, new_post), fields(community_id = new_post.community_id))]
    pub async fn create_post_sync(&self, author_id: i64, new_post: NewPost) -> Result<PostView> {
        validate_content(&new_post.content)?;
        let community = self.get_community(new_post.community_id).await?;
        let post = Post {
            id: self.ids.next_id(),
            author_id,
            community_id: community.id,
            content: new_post.content,
            image: new_post.image,
            created_at: self.clock.now(),
        };

        // 1. Primary write
        self.guard
            .once("insert post", self.durable.insert_post(&post))
            .await?;

        // 2. Rank entries
        if let Err(e) = self.ranking.on_post_created(&post).await {
            self.metrics.record_drift("rank new post", post.id, &e);
        }

        info!(post_id = post.id, "post created");
        let author = self.user_brief(author_id).await;
        Ok(PostView {
            id: post.id,
            content: post.content,
            image: post.image,
            author,
            community: (&community).into(),
            like_count: 0,
            liked: false,
            comment_count: 0,
            created_at: post.created_at,
        })
    }

    /// Returns the provisional post at once; persistence and ranking happen in the consumer.
    /// Content is validated up front. A saturated queue drops the post without telling the
    /// caller.
    pub fn create_post_async(&self, author_id: i64, new_post: NewPost) -> Result<Submission> {
        validate_content(&new_post.content)?;
        Ok(self.publisher.submit(author_id, new_post))
    }

    #[instrument(skip(self))]
    pub async fn delete_post(&self, post_id: i64, caller_id: i64) -> Result<()> {
        let post = self.load_post(post_id).await?;
        if post.author_id != caller_id {
            return Err(FeedError::PermissionDenied(format!(
                "user {caller_id} does not own post {post_id}"
            )));
        }

        // Comment ids have to be read before the rows go away.
        let comment_ids = self
            .guard
            .retry("list post comments", || self.durable.list_comment_ids(post_id))
            .await?;
        self.guard
            .retry("delete post", || self.durable.delete_post(post_id))
            .await?;

        if let Err(e) = self.ranking.on_post_deleted(&post, &comment_ids).await {
            self.metrics.record_drift("unrank deleted post", post_id, &e);
        }
        info!(comments = comment_ids.len(), "post deleted");
        Ok(())
    }

    // ── Comments ────────────────────────────────────────────

    #[instrument(skip(self, new_comment), fields(post_id = new_comment.post_id))]
    pub async fn create_comment(&self, author_id: i64, new_comment: NewComment) -> Result<CommentView> {
        new_comment.validate()?;
        validate_content(&new_comment.content)?;
        self.load_post(new_comment.post_id).await?;

        let mut parent_author = None;
        if let (Some(parent_id), Some(root_id)) = (new_comment.parent_id, new_comment.root_id) {
            let root = self.load_comment(root_id).await?;
            if !root.is_top_level() || root.post_id != new_comment.post_id {
                return Err(FeedError::Validation(format!(
                    "comment {root_id} is not a top-level comment of post {}",
                    new_comment.post_id
                )));
            }
            if parent_id != root_id {
                let parent = self.load_comment(parent_id).await?;
                if parent.root_id != Some(root_id) {
                    return Err(FeedError::Validation(format!(
                        "comment {parent_id} is not in the thread of {root_id}"
                    )));
                }
                parent_author = Some(self.user_brief(parent.author_id).await);
            }
        }

        let comment = Comment {
            id: self.ids.next_id(),
            post_id: new_comment.post_id,
            author_id,
            content: new_comment.content,
            parent_id: new_comment.parent_id,
            root_id: new_comment.root_id,
            created_at: self.clock.now(),
        };
        self.guard
            .once("insert comment", self.durable.insert_comment(&comment))
            .await?;

        if let Err(e) = self.counter.on_comment_created(&comment).await {
            self.metrics.record_drift("count new comment", comment.post_id, &e);
        }

        info!(comment_id = comment.id, "comment created");
        Ok(CommentView {
            id: comment.id,
            content: comment.content,
            author: self.user_brief(author_id).await,
            like_count: 0,
            liked: false,
            replies_count: comment.root_id.is_none().then_some(0),
            parent: parent_author,
            root_id: comment.root_id,
            parent_id: comment.parent_id,
            created_at: comment.created_at,
        })
    }

    #[instrument(skip(self))]
    pub async fn delete_comment(&self, comment_id: i64, caller_id: i64) -> Result<()> {
        let comment = self.load_comment(comment_id).await?;
        if comment.author_id != caller_id {
            return Err(FeedError::PermissionDenied(format!(
                "user {caller_id} does not own comment {comment_id}"
            )));
        }

        let reply_ids = if comment.is_top_level() {
            self.guard
                .retry("list thread replies", || self.durable.list_reply_ids(comment_id))
                .await?
        } else {
            Vec::new()
        };
        let removed = self
            .guard
            .retry("delete comment", || self.durable.delete_comment(comment_id))
            .await?;

        if let Err(e) = self.counter.on_comment_deleted(&comment, &reply_ids).await {
            self.metrics.record_drift("uncount deleted comment", comment.post_id, &e);
        }
        info!(removed, "comment deleted");
        Ok(())
    }

    // ── Votes ───────────────────────────────────────────────

    /// `direction` is -1, 0 or 1.
    #[instrument(skip(self))]
    pub async fn vote(
        &self,
        voter_id: i64,
        target_id: i64,
        kind: TargetKind,
        direction: i8,
    ) -> Result<VoteOutcome> {
        let direction = VoteDirection::try_from(direction)?;
        let (target, created_at) = self.resolve_target(kind, target_id).await?;
        self.votes
            .apply_vote(voter_id, target, direction, created_at)
            .await
    }

    /// The age used for weighting: the post's, or the top-level ancestor's for a comment.
    async fn resolve_target(&self, kind: TargetKind, target_id: i64) -> Result<(VoteTarget, DateTime<Utc>)> {
        match kind {
            TargetKind::Post => {
                let post = self.load_post(target_id).await?;
                Ok((VoteTarget::Post { post_id: post.id }, post.created_at))
            }
            TargetKind::Comment => {
                let comment = self.load_comment(target_id).await?;
                let created_at = match comment.root_id {
                    None => comment.created_at,
                    Some(root_id) => self.load_comment(root_id).await?.created_at,
                };
                Ok((
                    VoteTarget::Comment {
                        comment_id: comment.id,
                        post_id: comment.post_id,
                        top_level: comment.is_top_level(),
                    },
                    created_at,
                ))
            }
        }
    }

    // ── Reads ───────────────────────────────────────────────

    pub async fn list_feed(
        &self,
        scope: FeedScope,
        order: SortOrder,
        page: u64,
        size: u64,
        viewer_id: Option<i64>,
    ) -> Result<Page<PostView>> {
        self.pages.feed_page(scope, order, page, size, viewer_id).await
    }

    pub async fn list_thread(
        &self,
        post_id: i64,
        order: SortOrder,
        page: u64,
        size: u64,
        viewer_id: Option<i64>,
    ) -> Result<Page<CommentView>> {
        self.pages.thread_page(post_id, order, page, size, viewer_id).await
    }

    pub async fn list_replies(
        &self,
        root_id: i64,
        page: u64,
        size: u64,
        viewer_id: Option<i64>,
    ) -> Result<Page<CommentView>> {
        self.pages.replies_page(root_id, page, size, viewer_id).await
    }

    pub async fn list_user_posts(
        &self,
        author_id: i64,
        page: u64,
        size: u64,
        viewer_id: Option<i64>,
    ) -> Result<Page<PostView>> {
        self.pages.author_page(author_id, page, size, viewer_id).await
    }

    pub async fn list_user_liked_posts(
        &self,
        user_id: i64,
        page: u64,
        size: u64,
        viewer_id: Option<i64>,
    ) -> Result<Page<PostView>> {
        self.pages.liked_page(user_id, page, size, viewer_id).await
    }

    // ── Helpers ─────────────────────────────────────────────

    async fn load_post(&self, id: i64) -> Result<Post> {
        self.guard
            .retry("load post", || self.durable.get_post(id))
            .await?
            .ok_or_else(|| FeedError::not_found("post", id))
    }

    async fn load_comment(&self, id: i64) -> Result<Comment> {
        self.guard
            .retry("load comment", || self.durable.get_comment(id))
            .await?
            .ok_or_else(|| FeedError::not_found("comment", id))
    }

    /// Falls back to a bare id when the user record is unavailable.
    async fn user_brief(&self, user_id: i64) -> UserBrief {
        match self.durable.get_user_brief(user_id).await {
            Ok(Some(brief)) => brief,
            _ => UserBrief {
                id: user_id,
                username: String::new(),
                avatar: None,
            },
        }
    }
}

fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(FeedError::Validation("content is empty".into()));
    }
    Ok(())
}
