//! Shared fixtures: a full engine over `sqlite::memory:`, the in-memory index and the
//! local broker, with a hand-driven clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rf_broker_local::LocalBroker;
use rf_core::{Clock, Community, DurableStore, NewComment, NewPost, PostView, UserBrief};
use rf_db_sqlite::SqliteFeedStore;
use rf_engine::{EngineConfig, FeedService};
use rf_index_memory::MemoryIndex;

/// Clock that only moves when told to.
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Mutex::new(at))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.0.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub struct Harness {
    pub service: Arc<FeedService>,
    pub durable: Arc<SqliteFeedStore>,
    pub index: Arc<MemoryIndex>,
    pub broker: Arc<LocalBroker>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(EngineConfig::default(), 1000).await
    }

    pub async fn with(config: EngineConfig, queue_capacity: usize) -> Self {
        let durable = Arc::new(SqliteFeedStore::new("sqlite::memory:", 1).await.unwrap());
        let index = Arc::new(MemoryIndex::new());
        let broker = Arc::new(LocalBroker::new(queue_capacity));
        let clock = Arc::new(ManualClock::new(t0()));
        let service = FeedService::new(
            config,
            durable.clone(),
            index.clone(),
            broker.clone(),
            clock.clone(),
        )
        .unwrap();
        Self {
            service: Arc::new(service),
            durable,
            index,
            broker,
            clock,
        }
    }

    pub async fn user(&self, id: i64, name: &str) {
        self.durable
            .upsert_user(&UserBrief {
                id,
                username: name.into(),
                avatar: None,
            })
            .await
            .unwrap();
    }

    pub async fn community(&self, name: &str) -> Community {
        self.service.create_community(name, "").await.unwrap()
    }

    /// Creates a post and moves the clock one second forward.
    pub async fn post(&self, author_id: i64, community_id: i64) -> PostView {
        let view = self
            .service
            .create_post_sync(
                author_id,
                NewPost {
                    community_id,
                    content: "hello".into(),
                    image: None,
                },
            )
            .await
            .unwrap();
        self.clock.advance(Duration::seconds(1));
        view
    }

    pub async fn top_comment(&self, author_id: i64, post_id: i64) -> i64 {
        self.comment(author_id, post_id, None, None).await
    }

    pub async fn reply(&self, author_id: i64, post_id: i64, parent_id: i64, root_id: i64) -> i64 {
        self.comment(author_id, post_id, Some(parent_id), Some(root_id))
            .await
    }

    async fn comment(
        &self,
        author_id: i64,
        post_id: i64,
        parent_id: Option<i64>,
        root_id: Option<i64>,
    ) -> i64 {
        let view = self
            .service
            .create_comment(
                author_id,
                NewComment {
                    post_id,
                    content: "a comment".into(),
                    parent_id,
                    root_id,
                },
            )
            .await
            .unwrap();
        self.clock.advance(Duration::seconds(1));
        view.id
    }
}
