//! # Async Ingestion Pipeline
//!
//! `Submitted -> Queued -> Persisted -> Indexed`, or `Queued -> Dropped` on saturation.
//!
//! The publisher assigns the id locally and never blocks: a full queue drops the event and
//! the caller keeps its optimistic response. The consumer persists with the pre-assigned id
//! (a replay that hits the existing row counts as persisted), then indexes. An indexing
//! failure leaves the post durable but unranked until it is reindexed.

use std::sync::Arc;
use std::time::Duration;

use rf_core::{
    Clock, Delivery, DurableStore, FeedError, MessageBroker, NewPost, Post, PostCreationEvent,
    Result, WireFormat,
};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::guard::StoreGuard;
use crate::ids::IdGenerator;
use crate::metrics::EngineMetrics;
use crate::ranking::RankingIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Submitted,
    Queued,
    Persisted,
    Indexed,
    Dropped,
}

/// Optimistic response to an async create.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub post: Post,
    /// `Queued` or `Dropped`
    pub state: IngestState,
}

pub struct IngestPublisher {
    broker: Arc<dyn MessageBroker>,
    ids: Arc<IdGenerator>,
    clock: Arc<dyn Clock>,
    format: WireFormat,
    metrics: EngineMetrics,
}

impl IngestPublisher {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        ids: Arc<IdGenerator>,
        clock: Arc<dyn Clock>,
        format: WireFormat,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            broker,
            ids,
            clock,
            format,
            metrics,
        }
    }

    /// Never fails: saturation and encoding problems are logged and the post is dropped.
    #[instrument(skip(self, new_post), fields(community_id = new_post.community_id))]
    pub fn submit(&self, author_id: i64, new_post: NewPost) -> Submission {
        let post = Post {
            id: self.ids.next_id(),
            author_id,
            community_id: new_post.community_id,
            content: new_post.content,
            image: new_post.image,
            created_at: self.clock.now(),
        };
        let event = PostCreationEvent::for_post(Uuid::new_v4(), &post);
        let published = self
            .format
            .encode(&event)
            .and_then(|payload| self.broker.try_publish(&post.id.to_string(), payload));

        let state = match published {
            Ok(()) => {
                self.metrics.posts_queued.inc();
                debug!(post_id = post.id, message_id = %event.message_id, "post queued");
                IngestState::Queued
            }
            Err(e @ FeedError::QueueSaturated(_)) => {
                self.metrics.posts_dropped.inc();
                warn!(post_id = post.id, author_id, error = %e, "post dropped");
                IngestState::Dropped
            }
            Err(e) => {
                self.metrics.posts_dropped.inc();
                error!(post_id = post.id, author_id, error = %e, "post could not be published");
                IngestState::Dropped
            }
        };
        Submission { post, state }
    }
}

/// What the consumer should tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack(IngestState),
    /// Undecodable or unroutable; acked so it is never redelivered
    Reject,
    Retry,
}

pub struct IngestConsumer {
    broker: Arc<dyn MessageBroker>,
    durable: Arc<dyn DurableStore>,
    ranking: Arc<RankingIndex>,
    guard: StoreGuard,
    format: WireFormat,
    backoff: Duration,
    metrics: EngineMetrics,
}

impl IngestConsumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        durable: Arc<dyn DurableStore>,
        ranking: Arc<RankingIndex>,
        guard: StoreGuard,
        format: WireFormat,
        backoff: Duration,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            broker,
            durable,
            ranking,
            guard,
            format,
            backoff,
            metrics,
        }
    }

    /// Consumes until the broker is drained and closed, or `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("ingestion consumer started");
        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => {
                    info!("ingestion consumer stopping");
                    return Ok(());
                }
                next = self.broker.poll() => next,
            };
            match next {
                Ok(Some(delivery)) => {
                    self.handle(&delivery).await;
                }
                Ok(None) => {
                    info!("broker closed, ingestion consumer done");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "poll failed");
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }

    /// Processes one delivery and settles it with the broker.
    #[instrument(skip(self, delivery), fields(offset = delivery.offset, key = %delivery.key, attempt = delivery.attempt))]
    pub async fn handle(&self, delivery: &Delivery) -> Option<IngestState> {
        let disposition = self.process(delivery).await;
        let settled = match disposition {
            Disposition::Ack(_) | Disposition::Reject => self.broker.ack(delivery.offset).await,
            Disposition::Retry => {
                let nacked = self.broker.nack(delivery.offset).await;
                tokio::time::sleep(self.backoff).await;
                nacked
            }
        };
        if let Err(e) = settled {
            warn!(error = %e, "could not settle delivery");
        }
        match disposition {
            Disposition::Ack(state) => Some(state),
            _ => None,
        }
    }

    async fn process(&self, delivery: &Delivery) -> Disposition {
        // 1. Decode; a poison message is dropped for good
        let post = match self
            .format
            .decode(&delivery.payload)
            .and_then(|event| event.to_post())
        {
            Ok(post) => post,
            Err(e) => {
                error!(error = %e, "undecodable post event discarded");
                return Disposition::Reject;
            }
        };

        // 2. The community has to exist
        match self
            .guard
            .retry("check community", || self.durable.get_community(post.community_id))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(post_id = post.id, community_id = post.community_id, "unknown community, post dropped");
                return Disposition::Reject;
            }
            Err(e) => {
                warn!(post_id = post.id, error = %e, "community check failed, will retry");
                return Disposition::Retry;
            }
        }

        // 3. Persist with the pre-assigned id
        match self
            .guard
            .retry("persist post", || self.durable.insert_post(&post))
            .await
        {
            Ok(()) => {
                self.metrics.posts_persisted.inc();
            }
            Err(FeedError::Conflict(_)) => {
                debug!(post_id = post.id, "post already persisted, redelivery");
            }
            Err(e) if e.is_retryable() => {
                warn!(post_id = post.id, error = %e, "persist failed, will retry");
                return Disposition::Retry;
            }
            Err(e) => {
                error!(post_id = post.id, error = %e, "persist rejected, post dropped");
                return Disposition::Reject;
            }
        }

        // 4. Index; failure leaves the post durable and unranked
        match self.ranking.on_post_created(&post).await {
            Ok(()) => {
                self.metrics.posts_indexed.inc();
                info!(post_id = post.id, "post ingested");
                Disposition::Ack(IngestState::Indexed)
            }
            Err(e) => {
                self.metrics.record_drift("index ingested post", post.id, &e);
                Disposition::Ack(IngestState::Persisted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use rf_core::{Community, MockDurableStore, MockMessageBroker, SystemClock};
    use rf_index_memory::MemoryIndex;

    use crate::keys::IndexKeys;

    fn fast_guard() -> StoreGuard {
        StoreGuard::new(Duration::from_secs(1), 0, Duration::from_millis(1))
    }

    fn community() -> Community {
        Community {
            id: 3,
            name: "gardening".into(),
            introduction: String::new(),
            created_at: Utc::now(),
        }
    }

    fn delivery_for(post: &Post) -> Delivery {
        let event = PostCreationEvent::for_post(Uuid::new_v4(), post);
        Delivery {
            offset: 1,
            key: post.id.to_string(),
            payload: WireFormat::Protobuf.encode(&event).unwrap(),
            attempt: 1,
        }
    }

    fn sample_post() -> Post {
        Post {
            id: 99,
            author_id: 4,
            community_id: 3,
            content: "seedlings".into(),
            image: None,
            created_at: Utc::now(),
        }
    }

    fn consumer(broker: MockMessageBroker, durable: MockDurableStore) -> (IngestConsumer, EngineMetrics) {
        let metrics = EngineMetrics::default();
        let ranking = RankingIndex::new(
            Arc::new(MemoryIndex::new()),
            IndexKeys::default(),
            fast_guard(),
            Duration::from_secs(60),
        );
        let consumer = IngestConsumer::new(
            Arc::new(broker),
            Arc::new(durable),
            Arc::new(ranking),
            fast_guard(),
            WireFormat::Protobuf,
            Duration::from_millis(1),
            metrics.clone(),
        );
        (consumer, metrics)
    }

    #[tokio::test]
    async fn poison_message_is_acked_not_retried() {
        let mut broker = MockMessageBroker::new();
        broker.expect_ack().times(1).returning(|_| Ok(()));
        broker.expect_nack().never();
        let (consumer, _) = consumer(broker, MockDurableStore::new());

        let delivery = Delivery {
            offset: 1,
            key: "1".into(),
            payload: Bytes::from_static(&[0xff, 0xff, 0xff]),
            attempt: 1,
        };
        assert_eq!(consumer.handle(&delivery).await, None);
    }

    #[tokio::test]
    async fn redelivered_post_is_treated_as_persisted() {
        let mut broker = MockMessageBroker::new();
        broker.expect_ack().times(1).returning(|_| Ok(()));
        let mut durable = MockDurableStore::new();
        durable.expect_get_community().returning(|_| Ok(Some(community())));
        durable
            .expect_insert_post()
            .returning(|_| Err(FeedError::Conflict("post 99 exists".into())));
        let (consumer, metrics) = consumer(broker, durable);

        let state = consumer.handle(&delivery_for(&sample_post())).await;
        assert_eq!(state, Some(IngestState::Indexed));
        assert_eq!(metrics.posts_persisted.get(), 0);
        assert_eq!(metrics.posts_indexed.get(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_nacks_for_redelivery() {
        let mut broker = MockMessageBroker::new();
        broker.expect_nack().times(1).returning(|_| Ok(()));
        broker.expect_ack().never();
        let mut durable = MockDurableStore::new();
        durable.expect_get_community().returning(|_| Ok(Some(community())));
        durable
            .expect_insert_post()
            .returning(|_| Err(FeedError::StoreUnavailable("locked".into())));
        let (consumer, _) = consumer(broker, durable);

        assert_eq!(consumer.handle(&delivery_for(&sample_post())).await, None);
    }

    #[tokio::test]
    async fn unknown_community_is_dropped() {
        let mut broker = MockMessageBroker::new();
        broker.expect_ack().times(1).returning(|_| Ok(()));
        let mut durable = MockDurableStore::new();
        durable.expect_get_community().returning(|_| Ok(None));
        durable.expect_insert_post().never();
        let (consumer, _) = consumer(broker, durable);

        assert_eq!(consumer.handle(&delivery_for(&sample_post())).await, None);
    }

    #[test]
    fn saturated_publish_still_returns_an_id() {
        let mut broker = MockMessageBroker::new();
        broker
            .expect_try_publish()
            .returning(|_, _| Err(FeedError::QueueSaturated("full".into())));
        let metrics = EngineMetrics::default();
        let publisher = IngestPublisher::new(
            Arc::new(broker),
            Arc::new(IdGenerator::from_epoch_date("2024-01-01", 1).unwrap()),
            Arc::new(SystemClock),
            WireFormat::Json,
            metrics.clone(),
        );

        let submission = publisher.submit(
            4,
            NewPost {
                community_id: 3,
                content: "hello".into(),
                image: None,
            },
        );
        assert!(submission.post.id > 0);
        assert_eq!(submission.state, IngestState::Dropped);
        assert_eq!(metrics.posts_dropped.get(), 1);
    }
}
