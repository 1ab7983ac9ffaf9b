//! The async creation path: optimistic ids, drop-on-full, consumer persistence and indexing.

use std::collections::HashSet;
use std::time::Duration;

use integration_tests::Harness;
use rf_core::{
    DurableStore, FeedError, FeedScope, MessageBroker, NewPost, OrderedIndex, SortOrder,
    TargetKind, WireFormat,
};
use rf_engine::ranking::time_rank;
use rf_engine::{EngineConfig, IngestState};
use tokio::sync::watch;

fn new_post(community_id: i64, n: usize) -> NewPost {
    NewPost {
        community_id,
        content: format!("async post {n}"),
        image: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn saturation_drops_without_failing_callers() {
    let h = Harness::with(EngineConfig::default(), 100).await;
    let community_id = h.community("busy").await.id;

    let tasks: Vec<_> = (0..1000)
        .map(|n| {
            let service = h.service.clone();
            tokio::spawn(async move { service.create_post_async(1, new_post(community_id, n)).unwrap() })
        })
        .collect();
    let mut ids = HashSet::new();
    let mut queued = 0;
    for t in tasks {
        let submission = t.await.unwrap();
        ids.insert(submission.post.id);
        if submission.state == IngestState::Queued {
            queued += 1;
        }
    }

    assert_eq!(ids.len(), 1000);
    assert_eq!(queued, 100);
    let metrics = h.service.metrics();
    assert_eq!(metrics.posts_queued.get(), 100);
    assert_eq!(metrics.posts_dropped.get(), 900);
}

async fn drain(h: &Harness) {
    let (_stop, stop_rx) = watch::channel(false);
    let consumer = h.service.ingest_consumer();
    h.broker.close();
    tokio::time::timeout(Duration::from_secs(5), consumer.run(stop_rx))
        .await
        .expect("consumer drained")
        .unwrap();
}

#[tokio::test]
async fn consumer_persists_then_indexes() {
    let h = Harness::new().await;
    h.user(1, "ana").await;
    let c = h.community("rust").await;

    let submissions: Vec<_> = (0..3)
        .map(|n| h.service.create_post_async(1, new_post(c.id, n)).unwrap())
        .collect();
    drain(&h).await;

    for s in &submissions {
        let stored = h.durable.get_post(s.post.id).await.unwrap().unwrap();
        assert_eq!(stored, s.post);
    }
    let feed = h
        .service
        .list_feed(FeedScope::Community(c.id), SortOrder::Time, 1, 10, None)
        .await
        .unwrap();
    assert_eq!(feed.total, 3);
    assert_eq!(h.service.metrics().posts_indexed.get(), 3);
    assert_eq!(h.broker.in_flight(), 0);
}

#[tokio::test]
async fn json_wire_format_works_end_to_end() {
    let config = EngineConfig {
        wire_format: WireFormat::Json,
        ..EngineConfig::default()
    };
    let h = Harness::with(config, 10).await;
    let c = h.community("rust").await;
    let s = h.service.create_post_async(
        1,
        NewPost {
            community_id: c.id,
            content: "with picture".into(),
            image: Some("bucket/cat.png".into()),
        },
    )
    .unwrap();
    drain(&h).await;

    let stored = h.durable.get_post(s.post.id).await.unwrap().unwrap();
    assert_eq!(stored.image.as_deref(), Some("bucket/cat.png"));
}

#[tokio::test]
async fn redelivery_is_idempotent() {
    let h = Harness::new().await;
    let c = h.community("rust").await;
    let s = h.service.create_post_async(1, new_post(c.id, 0)).unwrap();

    let consumer = h.service.ingest_consumer();
    let delivery = h.broker.poll().await.unwrap().unwrap();
    assert_eq!(consumer.handle(&delivery).await, Some(IngestState::Indexed));

    // the same payload arriving again after a lost ack
    h.broker
        .try_publish(&delivery.key, delivery.payload.clone())
        .unwrap();
    let again = h.broker.poll().await.unwrap().unwrap();
    assert_eq!(consumer.handle(&again).await, Some(IngestState::Indexed));

    assert_eq!(h.durable.list_posts_by_author(1, 10, 0).await.unwrap().1, 1);
    assert_eq!(h.service.metrics().posts_persisted.get(), 1);
    assert!(h.durable.get_post(s.post.id).await.unwrap().is_some());
    // the seed is added once
    assert_eq!(
        h.index.zscore("feed:post:score", &s.post.id.to_string()).await.unwrap(),
        Some(time_rank(s.post.created_at))
    );
}

#[tokio::test]
async fn vote_between_persist_and_index_survives() {
    let h = Harness::new().await;
    let c = h.community("rust").await;
    let s = h.service.create_post_async(1, new_post(c.id, 0)).unwrap();

    // durable, not yet ranked: the client already holds the id
    h.durable.insert_post(&s.post).await.unwrap();
    let vote = h.service.vote(7, s.post.id, TargetKind::Post, 1).await.unwrap();
    assert_eq!(vote.score_delta, 432.0);

    drain(&h).await;

    assert_eq!(
        h.index.zscore("feed:post:score", &s.post.id.to_string()).await.unwrap(),
        Some(432.0 + time_rank(s.post.created_at))
    );
    let again = h.service.vote(7, s.post.id, TargetKind::Post, 1).await.unwrap();
    assert!(again.is_noop());
}

#[tokio::test]
async fn empty_async_content_is_rejected_before_publishing() {
    let h = Harness::new().await;
    let c = h.community("rust").await;
    let err = h
        .service
        .create_post_async(
            1,
            NewPost {
                community_id: c.id,
                content: "  ".into(),
                image: None,
            },
        )
        .unwrap_err();
    assert!(matches!(err, FeedError::Validation(_)));
    assert_eq!(h.service.metrics().posts_queued.get(), 0);
    assert_eq!(h.service.metrics().posts_dropped.get(), 0);
}

#[tokio::test]
async fn unknown_community_never_lands() {
    let h = Harness::new().await;
    let s = h.service.create_post_async(1, new_post(424242, 0)).unwrap();
    assert_eq!(s.state, IngestState::Queued);
    drain(&h).await;
    assert!(h.durable.get_post(s.post.id).await.unwrap().is_none());
}
