//! Error kinds surfaced by the service for bad input, missing entities and ownership.

use integration_tests::Harness;
use rf_core::{FeedError, FeedScope, NewComment, NewPost, SortOrder, TargetKind};
use tokio_test::assert_ok;

fn comment(post_id: i64, parent_id: Option<i64>, root_id: Option<i64>) -> NewComment {
    NewComment {
        post_id,
        content: "words".into(),
        parent_id,
        root_id,
    }
}

#[tokio::test]
async fn missing_entities_are_not_found() {
    let h = Harness::new().await;

    let err = h.service.get_community(404).await.unwrap_err();
    assert!(matches!(err, FeedError::NotFound { .. }));

    let err = h
        .service
        .create_post_sync(
            1,
            NewPost {
                community_id: 404,
                content: "nowhere".into(),
                image: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::NotFound { .. }));

    let err = h.service.create_comment(1, comment(404, None, None)).await.unwrap_err();
    assert!(matches!(err, FeedError::NotFound { .. }));

    let err = h.service.vote(1, 404, TargetKind::Comment, 1).await.unwrap_err();
    assert!(matches!(err, FeedError::NotFound { .. }));

    let err = h.service.delete_post(404, 1).await.unwrap_err();
    assert!(matches!(err, FeedError::NotFound { .. }));
    assert!(err.is_client_error());
}

#[tokio::test]
async fn only_the_author_may_delete() {
    let h = Harness::new().await;
    let c = h.community("rust").await;
    let p = h.post(1, c.id).await;
    let cm = h.top_comment(2, p.id).await;

    let err = h.service.delete_post(p.id, 2).await.unwrap_err();
    assert!(matches!(err, FeedError::PermissionDenied(_)));
    let err = h.service.delete_comment(cm, 1).await.unwrap_err();
    assert!(matches!(err, FeedError::PermissionDenied(_)));

    // nothing was removed
    let thread = h
        .service
        .list_thread(p.id, SortOrder::Time, 1, 10, None)
        .await
        .unwrap();
    assert_eq!(thread.total, 1);

    assert_ok!(h.service.delete_comment(cm, 2).await);
    assert_ok!(h.service.delete_post(p.id, 1).await);
}

#[tokio::test]
async fn duplicate_community_name_conflicts() {
    let h = Harness::new().await;
    h.community("rust").await;
    let err = h.service.create_community("rust", "again").await.unwrap_err();
    assert!(matches!(err, FeedError::Conflict(_)));
    assert_eq!(h.service.list_communities().await.unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_requests_are_validation_errors() {
    let h = Harness::new().await;
    let c = h.community("rust").await;
    let p = h.post(1, c.id).await;
    let root = h.top_comment(2, p.id).await;
    let reply = h.reply(3, p.id, root, root).await;

    let err = h.service.create_community("   ", "").await.unwrap_err();
    assert!(matches!(err, FeedError::Validation(_)));

    let err = h.service.vote(1, p.id, TargetKind::Post, 2).await.unwrap_err();
    assert!(matches!(err, FeedError::Validation(_)));

    let err = h
        .service
        .create_post_sync(
            1,
            NewPost {
                community_id: c.id,
                content: " ".into(),
                image: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Validation(_)));

    // half-set ancestry
    let err = h
        .service
        .create_comment(4, comment(p.id, Some(root), None))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Validation(_)));

    // a reply cannot act as a thread root
    let err = h
        .service
        .create_comment(4, comment(p.id, Some(reply), Some(reply)))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Validation(_)));

    let err = h
        .service
        .list_feed(FeedScope::All, SortOrder::Score, 0, 10, None)
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Validation(_)));
}

#[tokio::test]
async fn root_from_another_post_is_rejected() {
    let h = Harness::new().await;
    let c = h.community("rust").await;
    let first = h.post(1, c.id).await;
    let second = h.post(1, c.id).await;
    let root = h.top_comment(2, first.id).await;

    let err = h
        .service
        .create_comment(3, comment(second.id, Some(root), Some(root)))
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Validation(_)));
}
