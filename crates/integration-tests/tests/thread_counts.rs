//! Comment counter conservation across creates and deletes.

use integration_tests::Harness;
use rf_core::{DurableStore, FeedScope, OrderedIndex, SortOrder, TargetKind};

async fn counter(h: &Harness, key: &str, id: i64) -> i64 {
    h.index
        .zscore(key, &id.to_string())
        .await
        .unwrap()
        .map(|v| v as i64)
        .unwrap_or_default()
}

async fn post_total(h: &Harness, post_id: i64) -> i64 {
    counter(h, "feed:post:comment_num", post_id).await
}

async fn replies(h: &Harness, root_id: i64) -> i64 {
    counter(h, "feed:comment:num", root_id).await
}

#[tokio::test]
async fn reply_and_thread_deletion_scenario() {
    let h = Harness::new().await;
    let c = h.community("gardening").await;
    let p = h.post(1, c.id).await;

    let root = h.top_comment(2, p.id).await;
    let mut reply_ids = Vec::new();
    for author in [3, 4, 5] {
        reply_ids.push(h.reply(author, p.id, root, root).await);
    }
    assert_eq!(post_total(&h, p.id).await, 4);
    assert_eq!(replies(&h, root).await, 3);

    // delete one reply: post -1, root -1
    h.service.delete_comment(reply_ids[1], 4).await.unwrap();
    assert_eq!(post_total(&h, p.id).await, 3);
    assert_eq!(replies(&h, root).await, 2);

    // delete the root: post -(1 + 2)
    h.service.delete_comment(root, 2).await.unwrap();
    assert_eq!(post_total(&h, p.id).await, 0);
    assert_eq!(h.index.zscore("feed:comment:num", &root.to_string()).await.unwrap(), None);
    assert_eq!(h.durable.count_comments(p.id).await.unwrap(), 0);
}

#[tokio::test]
async fn total_equals_threads_plus_replies() {
    let h = Harness::new().await;
    let c = h.community("gardening").await;
    let p = h.post(1, c.id).await;

    let a = h.top_comment(2, p.id).await;
    let b = h.top_comment(3, p.id).await;
    let a1 = h.reply(4, p.id, a, a).await;
    let _a2 = h.reply(5, p.id, a1, a).await; // deeper reply, still under root a
    let _b1 = h.reply(6, p.id, b, b).await;

    let tops = h.durable.list_top_level_ids(p.id).await.unwrap();
    let mut sum = tops.len() as i64;
    for t in &tops {
        sum += replies(&h, *t).await;
    }
    assert_eq!(post_total(&h, p.id).await, sum);
    assert_eq!(sum, 5);
    assert_eq!(replies(&h, a).await, 2);
}

#[tokio::test]
async fn deleting_a_post_clears_its_index_entries() {
    let h = Harness::new().await;
    let c = h.community("gardening").await;
    let p = h.post(1, c.id).await;
    let root = h.top_comment(2, p.id).await;
    let reply = h.reply(3, p.id, root, root).await;
    h.service.vote(9, root, TargetKind::Comment, 1).await.unwrap();
    h.service.vote(9, reply, TargetKind::Comment, 1).await.unwrap();
    h.service.vote(9, p.id, TargetKind::Post, 1).await.unwrap();

    h.service.delete_post(p.id, 1).await.unwrap();

    for key in [
        format!("feed:post:voted:{}", p.id),
        format!("feed:comment:time:{}", p.id),
        format!("feed:comment:score:{}", p.id),
        format!("feed:comment:voted:{root}"),
        format!("feed:comment:voted:{reply}"),
    ] {
        assert!(!h.index.exists(&key).await.unwrap(), "{key} survived");
    }
    assert_eq!(h.index.zscore("feed:post:comment_num", &p.id.to_string()).await.unwrap(), None);
    let feed = h
        .service
        .list_feed(FeedScope::All, SortOrder::Score, 1, 10, None)
        .await
        .unwrap();
    assert_eq!(feed.total, 0);
}

#[tokio::test]
async fn thread_view_reports_reply_counts() {
    let h = Harness::new().await;
    for (id, name) in [(1, "op"), (2, "first"), (3, "second"), (4, "third")] {
        h.user(id, name).await;
    }
    let c = h.community("gardening").await;
    let p = h.post(1, c.id).await;
    let root = h.top_comment(2, p.id).await;
    let r1 = h.reply(3, p.id, root, root).await;
    let deep = h.reply(4, p.id, r1, root).await;

    let thread = h
        .service
        .list_thread(p.id, SortOrder::Time, 1, 10, None)
        .await
        .unwrap();
    assert_eq!(thread.total, 1);
    assert_eq!(thread.items[0].replies_count, Some(2));

    let replies = h.service.list_replies(root, 1, 10, None).await.unwrap();
    assert_eq!(replies.total, 2);
    assert_eq!(replies.items.iter().map(|c| c.id).collect::<Vec<_>>(), vec![r1, deep]);
    assert_eq!(replies.items[0].parent, None);
    assert_eq!(
        replies.items[1].parent.as_ref().map(|u| u.username.as_str()),
        Some("second")
    );

    let feed = h
        .service
        .list_feed(FeedScope::All, SortOrder::Time, 1, 10, None)
        .await
        .unwrap();
    assert_eq!(feed.items[0].comment_count, 3);
}
