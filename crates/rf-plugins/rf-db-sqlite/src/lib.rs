//! # rf-db-sqlite Implementation
//!
//! This module implements the data mapping between the SQLite relational model
//! and the `rf-core` domain models. It is the source of truth every index value is
//! rebuilt from.

use std::collections::HashMap;

use async_trait::async_trait;
use rf_core::models::{Comment, Community, Post, TargetKind, UserBrief, Vote, VoteDirection};
use rf_core::traits::DurableStore;
use rf_core::{FeedError, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("schema.sql");

const POST_COLUMNS: &str = "id, author_id, community_id, content, image, created_at";
const COMMENT_COLUMNS: &str = "id, post_id, author_id, content, parent_id, root_id, created_at";

pub struct SqliteFeedStore {
    pool: SqlitePool,
}

/// Unique-key violations are conflicts; everything else is treated as transient.
fn db_err(e: sqlx::Error) -> FeedError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => FeedError::Conflict(db.to_string()),
        _ => FeedError::StoreUnavailable(format!("sqlite: {e}")),
    }
}

fn as_limit(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn community_from_row(row: &SqliteRow) -> sqlx::Result<Community> {
    Ok(Community {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        introduction: row.try_get("introduction")?,
        created_at: row.try_get("created_at")?,
    })
}

fn post_from_row(row: &SqliteRow) -> sqlx::Result<Post> {
    Ok(Post {
        id: row.try_get("id")?,
        author_id: row.try_get("author_id")?,
        community_id: row.try_get("community_id")?,
        content: row.try_get("content")?,
        image: row.try_get("image")?,
        created_at: row.try_get("created_at")?,
    })
}

fn comment_from_row(row: &SqliteRow) -> sqlx::Result<Comment> {
    Ok(Comment {
        id: row.try_get("id")?,
        post_id: row.try_get("post_id")?,
        author_id: row.try_get("author_id")?,
        content: row.try_get("content")?,
        parent_id: row.try_get("parent_id")?,
        root_id: row.try_get("root_id")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Restores the caller's id order after an `IN (...)` query.
fn in_order<T>(ids: &[i64], rows: Vec<T>, id_of: impl Fn(&T) -> i64) -> Vec<T> {
    let mut by_id: HashMap<i64, T> = rows.into_iter().map(|r| (id_of(&r), r)).collect();
    ids.iter().filter_map(|id| by_id.remove(id)).collect()
}

impl SqliteFeedStore {
    /// Connects and applies the embedded schema. `sqlite::memory:` gets a single pinned
    /// connection so every query sees the same database.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections)
        };
        let pool = options.connect(url).await.map_err(db_err)?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await.map_err(db_err)?;
        info!(max_connections, "sqlite store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl DurableStore for SqliteFeedStore {
    async fn insert_community(&self, community: &Community) -> Result<()> {
        sqlx::query("INSERT INTO communities (id, name, introduction, created_at) VALUES (?, ?, ?, ?)")
            .bind(community.id)
            .bind(&community.name)
            .bind(&community.introduction)
            .bind(community.created_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_community(&self, id: i64) -> Result<Option<Community>> {
        let row = sqlx::query("SELECT id, name, introduction, created_at FROM communities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(community_from_row).transpose().map_err(db_err)
    }

    async fn list_communities(&self) -> Result<Vec<Community>> {
        let rows = sqlx::query("SELECT id, name, introduction, created_at FROM communities ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(community_from_row)
            .collect::<sqlx::Result<_>>()
            .map_err(db_err)
    }

    async fn upsert_user(&self, user: &UserBrief) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, avatar) VALUES (?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET username = excluded.username, avatar = excluded.avatar",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.avatar)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_user_brief(&self, id: i64) -> Result<Option<UserBrief>> {
        let row = sqlx::query("SELECT id, username, avatar FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|row| -> sqlx::Result<UserBrief> {
            Ok(UserBrief {
                id: row.try_get("id")?,
                username: row.try_get("username")?,
                avatar: row.try_get("avatar")?,
            })
        })
        .transpose()
        .map_err(db_err)
    }

    async fn insert_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            "INSERT INTO posts (id, author_id, community_id, content, image, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(post.id)
        .bind(post.author_id)
        .bind(post.community_id)
        .bind(&post.content)
        .bind(&post.image)
        .bind(post.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_post(&self, id: i64) -> Result<Option<Post>> {
        let row = sqlx::query(&format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(post_from_row).transpose().map_err(db_err)
    }

    async fn get_posts_by_ids(&self, ids: &[i64]) -> Result<Vec<Post>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        let posts = rows
            .iter()
            .map(post_from_row)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(in_order(ids, posts, |p| p.id))
    }

    async fn list_posts_by_author(
        &self,
        author_id: i64,
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<Post>, u64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts WHERE author_id = ?")
            .bind(author_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let rows = sqlx::query(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE author_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(author_id)
        .bind(as_limit(limit))
        .bind(as_limit(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let posts = rows
            .iter()
            .map(post_from_row)
            .collect::<sqlx::Result<_>>()
            .map_err(db_err)?;
        Ok((posts, total as u64))
    }

    /// Removes the post, its comments and every vote on any of them in one transaction.
    async fn delete_post(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // 1. Votes on the post's comments, then on the post
        sqlx::query(
            "DELETE FROM votes WHERE kind = 'comment' \
             AND target_id IN (SELECT id FROM comments WHERE post_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("DELETE FROM votes WHERE kind = 'post' AND target_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        // 2. Comments
        let comments = sqlx::query("DELETE FROM comments WHERE post_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        // 3. The post itself
        let removed = sqlx::query("DELETE FROM posts WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?
            .rows_affected();

        tx.commit().await.map_err(db_err)?;
        debug!(post_id = id, comments, "post removed");
        Ok(removed > 0)
    }

    async fn insert_comment(&self, comment: &Comment) -> Result<()> {
        sqlx::query(
            "INSERT INTO comments (id, post_id, author_id, content, parent_id, root_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(comment.id)
        .bind(comment.post_id)
        .bind(comment.author_id)
        .bind(&comment.content)
        .bind(comment.parent_id)
        .bind(comment.root_id)
        .bind(comment.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_comment(&self, id: i64) -> Result<Option<Comment>> {
        let row = sqlx::query(&format!("SELECT {COMMENT_COLUMNS} FROM comments WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(comment_from_row).transpose().map_err(db_err)
    }

    async fn get_comments_by_ids(&self, ids: &[i64]) -> Result<Vec<Comment>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {COMMENT_COLUMNS} FROM comments WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        let comments = rows
            .iter()
            .map(comment_from_row)
            .collect::<sqlx::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(in_order(ids, comments, |c| c.id))
    }

    async fn list_replies(
        &self,
        root_id: i64,
        limit: u64,
        offset: u64,
    ) -> Result<(Vec<Comment>, u64)> {
        let total = self.count_replies(root_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {COMMENT_COLUMNS} FROM comments WHERE root_id = ? \
             ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?"
        ))
        .bind(root_id)
        .bind(as_limit(limit))
        .bind(as_limit(offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        let replies = rows
            .iter()
            .map(comment_from_row)
            .collect::<sqlx::Result<_>>()
            .map_err(db_err)?;
        Ok((replies, total))
    }

    async fn list_top_level_ids(&self, post_id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT id FROM comments WHERE post_id = ? AND root_id IS NULL ORDER BY id")
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn list_comment_ids(&self, post_id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT id FROM comments WHERE post_id = ? ORDER BY id")
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn list_reply_ids(&self, root_id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT id FROM comments WHERE root_id = ? ORDER BY id")
            .bind(root_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn count_comments(&self, post_id: i64) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments WHERE post_id = ?")
            .bind(post_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(n as u64)
    }

    async fn count_replies(&self, root_id: i64) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM comments WHERE root_id = ?")
            .bind(root_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(n as u64)
    }

    /// A top-level comment takes its whole thread with it; a reply goes alone.
    async fn delete_comment(&self, id: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let root_id: Option<Option<i64>> =
            sqlx::query_scalar("SELECT root_id FROM comments WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        let removed = match root_id {
            None => 0,
            Some(None) => {
                sqlx::query(
                    "DELETE FROM votes WHERE kind = 'comment' \
                     AND target_id IN (SELECT id FROM comments WHERE id = ? OR root_id = ?)",
                )
                .bind(id)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                sqlx::query("DELETE FROM comments WHERE id = ? OR root_id = ?")
                    .bind(id)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .rows_affected()
            }
            Some(Some(_)) => {
                sqlx::query("DELETE FROM votes WHERE kind = 'comment' AND target_id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
                sqlx::query("DELETE FROM comments WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .rows_affected()
            }
        };

        tx.commit().await.map_err(db_err)?;
        Ok(removed)
    }

    async fn upsert_vote(&self, vote: &Vote) -> Result<()> {
        if vote.direction == VoteDirection::Cancel {
            sqlx::query("DELETE FROM votes WHERE voter_id = ? AND kind = ? AND target_id = ?")
                .bind(vote.voter_id)
                .bind(vote.kind.as_str())
                .bind(vote.target_id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO votes (voter_id, kind, target_id, direction) VALUES (?, ?, ?, ?) \
             ON CONFLICT (voter_id, kind, target_id) DO UPDATE SET direction = excluded.direction",
        )
        .bind(vote.voter_id)
        .bind(vote.kind.as_str())
        .bind(vote.target_id)
        .bind(i32::from(vote.direction.value()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_vote(&self, voter_id: i64, kind: TargetKind, target_id: i64) -> Result<VoteDirection> {
        let direction: Option<i64> = sqlx::query_scalar(
            "SELECT direction FROM votes WHERE voter_id = ? AND kind = ? AND target_id = ?",
        )
        .bind(voter_id)
        .bind(kind.as_str())
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match direction {
            None => Ok(VoteDirection::Cancel),
            Some(d) => i8::try_from(d)
                .map_err(|_| FeedError::Validation(format!("stored direction {d} out of range")))
                .and_then(VoteDirection::try_from),
        }
    }

    async fn sum_votes(&self, kind: TargetKind, target_id: i64) -> Result<i64> {
        let sum: Option<i64> =
            sqlx::query_scalar("SELECT SUM(direction) FROM votes WHERE kind = ? AND target_id = ?")
                .bind(kind.as_str())
                .bind(target_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(sum.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    async fn store() -> SqliteFeedStore {
        SqliteFeedStore::new("sqlite::memory:", 1).await.unwrap()
    }

    fn post(id: i64, author_id: i64) -> Post {
        Post {
            id,
            author_id,
            community_id: 1,
            content: format!("post {id}"),
            image: None,
            created_at: Utc::now() + Duration::seconds(id),
        }
    }

    fn comment(id: i64, post_id: i64, root_id: Option<i64>) -> Comment {
        Comment {
            id,
            post_id,
            author_id: 5,
            content: "reply".into(),
            parent_id: root_id,
            root_id,
            created_at: Utc::now() + Duration::seconds(id),
        }
    }

    #[tokio::test]
    async fn test_duplicate_community_name_conflicts() {
        let repo = store().await;
        let mut community = Community {
            id: 1,
            name: "rust".into(),
            introduction: "crabs".into(),
            created_at: Utc::now(),
        };
        repo.insert_community(&community).await.expect("first insert");
        community.id = 2;
        let err = repo.insert_community(&community).await.unwrap_err();
        assert!(matches!(err, FeedError::Conflict(_)));
        assert_eq!(repo.list_communities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replayed_post_id_conflicts() {
        let repo = store().await;
        repo.insert_post(&post(1, 1)).await.unwrap();
        let err = repo.insert_post(&post(1, 1)).await.unwrap_err();
        assert!(matches!(err, FeedError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_batch_lookup_keeps_caller_order() {
        let repo = store().await;
        for id in 1..=3 {
            repo.insert_post(&post(id, 1)).await.unwrap();
        }
        let ids: Vec<i64> = repo
            .get_posts_by_ids(&[3, 9, 1, 2])
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);

        let (page, total) = repo.list_posts_by_author(1, 2, 0).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.iter().map(|p| p.id).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_thread_delete_cascades() {
        let repo = store().await;
        repo.insert_post(&post(1, 1)).await.unwrap();
        repo.insert_comment(&comment(10, 1, None)).await.unwrap();
        repo.insert_comment(&comment(11, 1, Some(10))).await.unwrap();
        repo.insert_comment(&comment(12, 1, Some(10))).await.unwrap();
        repo.insert_comment(&comment(20, 1, None)).await.unwrap();
        repo.upsert_vote(&Vote {
            voter_id: 7,
            kind: TargetKind::Comment,
            target_id: 11,
            direction: VoteDirection::Up,
        })
        .await
        .unwrap();

        assert_eq!(repo.count_replies(10).await.unwrap(), 2);
        assert_eq!(repo.delete_comment(12).await.unwrap(), 1);
        assert_eq!(repo.delete_comment(10).await.unwrap(), 2);
        assert_eq!(repo.count_comments(1).await.unwrap(), 1);
        assert_eq!(
            repo.get_vote(7, TargetKind::Comment, 11).await.unwrap(),
            VoteDirection::Cancel
        );
        assert_eq!(repo.delete_comment(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_vote_upsert_and_cancel() {
        let repo = store().await;
        let mut vote = Vote {
            voter_id: 7,
            kind: TargetKind::Post,
            target_id: 1,
            direction: VoteDirection::Up,
        };
        repo.upsert_vote(&vote).await.unwrap();
        vote.direction = VoteDirection::Down;
        repo.upsert_vote(&vote).await.unwrap();
        repo.upsert_vote(&Vote { voter_id: 8, ..vote.clone() }).await.unwrap();
        assert_eq!(repo.sum_votes(TargetKind::Post, 1).await.unwrap(), -2);

        vote.direction = VoteDirection::Cancel;
        repo.upsert_vote(&vote).await.unwrap();
        assert_eq!(repo.get_vote(7, TargetKind::Post, 1).await.unwrap(), VoteDirection::Cancel);
        assert_eq!(repo.sum_votes(TargetKind::Post, 1).await.unwrap(), -1);
        assert_eq!(repo.sum_votes(TargetKind::Comment, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_post_delete_removes_everything() {
        let repo = store().await;
        repo.insert_post(&post(1, 1)).await.unwrap();
        repo.insert_comment(&comment(10, 1, None)).await.unwrap();
        repo.insert_comment(&comment(11, 1, Some(10))).await.unwrap();
        assert_eq!(repo.list_comment_ids(1).await.unwrap(), vec![10, 11]);

        assert!(repo.delete_post(1).await.unwrap());
        assert!(repo.get_post(1).await.unwrap().is_none());
        assert_eq!(repo.count_comments(1).await.unwrap(), 0);
        assert!(!repo.delete_post(1).await.unwrap());
    }
}
