//! # Domain Models
//!
//! These structs represent the core entities of Rusty-Feed.
//! Entity ids are 63-bit snowflakes: globally unique and ordered by creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// A topic area that posts are published into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: i64,
    /// Unique display name
    pub name: String,
    pub introduction: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityBrief {
    pub id: i64,
    pub name: String,
}

impl From<&Community> for CommunityBrief {
    fn from(c: &Community) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
        }
    }
}

/// The public face of a user, as supplied by the auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBrief {
    pub id: i64,
    pub username: String,
    pub avatar: Option<String>,
}

/// A post belongs to exactly one community for its whole life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub author_id: i64,
    pub community_id: i64,
    pub content: String,
    /// Object-storage reference handled by the upload service
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied fields for a new post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPost {
    pub community_id: i64,
    pub content: String,
    pub image: Option<String>,
}

/// A comment on a post.
///
/// `parent_id` and `root_id` are both `None` for a top-level comment and both `Some` for a
/// reply. Every reply is indexed under its top-level `root_id`, however deep it sits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub post_id: i64,
    pub author_id: i64,
    pub content: String,
    pub parent_id: Option<i64>,
    pub root_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn is_top_level(&self) -> bool {
        self.root_id.is_none()
    }

    /// A reply whose parent is some other reply rather than the root.
    pub fn is_deep_reply(&self) -> bool {
        matches!((self.parent_id, self.root_id), (Some(p), Some(r)) if p != r)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewComment {
    pub post_id: i64,
    pub content: String,
    pub parent_id: Option<i64>,
    pub root_id: Option<i64>,
}

impl NewComment {
    pub fn validate(&self) -> Result<(), FeedError> {
        match (self.parent_id, self.root_id) {
            (None, None) | (Some(_), Some(_)) => Ok(()),
            _ => Err(FeedError::Validation(
                "parent_id and root_id must both be set or both be empty".into(),
            )),
        }
    }
}

/// What a vote is cast on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Post,
    Comment,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Post => "post",
            TargetKind::Comment => "comment",
        }
    }
}

/// Up, down, or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum VoteDirection {
    Down,
    #[default]
    Cancel,
    Up,
}

impl VoteDirection {
    pub fn value(self) -> i8 {
        match self {
            VoteDirection::Down => -1,
            VoteDirection::Cancel => 0,
            VoteDirection::Up => 1,
        }
    }

    /// Maps a stored index score back to a direction; unknown values read as cancelled.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.5 {
            VoteDirection::Up
        } else if score <= -0.5 {
            VoteDirection::Down
        } else {
            VoteDirection::Cancel
        }
    }
}

impl TryFrom<i8> for VoteDirection {
    type Error = FeedError;

    fn try_from(v: i8) -> Result<Self, Self::Error> {
        match v {
            -1 => Ok(VoteDirection::Down),
            0 => Ok(VoteDirection::Cancel),
            1 => Ok(VoteDirection::Up),
            other => Err(FeedError::Validation(format!(
                "vote direction must be -1, 0 or 1, got {other}"
            ))),
        }
    }
}

impl From<VoteDirection> for i8 {
    fn from(d: VoteDirection) -> i8 {
        d.value()
    }
}

/// At most one live vote per (voter, kind, target). `Cancel` is stored as absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: i64,
    pub kind: TargetKind,
    pub target_id: i64,
    pub direction: VoteDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Time,
    Score,
}

/// Which posts a feed is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedScope {
    All,
    Community(i64),
}

/// A post hydrated for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostView {
    pub id: i64,
    pub content: String,
    pub image: Option<String>,
    pub author: UserBrief,
    pub community: CommunityBrief,
    pub like_count: u64,
    /// Whether the viewer has an up-vote on this post
    pub liked: bool,
    pub comment_count: i64,
    pub created_at: DateTime<Utc>,
}

/// A comment hydrated for display.
///
/// Top-level comments carry `replies_count`; deeper replies carry the `parent` author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentView {
    pub id: i64,
    pub content: String,
    pub author: UserBrief,
    pub like_count: u64,
    pub liked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<UserBrief>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// One page of results plus the size of the whole ranked collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn empty(total: u64) -> Self {
        Self {
            items: Vec::new(),
            total,
        }
    }
}
