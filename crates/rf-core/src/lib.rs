//! rusty-feed/crates/rf-core/src/lib.rs
//!
//! The central domain models, port definitions and error taxonomy for Rusty-Feed.

pub mod error;
pub mod event;
pub mod models;
pub mod traits;

// Re-exporting for easier access in other crates
pub use error::*;
pub use event::*;
pub use models::*;
pub use traits::*;

#[cfg(test)]
mod tests {
    use super::models::*;
    use super::FeedError;

    #[test]
    fn test_comment_depth() {
        let mut comment = Comment {
            id: 10,
            post_id: 1,
            author_id: 5,
            content: "first!".to_string(),
            parent_id: None,
            root_id: None,
            created_at: chrono::Utc::now(),
        };
        assert!(comment.is_top_level());
        assert!(!comment.is_deep_reply());

        comment.parent_id = Some(3);
        comment.root_id = Some(3);
        assert!(!comment.is_top_level());
        assert!(!comment.is_deep_reply());

        comment.parent_id = Some(4);
        assert!(comment.is_deep_reply());
    }

    #[test]
    fn test_half_set_parent_is_rejected() {
        let req = NewComment {
            post_id: 1,
            content: "orphan".to_string(),
            parent_id: Some(2),
            root_id: None,
        };
        assert!(matches!(req.validate(), Err(FeedError::Validation(_))));
    }

    #[test]
    fn test_direction_range() {
        assert_eq!(VoteDirection::try_from(-1).unwrap(), VoteDirection::Down);
        assert!(VoteDirection::try_from(2).is_err());
        let parsed: Result<VoteDirection, _> = serde_json::from_str("3");
        assert!(parsed.is_err());
        assert_eq!(VoteDirection::from_score(1.0), VoteDirection::Up);
        assert_eq!(VoteDirection::from_score(0.0), VoteDirection::Cancel);
    }

    #[test]
    fn test_error_kinds() {
        assert!(FeedError::StoreUnavailable("redis down".into()).is_retryable());
        assert!(!FeedError::not_found("post", 9).is_retryable());
        assert!(FeedError::Conflict("dup".into()).is_client_error());
        assert!(!FeedError::IndexDrift("counter".into()).is_client_error());
    }
}
