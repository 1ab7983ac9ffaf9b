//! # FeedError
//!
//! Centralized error handling for the Rusty-Feed engine.
//! Every port and engine operation reports one of these kinds; callers match on the
//! variant, never on the rendered message.

use thiserror::Error;

/// The primary error type for all rf-core operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// Target entity absent (e.g., Post, Comment, Community)
    #[error("{entity} not found with ID {id}")]
    NotFound { entity: &'static str, id: String },

    /// Caller is not the owner of the resource
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Resource already exists (e.g., duplicate community name, replayed post id)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed request (e.g., direction out of range, inconsistent parent/root pair)
    #[error("validation error: {0}")]
    Validation(String),

    /// Transient I/O failure against the durable store, the index, or the broker
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Derived counters or ranks may be stale after a partial failure
    #[error("index drift: {0}")]
    IndexDrift(String),

    /// The async ingestion queue dropped an event
    #[error("queue saturated: {0}")]
    QueueSaturated(String),
}

impl FeedError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        FeedError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Only transient store failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::StoreUnavailable(_))
    }

    /// Kinds that map to a 4xx-style rejection.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            FeedError::NotFound { .. }
                | FeedError::PermissionDenied(_)
                | FeedError::Conflict(_)
                | FeedError::Validation(_)
        )
    }
}

/// A specialized Result type for Rusty-Feed logic.
pub type Result<T> = std::result::Result<T, FeedError>;
