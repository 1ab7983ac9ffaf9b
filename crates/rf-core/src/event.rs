//! # Post-creation event
//!
//! The message the async ingestion path hands to the broker. The binary encoding is protobuf
//! with fixed field tags; JSON carries the identical snake_case fields for deployments that
//! prefer a readable payload.

use bytes::Bytes;
use chrono::DateTime;
use prost::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FeedError, Result};
use crate::models::Post;

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
pub struct PostCreationEvent {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(int64, tag = "2")]
    pub user_id: i64,
    #[prost(string, tag = "3")]
    pub content: String,
    /// Empty when the post has no image
    #[prost(string, tag = "4")]
    pub image: String,
    #[prost(int64, tag = "5")]
    pub community_id: i64,
    /// Unix milliseconds, UTC
    #[prost(int64, tag = "6")]
    pub created_at: i64,
    #[prost(int64, tag = "7")]
    pub post_id: i64,
}

impl PostCreationEvent {
    pub fn for_post(message_id: Uuid, post: &Post) -> Self {
        Self {
            message_id: message_id.to_string(),
            user_id: post.author_id,
            content: post.content.clone(),
            image: post.image.clone().unwrap_or_default(),
            community_id: post.community_id,
            created_at: post.created_at.timestamp_millis(),
            post_id: post.id,
        }
    }

    /// Rebuilds the post with its pre-assigned id and creation time.
    pub fn to_post(&self) -> Result<Post> {
        let created_at = DateTime::from_timestamp_millis(self.created_at).ok_or_else(|| {
            FeedError::Validation(format!("created_at {} out of range", self.created_at))
        })?;
        Ok(Post {
            id: self.post_id,
            author_id: self.user_id,
            community_id: self.community_id,
            content: self.content.clone(),
            image: (!self.image.is_empty()).then(|| self.image.clone()),
            created_at,
        })
    }
}

/// Encoding used on the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Protobuf,
    Json,
}

impl WireFormat {
    pub fn encode(&self, event: &PostCreationEvent) -> Result<Bytes> {
        match self {
            WireFormat::Protobuf => Ok(Bytes::from(event.encode_to_vec())),
            WireFormat::Json => serde_json::to_vec(event)
                .map(Bytes::from)
                .map_err(|e| FeedError::Validation(format!("event encode: {e}"))),
        }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<PostCreationEvent> {
        match self {
            WireFormat::Protobuf => PostCreationEvent::decode(payload)
                .map_err(|e| FeedError::Validation(format!("event decode: {e}"))),
            WireFormat::Json => serde_json::from_slice(payload)
                .map_err(|e| FeedError::Validation(format!("event decode: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_post(image: Option<&str>) -> Post {
        Post {
            id: 7_301_234_567_890,
            author_id: 42,
            community_id: 3,
            content: "tomato blight again".into(),
            image: image.map(str::to_string),
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn protobuf_tags_are_fixed() {
        let event = PostCreationEvent {
            post_id: 1,
            ..Default::default()
        };
        // field 7, varint wire type, value 1
        assert_eq!(event.encode_to_vec(), vec![0x38, 0x01]);
    }

    #[test]
    fn json_uses_snake_case_fields() {
        let event = PostCreationEvent::for_post(Uuid::nil(), &sample_post(None));
        let bytes = WireFormat::Json.encode(&event).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        for field in [
            "message_id",
            "user_id",
            "content",
            "image",
            "community_id",
            "created_at",
            "post_id",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn empty_image_reads_back_as_none() {
        let post = sample_post(None);
        let event = PostCreationEvent::for_post(Uuid::new_v4(), &post);
        let decoded = WireFormat::Protobuf
            .decode(&WireFormat::Protobuf.encode(&event).unwrap())
            .unwrap();
        assert_eq!(decoded.to_post().unwrap(), post);
    }

    #[test]
    fn garbage_payload_is_a_validation_error() {
        let err = WireFormat::Json.decode(b"{not json").unwrap_err();
        assert!(matches!(err, FeedError::Validation(_)));
    }
}
