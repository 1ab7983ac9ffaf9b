//! # rf-config
//!
//! Layered settings for Rusty-Feed. Sources, lowest precedence first: built-in defaults,
//! `config/default.toml`, `config/{RF_ENV}.toml`, then `RF__SECTION__KEY` environment variables.
//! A `.env` file, if present, is loaded into the environment before anything else.

use std::time::Duration;

use config::{Config, Environment, File};
use rf_core::WireFormat;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexSettings {
    pub backend: IndexBackend,
    pub redis_url: Option<SecretString>,
    pub pool_size: usize,
    pub key_prefix: String,
    pub intersection_ttl_secs: u64,
}

impl IndexSettings {
    pub fn intersection_ttl(&self) -> Duration {
        Duration::from_secs(self.intersection_ttl_secs)
    }
}

/// Vote weighting knobs. The reduced weights differ for posts and comments on purpose.
#[derive(Debug, Clone, Deserialize)]
pub struct VoteSettings {
    pub score_per_vote: f64,
    pub grace_window_secs: u64,
    pub post_reduced_weight: f64,
    pub comment_reduced_weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSettings {
    pub queue_capacity: usize,
    pub wire_format: WireFormat,
    pub redelivery_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub op_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationSettings {
    pub max_page_size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub machine_id: u16,
    /// Snowflake epoch, `YYYY-MM-DD`
    pub id_epoch: String,
    pub database: DatabaseSettings,
    pub index: IndexSettings,
    pub vote: VoteSettings,
    pub ingest: IngestSettings,
    pub store: StoreSettings,
    pub pagination: PaginationSettings,
    pub log: LogSettings,
}

impl Settings {
    /// Loads from `./config` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        let env = std::env::var("RF_ENV").unwrap_or_else(|_| "development".into());
        let settings: Settings = Self::builder()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{env}")).required(false))
            .add_source(Environment::with_prefix("RF").prefix_separator("__").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        info!(env = %env, index = ?settings.index.backend, "settings loaded");
        Ok(settings)
    }

    /// Built-in defaults only; used by tests and as the base layer of [`Settings::load`].
    pub fn defaults() -> Result<Self, ConfigError> {
        let settings: Settings = Self::builder()?.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(Config::builder()
            .set_default("machine_id", 1)?
            .set_default("id_epoch", "2024-01-01")?
            .set_default("database.url", "sqlite://rusty_feed.db?mode=rwc")?
            .set_default("database.max_connections", 8)?
            .set_default("index.backend", "memory")?
            .set_default("index.pool_size", 16)?
            .set_default("index.key_prefix", "feed:")?
            .set_default("index.intersection_ttl_secs", 60)?
            .set_default("vote.score_per_vote", 432.0)?
            .set_default("vote.grace_window_secs", 7 * 24 * 3600)?
            .set_default("vote.post_reduced_weight", 0.8)?
            .set_default("vote.comment_reduced_weight", 0.5)?
            .set_default("ingest.queue_capacity", 1000)?
            .set_default("ingest.wire_format", "protobuf")?
            .set_default("ingest.redelivery_backoff_ms", 1000)?
            .set_default("store.op_timeout_ms", 2000)?
            .set_default("store.max_retries", 3)?
            .set_default("store.retry_base_ms", 50)?
            .set_default("pagination.max_page_size", 100)?
            .set_default("log.level", "info")?
            .set_default("log.format", "pretty")?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.machine_id > 1023 {
            return Err(ConfigError::Invalid {
                key: "machine_id",
                reason: format!("{} does not fit in 10 bits", self.machine_id),
            });
        }
        if self.index.backend == IndexBackend::Redis && self.index.redis_url.is_none() {
            return Err(ConfigError::Invalid {
                key: "index.redis_url",
                reason: "required when index.backend = \"redis\"".into(),
            });
        }
        if self.ingest.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "ingest.queue_capacity",
                reason: "must be at least 1".into(),
            });
        }
        for (key, w) in [
            ("vote.post_reduced_weight", self.vote.post_reduced_weight),
            ("vote.comment_reduced_weight", self.vote.comment_reduced_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{w} is not within 0..=1"),
                });
            }
        }
        if self.pagination.max_page_size == 0 {
            return Err(ConfigError::Invalid {
                key: "pagination.max_page_size",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let s = Settings::defaults().unwrap();
        assert_eq!(s.index.backend, IndexBackend::Memory);
        assert_eq!(s.vote.grace_window_secs, 604_800);
        assert_eq!(s.vote.post_reduced_weight, 0.8);
        assert_eq!(s.vote.comment_reduced_weight, 0.5);
        assert_eq!(s.ingest.wire_format, WireFormat::Protobuf);
        assert_eq!(s.index.intersection_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn redis_backend_requires_url() {
        let mut s = Settings::defaults().unwrap();
        s.index.backend = IndexBackend::Redis;
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Invalid { key: "index.redis_url", .. })
        ));
    }

    #[test]
    fn weights_must_be_fractions() {
        let mut s = Settings::defaults().unwrap();
        s.vote.comment_reduced_weight = 1.5;
        assert!(s.validate().is_err());
    }
}
