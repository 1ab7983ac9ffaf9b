//! # rf-index-redis Implementation
//!
//! [`OrderedIndex`] over a pooled Redis connection. Batches run as `MULTI`/`EXEC`
//! pipelines; multi-key reads are pipelined so a page costs one round trip per lookup kind.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{self, Pipeline};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use rf_core::{FeedError, IndexOp, OrderedIndex, Result};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

pub struct RedisIndex {
    pool: Pool,
}

fn unavailable(e: impl std::fmt::Display) -> FeedError {
    FeedError::StoreUnavailable(format!("redis: {e}"))
}

impl RedisIndex {
    pub fn new(url: &SecretString, pool_size: usize) -> Result<Self> {
        let mut cfg = Config::from_url(url.expose_secret());
        cfg.pool = Some(PoolConfig::new(pool_size));
        let pool = cfg.create_pool(Some(Runtime::Tokio1)).map_err(unavailable)?;
        info!(pool_size, "redis index pool created");
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool.get().await.map_err(unavailable)
    }
}

/// Appends one op to a pipeline, discarding its reply.
fn push_op(pipe: &mut Pipeline, op: IndexOp) {
    match op {
        IndexOp::ZAdd { key, member, score } => {
            pipe.cmd("ZADD").arg(key).arg(score).arg(member).ignore();
        }
        IndexOp::ZIncrBy { key, member, delta } => {
            pipe.cmd("ZINCRBY").arg(key).arg(delta).arg(member).ignore();
        }
        IndexOp::ZRem { key, members } if !members.is_empty() => {
            pipe.cmd("ZREM").arg(key).arg(members).ignore();
        }
        IndexOp::SAdd { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member).ignore();
        }
        IndexOp::SRem { key, member } => {
            pipe.cmd("SREM").arg(key).arg(member).ignore();
        }
        IndexOp::Del { keys } if !keys.is_empty() => {
            pipe.cmd("DEL").arg(keys).ignore();
        }
        IndexOp::ZRem { .. } | IndexOp::Del { .. } => {}
    }
}

#[async_trait]
impl OrderedIndex for RedisIndex {
    async fn atomic(&self, ops: Vec<IndexOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let n = ops.len();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            push_op(&mut pipe, op);
        }
        let mut conn = self.conn().await?;
        pipe.query_async::<()>(&mut conn).await.map_err(unavailable)?;
        debug!(ops = n, "batch committed");
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn().await?;
        redis::cmd("ZSCORE")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn zscores(&self, key: &str, members: &[String]) -> Result<Vec<Option<f64>>> {
        if members.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        redis::cmd("ZMSCORE")
            .arg(key)
            .arg(members)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn zrevrange(&self, key: &str, start: u64, stop: u64) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn zrange_all(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn zcount_each(&self, keys: &[String], min: f64, max: f64) -> Result<Vec<u64>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("ZCOUNT").arg(key).arg(min).arg(max);
        }
        let mut conn = self.conn().await?;
        pipe.query_async(&mut conn).await.map_err(unavailable)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn zinterstore_max(
        &self,
        dest: &str,
        set_key: &str,
        zset_key: &str,
        ttl: Duration,
    ) -> Result<u64> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZINTERSTORE")
            .arg(dest)
            .arg(2)
            .arg(set_key)
            .arg(zset_key)
            .arg("AGGREGATE")
            .arg("MAX")
            .cmd("PEXPIRE")
            .arg(dest)
            .arg(ttl.as_millis() as u64)
            .ignore();
        let mut conn = self.conn().await?;
        let (size,): (u64,) = pipe.query_async(&mut conn).await.map_err(unavailable)?;
        Ok(size)
    }
}
