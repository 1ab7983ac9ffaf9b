//! # Store guard
//!
//! Bounds every store call with a timeout. Reads and idempotent writes are retried with
//! exponential backoff while the failure is `StoreUnavailable`; score deltas go through
//! [`StoreGuard::once`] and are never replayed.

use std::future::Future;
use std::time::Duration;

use rf_core::{FeedError, Result};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct StoreGuard {
    op_timeout: Duration,
    max_retries: u32,
    retry_base: Duration,
}

impl Default for StoreGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 3, Duration::from_millis(50))
    }
}

impl StoreGuard {
    pub fn new(op_timeout: Duration, max_retries: u32, retry_base: Duration) -> Self {
        Self {
            op_timeout,
            max_retries,
            retry_base,
        }
    }

    /// Runs `op` once under the timeout. A timeout is reported as `StoreUnavailable`: the
    /// operation may or may not have been applied.
    pub async fn once<T>(&self, what: &'static str, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::StoreUnavailable(format!(
                "{what} timed out after {:?}",
                self.op_timeout
            ))),
        }
    }

    /// Runs `op` under the timeout, retrying transient failures.
    pub async fn retry<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match self.once(what, op()).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let backoff = self.retry_base * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(op = what, attempt, ?backoff, error = %e, "store call failed, retrying");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> StoreGuard {
        StoreGuard::new(Duration::from_millis(50), 2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out = fast()
            .retry("flaky read", || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FeedError::StoreUnavailable("blip".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<()> = fast()
            .retry("dead read", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(FeedError::StoreUnavailable("down".into()))
            })
            .await;
        assert!(matches!(out, Err(FeedError::StoreUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out: Result<()> = fast()
            .retry("lookup", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(FeedError::not_found("post", 1))
            })
            .await;
        assert!(matches!(out, Err(FeedError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_is_store_unavailable() {
        let out: Result<()> = fast()
            .once("slow write", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(out, Err(FeedError::StoreUnavailable(_))));
    }
}
