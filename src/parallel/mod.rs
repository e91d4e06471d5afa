//! Parallel forEach runtime (C7).
//!
//! A bounded worker pool built from `tokio::sync::Semaphore` + `JoinSet`,
//! generalizing the source project's `DagPlanner` concurrency idiom
//! (semaphore-gated spawns collected on a `JoinSet`) without its
//! dependency-graph machinery, which this spec's step tree has no use for.
//! Results are reassembled by the caller's original index so ordering stays
//! deterministic regardless of completion order. A token-bucket limiter
//! paces dispatch when `requestsPerSecond` is configured; the merge lock
//! is never held while a worker awaits HTTP I/O or the rate limiter.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::errors::CrawlerError;

/// A simple token bucket: `burst` tokens available immediately, refilling
/// at `rate` tokens/sec, capped at `burst`.
pub struct RateLimiter {
    inner: tokio::sync::Mutex<RateLimiterState>,
}

struct RateLimiterState {
    tokens: f64,
    burst: f64,
    rate: f64,
    last_refill: tokio::time::Instant,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: tokio::sync::Mutex::new(RateLimiterState {
                tokens: burst as f64,
                burst: burst as f64,
                rate: rate_per_sec,
                last_refill: tokio::time::Instant::now(),
            }),
        })
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.inner.lock().await;
                let now = tokio::time::Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * state.rate).min(state.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / state.rate))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// Runs `f(item, index)` for every item in `items`, with at most
/// `max_concurrency` in flight at once, each spawn optionally paced by
/// `limiter`, checking `cancel` before dispatching each new item. Returns
/// results in input order. A cancelled run stops dispatching new work but
/// still collects whatever was already in flight.
pub async fn run_bounded<T, F, Fut>(
    items: Vec<T>,
    max_concurrency: usize,
    limiter: Option<Arc<RateLimiter>>,
    cancel: watch::Receiver<bool>,
    f: F,
) -> Vec<Result<serde_json::Value, CrawlerError>>
where
    T: Send + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, CrawlerError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let f = Arc::new(f);
    let mut results: Vec<Option<Result<serde_json::Value, CrawlerError>>> = (0..items.len()).map(|_| None).collect();
    let mut joins = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        if *cancel.borrow() {
            results[index] = Some(Err(CrawlerError::Cancelled));
            continue;
        }
        if let Some(limiter) = &limiter {
            limiter.acquire().await;
        }
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
        let f = f.clone();
        joins.spawn(async move {
            let _permit = permit;
            let result = f(item, index).await;
            (index, result)
        });
    }

    while let Some(joined) = joins.join_next().await {
        match joined {
            Ok((index, result)) => results[index] = Some(result),
            Err(e) => {
                tracing::error!(error = %e, "forEach worker task panicked");
            }
        }
    }

    results
        .into_iter()
        .map(|r| r.unwrap_or(Err(CrawlerError::Cancelled)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_all_items_and_preserves_order() {
        let (_tx, rx) = watch::channel(false);
        let results = run_bounded(vec![1, 2, 3], 2, None, rx, |n, _i| async move { Ok(serde_json::json!(n * 2)) }).await;
        let values: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![serde_json::json!(2), serde_json::json!(4), serde_json::json!(6)]);
    }

    #[tokio::test]
    async fn respects_cancellation() {
        let (tx, rx) = watch::channel(true);
        let _ = tx;
        let results = run_bounded(vec![1], 1, None, rx, |n, _i| async move { Ok(serde_json::json!(n)) }).await;
        assert!(matches!(results[0], Err(CrawlerError::Cancelled)));
    }
}
