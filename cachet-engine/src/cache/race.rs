//! Bounded racing over a list of suppliers.
//!
//! Up to `prefetch` suppliers are started in total, never more than
//! `max_parallelism` at once. The first output the validity predicate
//! accepts wins and every other in-flight attempt is dropped. Failed,
//! timed-out and rejected attempts make room for the next supplier.
//!
//! # Example
//!
//! ```ignore
//! let options = RaceOptions::new(5, 2);
//! let winner = race_first_valid(suppliers, options, |v: &Option<Bytes>| v.is_some()).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaceOptions {
    pub prefetch: usize,
    pub max_parallelism: usize,
    pub attempt_timeout: Option<Duration>,
}

impl RaceOptions {
    pub fn new(prefetch: usize, max_parallelism: usize) -> Self {
        Self {
            prefetch,
            max_parallelism,
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), RaceError> {
        if self.prefetch == 0 {
            return Err(RaceError::InvalidArguments {
                reason: "prefetch must be positive".to_string(),
            });
        }
        if self.max_parallelism == 0 {
            return Err(RaceError::InvalidArguments {
                reason: "max parallelism must be positive".to_string(),
            });
        }
        if self.max_parallelism > self.prefetch {
            return Err(RaceError::InvalidArguments {
                reason: format!(
                    "max parallelism ({}) exceeds prefetch ({})",
                    self.max_parallelism, self.prefetch
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RaceError {
    #[error("Invalid race arguments: {reason}")]
    InvalidArguments { reason: String },

    #[error("No task was valid")]
    NoValidResult,
}

/// Race `suppliers` in order and return the first output accepted by
/// `is_valid`.
pub async fn race_first_valid<S, Fut, T, E, V>(
    suppliers: Vec<S>,
    options: RaceOptions,
    mut is_valid: V,
) -> Result<T, RaceError>
where
    S: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    V: FnMut(&T) -> bool,
{
    options.validate()?;

    let timeout = options.attempt_timeout;
    let start = |supplier: S| {
        let attempt = supplier();
        async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, attempt).await.ok().and_then(Result::ok),
                None => attempt.await.ok(),
            }
        }
    };

    let mut queue = suppliers.into_iter().take(options.prefetch);
    let mut running = FuturesUnordered::new();
    for supplier in queue.by_ref().take(options.max_parallelism) {
        running.push(start(supplier));
    }

    while let Some(outcome) = running.next().await {
        if let Some(value) = outcome {
            if is_valid(&value) {
                return Ok(value);
            }
        }
        if let Some(supplier) = queue.next() {
            running.push(start(supplier));
        }
    }

    Err(RaceError::NoValidResult)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    type Supplier = Box<dyn FnOnce() -> futures_util::future::BoxFuture<'static, Result<u32, &'static str>>>;

    fn supplier(delay_ms: u64, output: Result<u32, &'static str>) -> Supplier {
        Box::new(move || {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                output
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fastest_valid_wins() {
        let suppliers = vec![supplier(50, Ok(1)), supplier(10, Ok(2))];
        let winner = race_first_valid(suppliers, RaceOptions::new(2, 2), |_| true).await;
        assert_eq!(winner, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_and_failed_results_are_skipped() {
        let suppliers = vec![supplier(1, Err("boom")), supplier(2, Ok(0)), supplier(3, Ok(7))];
        let winner = race_first_valid(suppliers, RaceOptions::new(3, 1), |v| *v > 0).await;
        assert_eq!(winner, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_distinct_error() {
        let suppliers = vec![supplier(1, Err("boom")), supplier(1, Ok(0))];
        let result = race_first_valid(suppliers, RaceOptions::new(2, 2), |v| *v > 0).await;
        assert_eq!(result, Err(RaceError::NoValidResult));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_miss() {
        let suppliers = vec![supplier(1_000, Ok(1)), supplier(5, Ok(2))];
        let options = RaceOptions::new(2, 1).with_attempt_timeout(Some(Duration::from_millis(100)));
        let winner = race_first_valid(suppliers, options, |_| true).await;
        assert_eq!(winner, Ok(2));
    }

    #[tokio::test]
    async fn test_rejects_bad_arguments_before_starting() {
        let started = Arc::new(AtomicUsize::new(0));
        let make = || {
            let started = started.clone();
            move || {
                started.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u32, Infallible>(1) }
            }
        };

        for (p, m) in [(0, 0), (2, 0), (2, 3)] {
            let result = race_first_valid(vec![make(), make()], RaceOptions::new(p, m), |_| true).await;
            assert!(matches!(result, Err(RaceError::InvalidArguments { .. })));
        }
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_bounds_started_suppliers() {
        let started = Arc::new(AtomicUsize::new(0));
        let suppliers: Vec<_> = (0..10)
            .map(|_| {
                let started = started.clone();
                move || {
                    started.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<u32, Infallible>(0) }
                }
            })
            .collect();

        let result = race_first_valid(suppliers, RaceOptions::new(4, 2), |v| *v > 0).await;
        assert_eq!(result, Err(RaceError::NoValidResult));
        assert_eq!(started.load(Ordering::SeqCst), 4);
    }
}
