//! Supervised fire-and-forget work.
//!
//! Spill writes, notifications and invalidation callbacks outlive the call
//! that triggered them. They run on the ambient tokio runtime but are
//! tracked here so a process can wait for them on shutdown.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::Instrument;

use super::engine::CacheEngine;

#[derive(Debug, Default)]
pub struct BackgroundTasks {
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `future` until it completes. Outside a tokio runtime the work
    /// is dropped with a warning.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!(task = name, "No tokio runtime, dropping background work");
                return;
            }
        };

        let span = tracing::debug_span!("cache.background", task = name);
        let Ok(mut tasks) = self.tasks.lock() else {
            tracing::warn!(task = name, "Background registry poisoned, dropping work");
            return;
        };
        while let Some(finished) = tasks.try_join_next() {
            log_outcome(finished);
        }
        tasks.spawn_on(future.instrument(span), &handle);
    }

    /// Number of tracked tasks that have not been reaped yet.
    pub fn pending(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Wait for every tracked task, including tasks spawned while draining.
    pub async fn drain(&self) {
        loop {
            let mut batch = match self.tasks.lock() {
                Ok(mut tasks) => std::mem::take(&mut *tasks),
                Err(_) => return,
            };
            if batch.is_empty() {
                return;
            }
            while let Some(finished) = batch.join_next().await {
                log_outcome(finished);
            }
        }
    }
}

fn log_outcome(outcome: Result<(), tokio::task::JoinError>) {
    if let Err(e) = outcome {
        if e.is_panic() {
            tracing::warn!(error = %e, "Background cache task panicked");
        }
    }
}

/// Periodically drop expired entries from the engine's local store until
/// `shutdown_rx` flips to `true`.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(sweeper_task(engine.clone(), Duration::from_secs(30), shutdown_rx));
///
/// let _ = shutdown_tx.send(true);
/// let swept = handle.await?;
/// ```
pub async fn sweeper_task(engine: CacheEngine, every: Duration, mut shutdown_rx: watch::Receiver<bool>) -> usize {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut total = 0usize;

    tracing::info!(interval_ms = every.as_millis() as u64, "Cache sweeper started");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Cache sweeper shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let removed = engine.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired cache entries");
                }
                total += removed;
            }
        }
    }

    tracing::info!(swept = total, "Cache sweeper completed");
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_drain_waits_for_work() {
        let tasks = BackgroundTasks::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = done.clone();
            tasks.spawn("test", async move {
                tokio::task::yield_now().await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(tasks.pending(), 0);
    }

    #[tokio::test]
    async fn test_drain_covers_nested_spawns() {
        let tasks = Arc::new(BackgroundTasks::new());
        let done = Arc::new(AtomicUsize::new(0));
        let (inner_tasks, inner_done) = (tasks.clone(), done.clone());
        tasks.spawn("outer", async move {
            inner_tasks.spawn("inner", async move {
                inner_done.fetch_add(1, Ordering::SeqCst);
            });
        });
        tasks.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panics_do_not_poison_drain() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("panics", async { panic!("boom") });
        tasks.drain().await;
        assert_eq!(tasks.pending(), 0);
    }

    #[test]
    fn test_spawn_without_runtime_is_dropped() {
        let tasks = BackgroundTasks::new();
        tasks.spawn("orphan", async {});
        assert_eq!(tasks.pending(), 0);
    }
}
