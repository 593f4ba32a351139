//! Bounded, rate-limited batch executor.
//!
//! Fans a batch of independent tasks out over a counting semaphore, optionally
//! pacing submissions against a global requests-per-minute ceiling. Tasks
//! contain their own errors (log and skip); one failing item never aborts the
//! batch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

const DEFAULT_CONCURRENCY: usize = 3;

/// Run `process` over every item and wait for all of them to finish.
///
/// `concurrency` bounds simultaneous invocations (0 falls back to the
/// default). `rate_per_minute` paces *submission*: consecutive items are
/// spaced `60s / rate` apart, with the first item submitted immediately;
/// 0 means unpaced. Completion order is unconstrained.
pub async fn run<T, F, Fut>(items: Vec<T>, concurrency: usize, rate_per_minute: u32, process: F)
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let concurrency = if concurrency == 0 {
        DEFAULT_CONCURRENCY
    } else {
        concurrency
    };
    let semaphore = Arc::new(Semaphore::new(concurrency));

    let mut ticker = if rate_per_minute > 0 {
        Some(tokio::time::interval(
            Duration::from_secs(60) / rate_per_minute,
        ))
    } else {
        None
    };

    let total = items.len();
    let mut tasks = JoinSet::new();
    for item in items {
        if let Some(ticker) = ticker.as_mut() {
            // First tick completes immediately; only later items wait.
            ticker.tick().await;
        }
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .expect("batch semaphore is never closed");
        let fut = process(item);
        tasks.spawn(async move {
            fut.await;
            drop(permit);
        });
    }

    while tasks.join_next().await.is_some() {}
    debug!(total, "batch complete");
}
