use std::time::Duration;

use crate::error::{Error, Result};

/// Default retry budget for a single API call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Fixed wait after a provider 429 with no reset hint, tuned to the
/// provider's rolling-window granularity.
pub const RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);
/// Longest suspension a 429 reset hint is allowed to impose in-process;
/// anything longer belongs to the checkpoint/suspension path.
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(3600);

const BASE_DELAY_MS: u64 = 500;
const BACKOFF_MULTIPLIER: u64 = 2;
/// Pause inserted between sub-batches by `run_batched`.
const BATCH_PAUSE: Duration = Duration::from_millis(250);

/// Delay before retrying `attempt` (1-based): a long fixed wait for
/// rate-limit rejections (honoring the provider's reset hint when present),
/// exponential backoff for everything else.
pub fn retry_delay(e: &Error, attempt: u32) -> Duration {
    match e {
        Error::RateLimited {
            resets_in_seconds: Some(secs),
        } => Duration::from_secs(*secs).min(MAX_RATE_LIMIT_WAIT),
        Error::RateLimited {
            resets_in_seconds: None,
        } => RATE_LIMIT_WAIT,
        _ => Duration::from_millis(
            BASE_DELAY_MS * BACKOFF_MULTIPLIER.pow(attempt.saturating_sub(1)),
        ),
    }
}

/// Retry an API call expression with backoff.
///
/// Usage: `retry_call!(limiter.execute("teams", || client.fetch_page(..)), "teams", 3)`
///
/// The expression is re-evaluated on each retry attempt. This is a macro
/// because async closures that return borrowed futures can't satisfy `Fn`.
macro_rules! retry_call {
    ($expr:expr, $ctx:expr, $max_attempts:expr) => {{
        let mut _attempt: u32 = 1;
        loop {
            match $expr.await {
                Ok(val) => break Ok::<_, $crate::error::Error>(val),
                Err(e) if _attempt < $max_attempts && e.is_retryable() => {
                    let wait = $crate::sync::retry::retry_delay(&e, _attempt);
                    log::warn!(
                        "{}: attempt {_attempt}/{} failed ({e}); retrying in {wait:?}",
                        $ctx,
                        $max_attempts
                    );
                    tokio::time::sleep(wait).await;
                    _attempt += 1;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

pub(crate) use retry_call;

/// Apply an async operation to every item with bounded concurrency:
/// fixed-size sub-batches run concurrently, with a small pause between
/// sub-batches to avoid bursting the provider. Results keep item order.
pub async fn run_batched<T, R, F, Fut>(items: Vec<T>, concurrency: usize, op: F) -> Vec<Result<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<R>> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    let total = items.len();
    let mut results = Vec::with_capacity(total);
    let mut iter = items.into_iter();

    loop {
        let chunk: Vec<T> = iter.by_ref().take(concurrency).collect();
        if chunk.is_empty() {
            break;
        }
        let mut handles = Vec::with_capacity(chunk.len());
        for item in chunk {
            let op = op.clone();
            handles.push(tokio::spawn(async move { op(item).await }));
        }
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => results.push(Err(Error::Other(format!("task panic: {e}")))),
            }
        }
        if results.len() < total {
            tokio::time::sleep(BATCH_PAUSE).await;
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    async fn flaky(calls: &AtomicU32, fail_first: u32, err: fn() -> Error) -> Result<u32> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        if n < fail_first {
            Err(err())
        } else {
            Ok(n)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_back_off_exponentially() {
        let calls = AtomicU32::new(0);
        let before = Instant::now();

        let result = retry_call!(
            flaky(&calls, 2, || Error::Http("reset".into())),
            "test",
            3
        );

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 500ms after attempt 1, 1000ms after attempt 2.
        assert_eq!(before.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_rejection_waits_the_long_fixed_delay() {
        let calls = AtomicU32::new(0);
        let before = Instant::now();

        let result = retry_call!(
            flaky(&calls, 1, || Error::RateLimited {
                resets_in_seconds: None
            }),
            "test",
            3
        );

        assert!(result.is_ok());
        assert_eq!(before.elapsed(), RATE_LIMIT_WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_reset_hint_is_honored() {
        let calls = AtomicU32::new(0);
        let before = Instant::now();

        let result = retry_call!(
            flaky(&calls, 1, || Error::RateLimited {
                resets_in_seconds: Some(10)
            }),
            "test",
            3
        );

        assert!(result.is_ok());
        assert_eq!(before.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_fail_fast() {
        let calls = AtomicU32::new(0);

        let result: Result<u32> = retry_call!(
            flaky(&calls, 99, || Error::Api {
                status: 404,
                message: "missing".into()
            }),
            "test",
            3
        );

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_budget_is_bounded() {
        let calls = AtomicU32::new(0);

        let result: Result<u32> = retry_call!(
            flaky(&calls, 99, || Error::Http("down".into())),
            "test",
            3
        );

        assert!(matches!(result, Err(Error::Http(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_batched_processes_all_items_in_order() {
        let items: Vec<u32> = (0..10).collect();
        let results = run_batched(items, 3, |n| async move { Ok(n * 2) }).await;

        assert_eq!(results.len(), 10);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(*r.as_ref().unwrap(), (i as u32) * 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_batched_bounds_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let in_flight_op = Arc::clone(&in_flight);
        let max_seen_op = Arc::clone(&max_seen);
        let results = run_batched((0..12).collect::<Vec<u32>>(), 4, move |n| {
            let in_flight = Arc::clone(&in_flight_op);
            let max_seen = Arc::clone(&max_seen_op);
            async move {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(n)
            }
        })
        .await;

        assert_eq!(results.len(), 12);
        assert!(max_seen.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn run_batched_isolates_item_failures() {
        let results = run_batched((0..6).collect::<Vec<u32>>(), 2, |n| async move {
            if n % 3 == 0 {
                Err(Error::Http("flaky".into()))
            } else {
                Ok(n)
            }
        })
        .await;

        let failures = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(failures, 2);
        assert_eq!(results.len(), 6);
    }
}
