use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::api::RateLimitInfo;
use crate::error::{Error, Result};

/// Per-entity call budget per rolling window (the provider's hourly ceiling).
pub const DEFAULT_CEILING: u32 = 3000;
/// Rolling window duration.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);
/// Cap on simultaneous outbound calls across all entities.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

/// Per-entity status snapshot for observability.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EntityRateStatus {
    pub entity: String,
    pub used: u32,
    pub remaining: u32,
    pub resets_in_seconds: u64,
}

/// Rolling per-entity call budgets plus one global concurrency gate.
///
/// A plain constructible value: callers hold it (or an `Arc`) and pass it by
/// reference wherever outbound calls are made, so tests get isolated
/// instances. Windows are in-memory only; cross-invocation budget state
/// travels through the resumable sync's checkpoint instead.
pub struct RateLimiter {
    ceiling: u32,
    window: Duration,
    gate: Semaphore,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new(ceiling: u32, window: Duration, max_concurrency: usize) -> Self {
        Self {
            ceiling,
            window,
            gate: Semaphore::new(max_concurrency.max(1)),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CEILING, DEFAULT_WINDOW, DEFAULT_MAX_CONCURRENCY)
    }

    /// Gate `call` behind the global concurrency limit and the entity's
    /// window budget. Over budget, waits out the window remainder once and
    /// re-checks; still over means `RateLimitExceeded`. A failed call's
    /// budget slot is refunded.
    pub async fn execute<T, Fut>(&self, entity: &str, call: impl FnOnce() -> Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::Other("rate limiter gate closed".into()))?;

        if let Some(wait) = self.try_reserve(entity) {
            log::warn!(
                "{entity}: call budget exhausted, waiting {}s for window reset",
                wait.as_secs()
            );
            tokio::time::sleep(wait).await;
            if self.try_reserve(entity).is_some() {
                return Err(Error::RateLimitExceeded {
                    entity: entity.to_string(),
                });
            }
        }

        match call().await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.refund(entity);
                Err(e)
            }
        }
    }

    /// Reserve one budget slot, rolling the window first if it has expired.
    /// Returns the remaining window time when the ceiling is hit.
    fn try_reserve(&self, entity: &str) -> Option<Duration> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let w = windows.entry(entity.to_string()).or_insert(RateWindow {
            count: 0,
            window_start: now,
        });
        if now.duration_since(w.window_start) >= self.window {
            w.count = 0;
            w.window_start = now;
        }
        if w.count >= self.ceiling {
            return Some(self.window.saturating_sub(now.duration_since(w.window_start)));
        }
        w.count += 1;
        None
    }

    fn refund(&self, entity: &str) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(w) = windows.get_mut(entity) {
            w.count = w.count.saturating_sub(1);
        }
    }

    /// Reconcile the local window against the provider's own rate_limit
    /// block. The provider wins: a higher reported usage overwrites the local
    /// counter, and a later reset extends the window.
    pub fn reconcile(&self, entity: &str, info: &RateLimitInfo) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let w = windows.entry(entity.to_string()).or_insert(RateWindow {
            count: 0,
            window_start: now,
        });

        if let Some(remaining) = info.remaining {
            let used_remote = self.ceiling.saturating_sub(remaining);
            if used_remote > w.count {
                log::debug!(
                    "{entity}: provider reports {used_remote} calls used (local {}), adopting",
                    w.count
                );
                w.count = used_remote;
            }
        }

        if let Some(resets_in) = info.resets_in_seconds {
            let remote_reset = now + Duration::from_secs(resets_in);
            let local_reset = w.window_start + self.window;
            if remote_reset > local_reset {
                if let Some(start) = remote_reset.checked_sub(self.window) {
                    w.window_start = start;
                }
            }
        }
    }

    /// Usage snapshot per entity, with expired windows reported as empty.
    pub fn status(&self) -> Vec<EntityRateStatus> {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let mut entries: Vec<EntityRateStatus> = windows
            .iter()
            .map(|(entity, w)| {
                let elapsed = now.duration_since(w.window_start);
                let (used, resets_in) = if elapsed >= self.window {
                    (0, 0)
                } else {
                    (w.count, (self.window - elapsed).as_secs())
                };
                EntityRateStatus {
                    entity: entity.clone(),
                    used,
                    remaining: self.ceiling.saturating_sub(used),
                    resets_in_seconds: resets_in,
                }
            })
            .collect();
        entries.sort_by(|a, b| a.entity.cmp(&b.entity));
        entries
    }
}
