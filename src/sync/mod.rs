pub mod checkpoint;
pub mod rate_limit;
pub mod resumable;
pub mod retry;
pub mod service;
pub mod ttl;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cap on the number of per-item error messages carried in a stats sample.
/// The `failed` counter is always exact; only the message sample is bounded.
pub const ERROR_SAMPLE_LIMIT: usize = 50;

/// Options controlling a sync operation.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Page cap for full-collection fetches (0 = unlimited).
    pub max_pages: u32,
    /// Page cap for a single resumable invocation (0 = unlimited).
    pub max_pages_per_run: u32,
    /// Ignore the TTL gate for gated categories.
    pub force: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_pages: 0,
            max_pages_per_run: 0,
            force: false,
        }
    }
}

/// A transformed item ready for the document store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncDoc {
    pub id: String,
    pub doc: serde_json::Value,
}

/// Maps one raw API item to a storable document. Failures are isolated to the
/// item: the caller records them in stats and keeps going.
pub type TransformFn = dyn Fn(&serde_json::Value) -> crate::error::Result<SyncDoc> + Send + Sync;

#[derive(Debug, Clone, Serialize)]
pub struct SyncErrorEntry {
    pub id: String,
    pub message: String,
}

/// Counters accumulated over one sync invocation. Created fresh per run and
/// only ever incremented while the run is in flight.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
    pub errors: Vec<SyncErrorEntry>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl SyncStats {
    pub fn new() -> Self {
        Self {
            created: 0,
            updated: 0,
            failed: 0,
            errors: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// Count a per-item failure, keeping at most `ERROR_SAMPLE_LIMIT` messages.
    pub fn record_error(&mut self, id: impl Into<String>, message: impl Into<String>) {
        self.failed += 1;
        if self.errors.len() < ERROR_SAMPLE_LIMIT {
            self.errors.push(SyncErrorEntry {
                id: id.into(),
                message: message.into(),
            });
        }
    }

    pub fn finish(&mut self) {
        self.end_time = Some(Utc::now());
    }
}

impl Default for SyncStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Result returned by a sync entry point. `success=false` means the top-level
/// fetch itself failed; per-item failures are visible through `stats` instead.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub stats: SyncStats,
    pub message: String,
}

impl SyncOutcome {
    pub fn fetch_failed(label: &str, err: &crate::error::Error) -> Self {
        let mut stats = SyncStats::new();
        stats.finish();
        Self {
            success: false,
            stats,
            message: format!("{label}: fetch failed: {err}"),
        }
    }

    /// Outcome for a TTL-gated sync that was skipped because it is still fresh.
    pub fn skipped(label: &str) -> Self {
        let mut stats = SyncStats::new();
        stats.finish();
        Self {
            success: true,
            stats,
            message: format!("{label}: skipped (synced within TTL)"),
        }
    }
}

/// Progress observer for sync operations. The pipeline emits structured
/// events through this trait and stays free of output formatting; reporters
/// live at the binary boundary. All methods default to no-ops so reporters
/// implement only what they present.
pub trait SyncProgress: Send + Sync {
    fn on_fetch_start(&self, _entity: &str) {}

    fn on_page_fetched(&self, _entity: &str, _page: u32, _count: usize, _total_so_far: usize) {}

    fn on_batch_complete(
        &self,
        _entity: &str,
        _batch: usize,
        _total_batches: usize,
        _percent: f64,
        _eta_seconds: Option<u64>,
    ) {
    }

    /// Emitted by the resumable loop after each page's checkpoint write.
    fn on_page_complete(&self, _sync_id: &str, _page: u32, _items: usize, _total_items: u64) {}

    fn on_rate_limited(&self, _entity: &str, _resume_at: Option<DateTime<Utc>>) {}

    fn on_complete(&self, _outcome: &SyncOutcome) {}
}

/// Progress reporter that ignores all events.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}
