use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::api::models::item_id;
use crate::api::PageSource;
use crate::error::{Error, Result};
use crate::storage::repository::{self, UpsertKind};
use crate::storage::Database;
use crate::sync::checkpoint::{self, Checkpoint, CheckpointMode};
use crate::sync::{SyncProgress, SyncStats, TransformFn};

/// Suspension applied to a 429 that carries no reset hint.
const DEFAULT_SUSPENSION_SECS: i64 = 3600;

/// Result of one resumable invocation. `is_complete=false` with a
/// `next_resume_time` means the caller (the scheduler) should re-invoke
/// later; busy-waiting in-process is never correct here.
#[derive(Debug, Clone, Serialize)]
pub struct ResumableOutcome {
    pub sync_id: String,
    pub pages_processed: u32,
    pub total_items_processed: u64,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_resume_time: Option<DateTime<Utc>>,
    pub stats: SyncStats,
    pub message: String,
}

/// Page-at-a-time sync for collections too large to enumerate in one
/// invocation. The checkpoint is written after every page, so a crash loses
/// at most one page of progress, and page N+1 is never requested before
/// page N's checkpoint write has completed.
pub struct ResumableSync<'a> {
    db: &'a Database,
    collection: &'static str,
    sync_id: String,
    max_pages_per_run: u32,
    transform: &'a TransformFn,
}

impl<'a> ResumableSync<'a> {
    pub fn new(
        db: &'a Database,
        collection: &'static str,
        sync_id: impl Into<String>,
        transform: &'a TransformFn,
    ) -> Self {
        Self {
            db,
            collection,
            sync_id: sync_id.into(),
            max_pages_per_run: 0,
            transform,
        }
    }

    /// Bound one invocation's call budget (0 = unlimited).
    pub fn with_max_pages_per_run(mut self, max_pages_per_run: u32) -> Self {
        self.max_pages_per_run = max_pages_per_run;
        self
    }

    pub async fn run(
        &self,
        source: &dyn PageSource,
        progress: &dyn SyncProgress,
    ) -> Result<ResumableOutcome> {
        let mut cp = checkpoint::load(self.db, &self.sync_id).await?;

        match cp.mode {
            CheckpointMode::Completed => {
                return Ok(self.outcome(
                    &cp,
                    0,
                    finished_stats(),
                    true,
                    format!("{}: already complete", self.sync_id),
                ));
            }
            CheckpointMode::RateLimited => {
                if let Some(resume_at) = cp.next_resume_time {
                    if Utc::now() < resume_at {
                        // Suspension still in force: report when to come back
                        // and perform no work at all.
                        let mut outcome = self.outcome(
                            &cp,
                            0,
                            finished_stats(),
                            false,
                            format!("{}: suspended until {resume_at}", self.sync_id),
                        );
                        outcome.next_resume_time = Some(resume_at);
                        return Ok(outcome);
                    }
                }
            }
            _ => {}
        }

        cp.mode = CheckpointMode::Resuming;
        cp.next_resume_time = None;
        cp.last_error = None;
        checkpoint::save(self.db, &cp).await;

        let mut stats = SyncStats::new();
        let mut pages_this_run: u32 = 0;

        loop {
            if self.max_pages_per_run > 0 && pages_this_run >= self.max_pages_per_run {
                // This invocation's page budget is spent. Mode stays
                // `resuming`; the next invocation continues at current_page.
                checkpoint::save(self.db, &cp).await;
                stats.finish();
                return Ok(self.outcome(
                    &cp,
                    pages_this_run,
                    stats,
                    false,
                    format!(
                        "{}: page budget ({}) reached at page {}, resume later",
                        self.sync_id, self.max_pages_per_run, cp.current_page
                    ),
                ));
            }

            let page = match source.fetch_page(cp.current_page).await {
                Ok(page) => page,
                Err(e) if e.is_rate_limit() => {
                    let resume_at = next_resume_time(&e, Utc::now());
                    cp.mode = CheckpointMode::RateLimited;
                    cp.next_resume_time = Some(resume_at);
                    cp.last_error = Some(e.to_string());
                    cp.rate_budget.reset_time = Some(resume_at);
                    checkpoint::save(self.db, &cp).await;
                    progress.on_rate_limited(&self.sync_id, Some(resume_at));
                    stats.finish();
                    let mut outcome = self.outcome(
                        &cp,
                        pages_this_run,
                        stats,
                        false,
                        format!(
                            "{}: rate limited on page {}, suspended until {resume_at}",
                            self.sync_id, cp.current_page
                        ),
                    );
                    outcome.next_resume_time = Some(resume_at);
                    return Ok(outcome);
                }
                Err(e) => {
                    cp.mode = CheckpointMode::Failed;
                    cp.last_error = Some(e.to_string());
                    checkpoint::save(self.db, &cp).await;
                    stats.finish();
                    return Ok(self.outcome(
                        &cp,
                        pages_this_run,
                        stats,
                        false,
                        format!("{}: failed on page {}: {e}", self.sync_id, cp.current_page),
                    ));
                }
            };

            if page.items.is_empty() {
                // Source exhausted.
                cp.mode = CheckpointMode::Completed;
                checkpoint::save(self.db, &cp).await;
                break;
            }

            // Items are written individually here (not bulked): the
            // checkpoint must land right after the page, and `upsert_doc`
            // keeps re-runs of the same page convergent.
            for raw in &page.items {
                match (self.transform)(raw) {
                    Ok(doc) => {
                        let collection = self.collection;
                        let id = doc.id.clone();
                        let payload = doc;
                        match self
                            .db
                            .writer()
                            .call(move |conn| repository::upsert_doc(conn, collection, &payload))
                            .await
                        {
                            Ok(UpsertKind::Created) => {
                                stats.created += 1;
                                cp.cumulative.created += 1;
                            }
                            Ok(UpsertKind::Updated) => {
                                stats.updated += 1;
                                cp.cumulative.updated += 1;
                            }
                            Err(e) => {
                                stats.record_error(id, e.to_string());
                                cp.cumulative.failed += 1;
                            }
                        }
                    }
                    Err(e) => {
                        let id = match &e {
                            Error::Transform { id, .. } => id.clone(),
                            _ => item_id(raw),
                        };
                        stats.record_error(id, e.to_string());
                        cp.cumulative.failed += 1;
                    }
                }
            }

            let item_count = page.items.len();
            let completed_page = cp.current_page;
            cp.items_processed += item_count as u64;
            cp.current_page += 1;
            cp.cumulative.pages_completed += 1;
            if page.total_pages.is_some() {
                // Progress reporting only; termination stays with has_more
                // and the empty-page check.
                cp.total_pages_discovered = page.total_pages;
            }
            cp.rate_budget.calls_used += 1;
            cp.rate_budget.last_call_time = Some(Utc::now());
            pages_this_run += 1;
            checkpoint::save(self.db, &cp).await;
            progress.on_page_complete(&self.sync_id, completed_page, item_count, cp.items_processed);

            if !page.has_more {
                cp.mode = CheckpointMode::Completed;
                checkpoint::save(self.db, &cp).await;
                break;
            }
        }

        stats.finish();
        Ok(self.outcome(
            &cp,
            pages_this_run,
            stats,
            true,
            format!(
                "{}: complete after {} pages, {} items",
                self.sync_id, cp.cumulative.pages_completed, cp.items_processed
            ),
        ))
    }

    /// Restore `fresh` state, forcing the next run to start from page 1.
    pub async fn reset(&self) -> Result<Checkpoint> {
        checkpoint::reset(self.db, &self.sync_id).await
    }

    fn outcome(
        &self,
        cp: &Checkpoint,
        pages_processed: u32,
        stats: SyncStats,
        is_complete: bool,
        message: String,
    ) -> ResumableOutcome {
        ResumableOutcome {
            sync_id: self.sync_id.clone(),
            pages_processed,
            total_items_processed: cp.items_processed,
            is_complete,
            next_resume_time: None,
            stats,
            message,
        }
    }
}

fn finished_stats() -> SyncStats {
    let mut stats = SyncStats::new();
    stats.finish();
    stats
}

fn next_resume_time(e: &Error, now: DateTime<Utc>) -> DateTime<Utc> {
    match e {
        Error::RateLimited {
            resets_in_seconds: Some(secs),
        } => now + Duration::seconds(*secs as i64),
        _ => now + Duration::seconds(DEFAULT_SUSPENSION_SECS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Page;
    use crate::sync::{NoopProgress, SyncDoc};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    enum Step {
        Items(usize, bool),
        RateLimit(u64),
        Fail,
    }

    /// Scripted source indexed by page number, recording every request.
    struct FakeSource {
        steps: Vec<Step>,
        calls: Mutex<Vec<u32>>,
    }

    impl FakeSource {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl PageSource for FakeSource {
        async fn fetch_page(&self, page: u32) -> Result<Page> {
            self.calls.lock().unwrap().push(page);
            match self.steps.get((page - 1) as usize) {
                Some(Step::Items(count, has_more)) => Ok(Page {
                    page,
                    items: (0..*count)
                        .map(|i| json!({"id": page as usize * 1000 + i, "name": "p"}))
                        .collect(),
                    has_more: *has_more,
                    total_pages: Some(self.steps.len() as u32),
                    rate_limit: None,
                }),
                Some(Step::RateLimit(secs)) => Err(Error::RateLimited {
                    resets_in_seconds: Some(*secs),
                }),
                Some(Step::Fail) => Err(Error::Http("connection reset".into())),
                None => Ok(Page {
                    page,
                    items: Vec::new(),
                    has_more: false,
                    total_pages: None,
                    rate_limit: None,
                }),
            }
        }
    }

    fn transform(raw: &Value) -> Result<SyncDoc> {
        Ok(SyncDoc {
            id: raw["id"].to_string(),
            doc: raw.clone(),
        })
    }

    #[tokio::test]
    async fn fresh_run_processes_all_pages_and_completes() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::new(vec![
            Step::Items(2, true),
            Step::Items(2, true),
            Step::Items(2, false),
        ]);
        let sync = ResumableSync::new(&db, "players", "players_sync", &transform);

        let outcome = sync.run(&source, &NoopProgress).await.unwrap();
        assert!(outcome.is_complete);
        assert_eq!(outcome.pages_processed, 3);
        assert_eq!(outcome.total_items_processed, 6);
        assert_eq!(outcome.stats.created, 6);
        assert_eq!(source.calls(), vec![1, 2, 3]);

        let cp = checkpoint::load(&db, "players_sync").await.unwrap();
        assert_eq!(cp.mode, CheckpointMode::Completed);
        assert_eq!(cp.cumulative.pages_completed, 3);
    }

    #[tokio::test]
    async fn page_budget_stops_run_and_next_invocation_resumes() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::new(vec![
            Step::Items(2, true),
            Step::Items(2, true),
            Step::Items(2, true),
            Step::Items(1, false),
        ]);
        let sync = ResumableSync::new(&db, "players", "players_sync", &transform)
            .with_max_pages_per_run(2);

        let first = sync.run(&source, &NoopProgress).await.unwrap();
        assert!(!first.is_complete);
        assert_eq!(first.pages_processed, 2);
        assert_eq!(source.calls(), vec![1, 2]);

        let cp = checkpoint::load(&db, "players_sync").await.unwrap();
        assert_eq!(cp.mode, CheckpointMode::Resuming);
        assert_eq!(cp.current_page, 3);

        // Second invocation never re-requests pages 1..=2.
        let second = sync.run(&source, &NoopProgress).await.unwrap();
        assert!(second.is_complete);
        assert_eq!(source.calls(), vec![1, 2, 3, 4]);
        assert_eq!(second.total_items_processed, 7);
    }

    #[tokio::test]
    async fn empty_first_page_completes_immediately() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::new(vec![Step::Items(0, false)]);
        let sync = ResumableSync::new(&db, "players", "players_sync", &transform);

        let outcome = sync.run(&source, &NoopProgress).await.unwrap();
        assert!(outcome.is_complete);
        assert_eq!(outcome.total_items_processed, 0);
        let cp = checkpoint::load(&db, "players_sync").await.unwrap();
        assert_eq!(cp.mode, CheckpointMode::Completed);
    }

    #[tokio::test]
    async fn rate_limit_suspends_and_early_reinvocation_does_no_work() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::new(vec![Step::Items(2, true), Step::RateLimit(900)]);
        let sync = ResumableSync::new(&db, "players", "players_sync", &transform);

        let outcome = sync.run(&source, &NoopProgress).await.unwrap();
        assert!(!outcome.is_complete);
        let resume_at = outcome.next_resume_time.expect("resume time set");
        assert!(resume_at > Utc::now());

        let suspended = checkpoint::load(&db, "players_sync").await.unwrap();
        assert_eq!(suspended.mode, CheckpointMode::RateLimited);
        assert_eq!(suspended.current_page, 2);

        // Re-invoking before the resume time performs zero calls and leaves
        // the checkpoint untouched.
        let calls_before = source.calls().len();
        let early = sync.run(&source, &NoopProgress).await.unwrap();
        assert!(!early.is_complete);
        assert_eq!(early.next_resume_time, Some(resume_at));
        assert_eq!(source.calls().len(), calls_before);
        let unchanged = checkpoint::load(&db, "players_sync").await.unwrap();
        assert_eq!(unchanged, suspended);
    }

    #[tokio::test]
    async fn non_rate_limit_error_marks_failed_with_last_error() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::new(vec![Step::Items(1, true), Step::Fail]);
        let sync = ResumableSync::new(&db, "players", "players_sync", &transform);

        let outcome = sync.run(&source, &NoopProgress).await.unwrap();
        assert!(!outcome.is_complete);
        assert!(outcome.message.contains("failed on page 2"));

        let cp = checkpoint::load(&db, "players_sync").await.unwrap();
        assert_eq!(cp.mode, CheckpointMode::Failed);
        assert!(cp.last_error.unwrap().contains("connection reset"));
        // Page 1's progress survived.
        assert_eq!(cp.current_page, 2);
        assert_eq!(cp.items_processed, 1);
    }

    #[tokio::test]
    async fn completed_checkpoint_short_circuits() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::new(vec![Step::Items(1, false)]);
        let sync = ResumableSync::new(&db, "players", "players_sync", &transform);

        sync.run(&source, &NoopProgress).await.unwrap();
        let calls_after_first = source.calls().len();

        let again = sync.run(&source, &NoopProgress).await.unwrap();
        assert!(again.is_complete);
        assert_eq!(source.calls().len(), calls_after_first, "no further fetches");
    }

    #[tokio::test]
    async fn reset_allows_full_resync() {
        let db = Database::open_memory().await.unwrap();
        let source = FakeSource::new(vec![Step::Items(1, false)]);
        let sync = ResumableSync::new(&db, "players", "players_sync", &transform);

        sync.run(&source, &NoopProgress).await.unwrap();
        let cp = sync.reset().await.unwrap();
        assert_eq!(cp.mode, CheckpointMode::Fresh);
        assert_eq!(cp.current_page, 1);

        let rerun = sync.run(&source, &NoopProgress).await.unwrap();
        assert!(rerun.is_complete);
        assert_eq!(source.calls(), vec![1, 1]);
        // The re-run hit the same rows: updates, not duplicates.
        assert_eq!(rerun.stats.updated, 1);
        assert_eq!(rerun.stats.created, 0);
    }
}
