use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::api::models::item_id;
use crate::error::Error;
use crate::storage::repository::{self, UpsertKind};
use crate::storage::Database;
use crate::sync::{SyncDoc, SyncOutcome, SyncProgress, SyncStats, TransformFn};

/// Items per processing batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Permits for the per-item write fallback; separate from the HTTP gate.
pub const DEFAULT_WRITE_CONCURRENCY: usize = 5;

/// The generic fetch→transform→diff→bulk-upsert pipeline for one collection.
///
/// The caller supplies the fetched items (from the paginated engine or any
/// custom fetch), so `run` itself never reports failure: per-item problems
/// land in the stats and a top-level fetch failure is the caller's outcome.
pub struct SyncService<'a> {
    db: &'a Database,
    collection: &'static str,
    label: String,
    batch_size: usize,
    write_concurrency: usize,
}

impl<'a> SyncService<'a> {
    pub fn new(db: &'a Database, collection: &'static str, label: impl Into<String>) -> Self {
        Self {
            db,
            collection,
            label: label.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn run(
        &self,
        items: Vec<Value>,
        transform: &TransformFn,
        progress: &dyn SyncProgress,
    ) -> SyncOutcome {
        let mut stats = SyncStats::new();
        let started = Instant::now();
        let total_items = items.len();
        let total_batches = total_items.div_ceil(self.batch_size);

        for (index, chunk) in items.chunks(self.batch_size).enumerate() {
            // Transform each item independently; a failure is recorded and
            // excluded, never fatal to the batch.
            let mut docs: Vec<SyncDoc> = Vec::with_capacity(chunk.len());
            for raw in chunk {
                match transform(raw) {
                    Ok(doc) => docs.push(doc),
                    Err(e) => {
                        let id = match &e {
                            Error::Transform { id, .. } => id.clone(),
                            _ => item_id(raw),
                        };
                        stats.record_error(id, e.to_string());
                    }
                }
            }

            self.write_batch(docs, &mut stats).await;

            let completed = ((index + 1) * self.batch_size).min(total_items);
            let percent = if total_items > 0 {
                completed as f64 / total_items as f64 * 100.0
            } else {
                100.0
            };
            let eta_seconds = if completed > 0 && completed < total_items {
                let per_item = started.elapsed().as_secs_f64() / completed as f64;
                Some((per_item * (total_items - completed) as f64) as u64)
            } else {
                None
            };
            progress.on_batch_complete(&self.label, index + 1, total_batches, percent, eta_seconds);
        }

        stats.finish();
        let outcome = SyncOutcome {
            success: true,
            message: format!(
                "{}: {} created, {} updated, {} failed",
                self.label, stats.created, stats.updated, stats.failed
            ),
            stats,
        };
        progress.on_complete(&outcome);
        outcome
    }

    /// Diff one transformed batch against the store and write it: one
    /// existence query, then an unordered bulk insert for the new rows and an
    /// unordered bulk update for the rest. A bulk operation failing as a
    /// whole drops to per-item upserts so the batch is never silently lost.
    async fn write_batch(&self, docs: Vec<SyncDoc>, stats: &mut SyncStats) {
        if docs.is_empty() {
            return;
        }

        let collection = self.collection;
        let ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
        let existing = match self
            .db
            .reader()
            .call(move |conn| repository::find_existing_ids(conn, collection, &ids))
            .await
        {
            Ok(set) => set,
            Err(e) => {
                log::warn!(
                    "{}: existence query failed ({e}); falling back to per-item upserts",
                    self.label
                );
                self.upsert_individually(docs, stats).await;
                return;
            }
        };

        let (updates, creates): (Vec<SyncDoc>, Vec<SyncDoc>) =
            docs.into_iter().partition(|d| existing.contains(&d.id));

        if !creates.is_empty() {
            let payload = creates.clone();
            match self
                .db
                .writer()
                .call(move |conn| repository::insert_docs(conn, collection, &payload))
                .await
            {
                Ok(result) => {
                    stats.created += result.written;
                    for (id, message) in result.errors {
                        stats.record_error(id, message);
                    }
                }
                Err(e) => {
                    log::warn!(
                        "{}: bulk insert failed as a whole ({e}); retrying items individually",
                        self.label
                    );
                    self.upsert_individually(creates, stats).await;
                }
            }
        }

        if !updates.is_empty() {
            let payload = updates.clone();
            match self
                .db
                .writer()
                .call(move |conn| repository::update_docs(conn, collection, &payload))
                .await
            {
                Ok(result) => {
                    stats.updated += result.written;
                    for (id, message) in result.errors {
                        stats.record_error(id, message);
                    }
                }
                Err(e) => {
                    log::warn!(
                        "{}: bulk update failed as a whole ({e}); retrying items individually",
                        self.label
                    );
                    self.upsert_individually(updates, stats).await;
                }
            }
        }
    }

    /// Per-item fallback under its own bounded write limiter. `upsert_doc`
    /// re-checks existence per item, so counts stay exact even if the failed
    /// bulk attempt partially applied.
    async fn upsert_individually(&self, docs: Vec<SyncDoc>, stats: &mut SyncStats) {
        let semaphore = Arc::new(Semaphore::new(self.write_concurrency));
        let collection = self.collection;
        let mut handles = Vec::with_capacity(docs.len());

        for doc in docs {
            let semaphore = Arc::clone(&semaphore);
            let db = self.db.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let id = doc.id.clone();
                let result = db
                    .writer()
                    .call(move |conn| repository::upsert_doc(conn, collection, &doc))
                    .await;
                (id, result)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((_id, Ok(UpsertKind::Created))) => stats.created += 1,
                Ok((_id, Ok(UpsertKind::Updated))) => stats.updated += 1,
                Ok((id, Err(e))) => stats.record_error(id, e.to_string()),
                Err(e) => stats.record_error("<task>", format!("task panic: {e}")),
            }
        }
    }
}
