use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{repository, Database};

/// Progress mode of a resumable sync. Transitions form a strict lattice:
/// fresh → resuming → {completed | rate-limited | failed}, with
/// rate-limited → resuming on the next eligible invocation. Completed is
/// terminal until an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointMode {
    Fresh,
    Resuming,
    Completed,
    RateLimited,
    Failed,
}

/// Snapshot of the call budget as of the last checkpointed page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateBudget {
    pub calls_used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_call_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativeStats {
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
    pub pages_completed: u32,
}

/// Persisted progress record for one resumable sync, read-modify-written as
/// a whole document after every page. Exactly one invocation drives a given
/// `sync_id` at a time; the scheduler guarantees exclusivity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sync_id: String,
    pub current_page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages_discovered: Option<u32>,
    pub items_processed: u64,
    pub mode: CheckpointMode,
    #[serde(default)]
    pub rate_budget: RateBudget,
    #[serde(default)]
    pub cumulative: CumulativeStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_resume_time: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn fresh(sync_id: impl Into<String>) -> Self {
        Self {
            sync_id: sync_id.into(),
            current_page: 1,
            total_pages_discovered: None,
            items_processed: 0,
            mode: CheckpointMode::Fresh,
            rate_budget: RateBudget::default(),
            cumulative: CumulativeStats::default(),
            last_error: None,
            next_resume_time: None,
        }
    }
}

/// Load the checkpoint for `sync_id`, or a fresh one if none is stored.
pub async fn load(db: &Database, sync_id: &str) -> Result<Checkpoint> {
    let key = sync_id.to_string();
    let doc = db
        .reader()
        .call(move |conn| repository::get_checkpoint_doc(conn, &key))
        .await?;
    match doc {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| Error::Database(format!("corrupt checkpoint for {sync_id}: {e}"))),
        None => Ok(Checkpoint::fresh(sync_id)),
    }
}

/// Persist the checkpoint. A persistence failure is logged and swallowed: it
/// risks reprocessing one page on the next resume, which the idempotent
/// upserts absorb, and must not abort the page's data write.
pub async fn save(db: &Database, checkpoint: &Checkpoint) {
    let json = match serde_json::to_string(checkpoint) {
        Ok(json) => json,
        Err(e) => {
            log::warn!(
                "could not serialize checkpoint {}: {e}",
                checkpoint.sync_id
            );
            return;
        }
    };
    let key = checkpoint.sync_id.clone();
    if let Err(e) = db
        .writer()
        .call(move |conn| repository::set_checkpoint_doc(conn, &key, &json))
        .await
    {
        log::warn!("failed to persist checkpoint {}: {e}", checkpoint.sync_id);
    }
}

/// Restore `fresh` state with zeroed counters, forcing a full re-sync.
pub async fn reset(db: &Database, sync_id: &str) -> Result<Checkpoint> {
    let checkpoint = Checkpoint::fresh(sync_id);
    let json = serde_json::to_string(&checkpoint)?;
    let key = sync_id.to_string();
    db.writer()
        .call(move |conn| repository::set_checkpoint_doc(conn, &key, &json))
        .await?;
    Ok(checkpoint)
}

/// All stored checkpoints; corrupt documents are skipped with a warning.
pub async fn list(db: &Database) -> Result<Vec<Checkpoint>> {
    let rows = db
        .reader()
        .call(|conn| repository::list_checkpoint_docs(conn))
        .await?;
    let mut checkpoints = Vec::with_capacity(rows.len());
    for (sync_id, json) in rows {
        match serde_json::from_str(&json) {
            Ok(checkpoint) => checkpoints.push(checkpoint),
            Err(e) => log::warn!("skipping corrupt checkpoint {sync_id}: {e}"),
        }
    }
    Ok(checkpoints)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&CheckpointMode::RateLimited).unwrap(),
            "\"rate-limited\""
        );
        assert_eq!(
            serde_json::from_str::<CheckpointMode>("\"fresh\"").unwrap(),
            CheckpointMode::Fresh
        );
    }

    #[test]
    fn checkpoint_roundtrips_through_json() {
        let mut checkpoint = Checkpoint::fresh("players_sync");
        checkpoint.current_page = 17;
        checkpoint.items_processed = 800;
        checkpoint.mode = CheckpointMode::RateLimited;
        checkpoint.next_resume_time = Some(Utc::now());
        checkpoint.cumulative.created = 750;
        checkpoint.rate_budget.calls_used = 16;

        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, checkpoint);
    }

    #[tokio::test]
    async fn load_missing_returns_fresh() {
        let db = Database::open_memory().await.unwrap();
        let checkpoint = load(&db, "players_sync").await.unwrap();
        assert_eq!(checkpoint.mode, CheckpointMode::Fresh);
        assert_eq!(checkpoint.current_page, 1);
        assert_eq!(checkpoint.items_processed, 0);
    }

    #[tokio::test]
    async fn save_load_reset_cycle() {
        let db = Database::open_memory().await.unwrap();

        let mut checkpoint = Checkpoint::fresh("players_sync");
        checkpoint.current_page = 9;
        checkpoint.mode = CheckpointMode::Resuming;
        save(&db, &checkpoint).await;

        let loaded = load(&db, "players_sync").await.unwrap();
        assert_eq!(loaded.current_page, 9);
        assert_eq!(loaded.mode, CheckpointMode::Resuming);

        let fresh = reset(&db, "players_sync").await.unwrap();
        assert_eq!(fresh.mode, CheckpointMode::Fresh);
        let reloaded = load(&db, "players_sync").await.unwrap();
        assert_eq!(reloaded.current_page, 1);
        assert_eq!(reloaded.items_processed, 0);
    }
}
