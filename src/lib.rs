pub mod api;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod sync;

pub use api::{ApiClient, DEFAULT_PER_PAGE};
pub use error::{Error, Result};
pub use storage::Database;
pub use sync::rate_limit::{EntityRateStatus, RateLimiter};
pub use sync::resumable::ResumableOutcome;
pub use sync::{NoopProgress, SyncOptions, SyncOutcome, SyncProgress, SyncStats};

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use api::models;
use api::paginate::fetch_all_pages;
use api::ApiPageSource;
use storage::repository::{self, UpsertKind};
use sync::checkpoint::{self, Checkpoint};
use sync::resumable::ResumableSync;
use sync::retry::{retry_call, run_batched, DEFAULT_MAX_ATTEMPTS};
use sync::service::SyncService;
use sync::ttl;

/// Default API base URL; override with the `api_base_url` config key.
pub const DEFAULT_BASE_URL: &str = "https://api.sportmonks.com/v3/football";

/// Sync identifier for the resumable player sync.
pub const PLAYERS_SYNC_ID: &str = "players_sync";

const RIVALS_CATEGORY: &str = "rivals_data";
const H2H_CATEGORY: &str = "h2h_data";
/// Concurrency for per-pair head-to-head fetches.
const H2H_FETCH_CONCURRENCY: usize = 3;

/// Warehouse status snapshot for the CLI.
#[derive(Debug, serde::Serialize)]
pub struct StatusReport {
    pub rate: Vec<EntityRateStatus>,
    pub checkpoints: Vec<Checkpoint>,
    pub metadata: Vec<ttl::SyncMetadata>,
    pub collection_counts: Vec<(String, u64)>,
}

/// Resolve the API token: environment first, then stored config.
pub async fn resolve_api_token(db: &Database) -> Result<String> {
    if let Ok(token) = std::env::var("PITCHDW_API_TOKEN") {
        if !token.is_empty() {
            return Ok(token);
        }
    }
    let stored = db
        .reader()
        .call(|conn| repository::get_config(conn, "api_token"))
        .await?;
    stored.ok_or_else(|| {
        Error::Config(
            "no API token configured. Set PITCHDW_API_TOKEN or run: \
             pitchdw config set api_token <TOKEN>"
                .into(),
        )
    })
}

/// Resolve the API base URL from config, defaulting to the provider's.
pub async fn resolve_base_url(db: &Database) -> Result<String> {
    let stored = db
        .reader()
        .call(|conn| repository::get_config(conn, "api_base_url"))
        .await?;
    Ok(stored.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()))
}

/// Main entry point for the football data warehouse.
pub struct PitchDW {
    db: Database,
    client: ApiClient,
    limiter: Arc<RateLimiter>,
}

impl PitchDW {
    pub fn new(db: Database, client: ApiClient) -> Self {
        Self {
            db,
            client,
            limiter: Arc::new(RateLimiter::with_defaults()),
        }
    }

    /// Swap in a custom limiter (smaller budgets, isolated tests).
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    async fn collect(
        &self,
        entity: &str,
        endpoint: &str,
        max_pages: u32,
        progress: &dyn SyncProgress,
    ) -> Result<Vec<Value>> {
        let source = ApiPageSource::new(&self.client, &self.limiter, entity, endpoint);
        fetch_all_pages(&source, max_pages, entity, progress).await
    }

    // ── Sync commands ──────────────────────────────────────────────

    pub async fn sync_leagues(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> SyncOutcome {
        match self
            .collect("leagues", "/leagues", options.max_pages, progress)
            .await
        {
            Ok(items) => {
                SyncService::new(&self.db, "leagues", "leagues")
                    .run(items, &models::transform_league, progress)
                    .await
            }
            Err(e) => SyncOutcome::fetch_failed("leagues", &e),
        }
    }

    pub async fn sync_teams(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> SyncOutcome {
        match self
            .collect("teams", "/teams", options.max_pages, progress)
            .await
        {
            Ok(items) => {
                SyncService::new(&self.db, "teams", "teams")
                    .run(items, &models::transform_team, progress)
                    .await
            }
            Err(e) => SyncOutcome::fetch_failed("teams", &e),
        }
    }

    pub async fn sync_fixtures(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> SyncOutcome {
        match self
            .collect("fixtures", "/fixtures", options.max_pages, progress)
            .await
        {
            Ok(items) => {
                SyncService::new(&self.db, "fixtures", "fixtures")
                    .run(items, &models::transform_fixture, progress)
                    .await
            }
            Err(e) => SyncOutcome::fetch_failed("fixtures", &e),
        }
    }

    pub async fn sync_coaches(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> SyncOutcome {
        match self
            .collect("coaches", "/coaches", options.max_pages, progress)
            .await
        {
            Ok(items) => {
                SyncService::new(&self.db, "coaches", "coaches")
                    .run(items, &models::transform_coach, progress)
                    .await
            }
            Err(e) => SyncOutcome::fetch_failed("coaches", &e),
        }
    }

    /// Players are the largest collection (tens of thousands of records) and
    /// go through the checkpoint-based resumable loop instead of a full
    /// in-memory fetch.
    pub async fn sync_players(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> Result<ResumableOutcome> {
        let source = ApiPageSource::new(&self.client, &self.limiter, "players", "/players");
        ResumableSync::new(
            &self.db,
            "players",
            PLAYERS_SYNC_ID,
            &models::transform_player,
        )
        .with_max_pages_per_run(options.max_pages_per_run)
        .run(&source, progress)
        .await
    }

    /// Force the next player sync to start over from page 1.
    pub async fn reset_players_checkpoint(&self) -> Result<Checkpoint> {
        checkpoint::reset(&self.db, PLAYERS_SYNC_ID).await
    }

    /// Rivalry pairs change rarely; gated behind a TTL so routine invocations
    /// skip the fetch.
    pub async fn sync_rivals(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> Result<SyncOutcome> {
        if !options.force && !ttl::should_sync(&self.db, RIVALS_CATEGORY).await? {
            return Ok(SyncOutcome::skipped("rivals"));
        }
        let outcome = match self
            .collect("rivals", "/rivals", options.max_pages, progress)
            .await
        {
            Ok(items) => {
                SyncService::new(&self.db, "rivals", "rivals")
                    .run(items, &models::transform_rival_pair, progress)
                    .await
            }
            Err(e) => return Ok(SyncOutcome::fetch_failed("rivals", &e)),
        };
        if outcome.success {
            ttl::record_sync(&self.db, RIVALS_CATEGORY, ttl::DEFAULT_TTL_DAYS).await?;
        }
        Ok(outcome)
    }

    /// Recompute head-to-head summaries for every known rivalry pair: one
    /// API call per pair, so this is TTL-gated onto a slower cadence than
    /// the primary entity syncs.
    pub async fn sync_h2h(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> Result<SyncOutcome> {
        if !options.force && !ttl::should_sync(&self.db, H2H_CATEGORY).await? {
            return Ok(SyncOutcome::skipped("h2h"));
        }

        let rows = self
            .db
            .reader()
            .call(|conn| repository::all_docs(conn, "rivals"))
            .await?;
        let pairs: BTreeSet<(i64, i64)> = rows
            .into_iter()
            .filter_map(|(_, json)| serde_json::from_str::<models::RivalPair>(&json).ok())
            .map(|p| (p.team_id.min(p.rival_id), p.team_id.max(p.rival_id)))
            .collect();
        let pairs: Vec<(i64, i64)> = pairs.into_iter().collect();

        progress.on_fetch_start("h2h");
        let mut stats = SyncStats::new();

        let client = self.client.clone();
        let limiter = Arc::clone(&self.limiter);
        let db = self.db.clone();
        let results = run_batched(pairs.clone(), H2H_FETCH_CONCURRENCY, move |pair| {
            fetch_h2h_pair(client.clone(), Arc::clone(&limiter), db.clone(), pair)
        })
        .await;

        for (pair, result) in pairs.iter().zip(results) {
            match result {
                Ok(UpsertKind::Created) => stats.created += 1,
                Ok(UpsertKind::Updated) => stats.updated += 1,
                Err(e) => stats.record_error(format!("{}:{}", pair.0, pair.1), e.to_string()),
            }
        }
        stats.finish();

        let outcome = SyncOutcome {
            success: true,
            message: format!(
                "h2h: {} created, {} updated, {} failed over {} pairs",
                stats.created,
                stats.updated,
                stats.failed,
                pairs.len()
            ),
            stats,
        };
        progress.on_complete(&outcome);

        ttl::record_sync(&self.db, H2H_CATEGORY, ttl::DEFAULT_TTL_DAYS).await?;
        Ok(outcome)
    }

    /// Sync every collection in dependency order.
    pub async fn sync_all(
        &self,
        options: &SyncOptions,
        progress: &dyn SyncProgress,
    ) -> Result<Vec<SyncOutcome>> {
        let mut outcomes = Vec::new();
        outcomes.push(self.sync_leagues(options, progress).await);
        outcomes.push(self.sync_teams(options, progress).await);
        outcomes.push(self.sync_fixtures(options, progress).await);
        outcomes.push(self.sync_coaches(options, progress).await);

        match self.sync_players(options, progress).await {
            Ok(resumable) => outcomes.push(SyncOutcome {
                success: true,
                message: resumable.message.clone(),
                stats: resumable.stats,
            }),
            Err(e) => outcomes.push(SyncOutcome::fetch_failed("players", &e)),
        }

        outcomes.push(self.sync_rivals(options, progress).await?);
        outcomes.push(self.sync_h2h(options, progress).await?);
        Ok(outcomes)
    }

    // ── Status / config ────────────────────────────────────────────

    pub async fn status(&self) -> Result<StatusReport> {
        let checkpoints = checkpoint::list(&self.db).await?;
        let metadata = ttl::list(&self.db).await?;
        let collection_counts = self
            .db
            .reader()
            .call(|conn| {
                let mut counts = Vec::new();
                for table in repository::COLLECTIONS {
                    counts.push(((*table).to_string(), repository::count_docs(conn, table)?));
                }
                Ok::<_, rusqlite::Error>(counts)
            })
            .await?;
        Ok(StatusReport {
            rate: self.limiter.status(),
            checkpoints,
            metadata,
            collection_counts,
        })
    }

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.db
            .reader()
            .call(move |conn| repository::get_config(conn, &key))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.db
            .writer()
            .call(move |conn| repository::set_config(conn, &key, &value))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

/// Fetch one rivalry pair's meeting history and upsert its summary record.
async fn fetch_h2h_pair(
    client: ApiClient,
    limiter: Arc<RateLimiter>,
    db: Database,
    pair: (i64, i64),
) -> Result<UpsertKind> {
    let (team_a, team_b) = pair;
    let endpoint = format!("/head-to-head/{team_a}/{team_b}");
    let context = format!("h2h {team_a}:{team_b}");

    let page = retry_call!(
        limiter.execute("h2h", || client.fetch_page(&endpoint, &[], 1)),
        context,
        DEFAULT_MAX_ATTEMPTS
    )?;
    if let Some(ref info) = page.rate_limit {
        limiter.reconcile("h2h", info);
    }

    let fixtures: Vec<models::Fixture> = page
        .items
        .iter()
        .filter_map(|raw| serde_json::from_value(raw.clone()).ok())
        .collect();
    let summary = models::summarize_h2h(team_a, team_b, &fixtures);
    let doc = summary.to_sync_doc()?;

    db.writer()
        .call(move |conn| repository::upsert_doc(conn, "h2h_records", &doc))
        .await
        .map_err(Error::from)
}
