use clap::{Parser, Subcommand};

use pitchdw::{ApiClient, Database, PitchDW, SyncOptions};

#[derive(Parser)]
#[command(name = "pitchdw", about = "Football data warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.pitchdw/pitchdw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Page size for API requests (default: provider maximum of 50)
    #[arg(long)]
    page_size: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl pitchdw::SyncProgress for StderrProgress {
    fn on_fetch_start(&self, entity: &str) {
        eprintln!("Fetching {entity}...");
    }

    fn on_page_fetched(&self, entity: &str, page: u32, _count: usize, total_so_far: usize) {
        eprint!("\r  {entity}: {total_so_far} items over {page} pages   ");
    }

    fn on_batch_complete(
        &self,
        entity: &str,
        batch: usize,
        total_batches: usize,
        percent: f64,
        eta_seconds: Option<u64>,
    ) {
        match eta_seconds {
            Some(eta) => eprintln!(
                "\r  {entity}: batch {batch}/{total_batches} ({percent:.0}%, ~{eta}s left)   "
            ),
            None => eprintln!("\r  {entity}: batch {batch}/{total_batches} ({percent:.0}%)   "),
        }
    }

    fn on_page_complete(&self, sync_id: &str, page: u32, items: usize, total_items: u64) {
        eprintln!("  {sync_id}: page {page} done ({items} items, {total_items} total)");
    }

    fn on_rate_limited(&self, entity: &str, resume_at: Option<chrono::DateTime<chrono::Utc>>) {
        match resume_at {
            Some(at) => eprintln!("  {entity}: rate limited, resume after {at}"),
            None => eprintln!("  {entity}: rate limited"),
        }
    }

    fn on_complete(&self, outcome: &pitchdw::SyncOutcome) {
        eprintln!("\r  {}   ", outcome.message);
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync data from the API into the local warehouse
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
    },
    /// Show warehouse status (counts, checkpoints, TTL metadata)
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect or reset the resumable player-sync checkpoint
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print a league table computed from synced fixtures
    Table {
        /// League identifier
        league_id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SyncTarget {
    /// Sync every collection
    All {
        /// Page cap per collection (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        max_pages: u32,
        /// Page cap for the resumable player sync (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        max_pages_per_run: u32,
        /// Ignore TTL gates for rivals and head-to-head data
        #[arg(long)]
        force: bool,
    },
    /// Sync leagues
    Leagues {
        #[arg(long, default_value_t = 0)]
        max_pages: u32,
    },
    /// Sync teams
    Teams {
        #[arg(long, default_value_t = 0)]
        max_pages: u32,
    },
    /// Sync fixtures (with derived excitement scores)
    Fixtures {
        #[arg(long, default_value_t = 0)]
        max_pages: u32,
    },
    /// Sync coaches
    Coaches {
        #[arg(long, default_value_t = 0)]
        max_pages: u32,
    },
    /// Sync players (resumable; re-invoke to continue)
    Players {
        /// Pages to process this invocation (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        max_pages_per_run: u32,
    },
    /// Sync rivalry pairs (TTL-gated)
    Rivals {
        /// Ignore the TTL gate
        #[arg(long)]
        force: bool,
    },
    /// Rebuild head-to-head summaries for known rivalries (TTL-gated)
    H2h {
        /// Ignore the TTL gate
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Show the player-sync checkpoint
    Show,
    /// Reset the player-sync checkpoint, forcing a full re-sync
    Reset,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => Database::open_at(path).await?,
        None => Database::open().await?,
    };

    match cli.command {
        Commands::Sync { target } => {
            let token = pitchdw::resolve_api_token(&db).await?;
            let base_url = pitchdw::resolve_base_url(&db).await?;
            let mut client = ApiClient::new(&base_url, token)?;
            if let Some(page_size) = cli.page_size {
                client = client.with_per_page(page_size);
            }
            let dw = PitchDW::new(db, client);
            run_sync(&dw, target).await?;
        }
        Commands::Status { json } => {
            print_status(&db, json).await?;
        }
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Show => {
                let checkpoint =
                    pitchdw::sync::checkpoint::load(&db, pitchdw::PLAYERS_SYNC_ID).await?;
                println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            }
            CheckpointAction::Reset => {
                pitchdw::sync::checkpoint::reset(&db, pitchdw::PLAYERS_SYNC_ID).await?;
                println!("Checkpoint {} reset", pitchdw::PLAYERS_SYNC_ID);
            }
        },
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => {
                let value = db
                    .reader()
                    .call(move |conn| pitchdw::storage::repository::get_config(conn, &key))
                    .await?;
                match value {
                    Some(value) => println!("{value}"),
                    None => println!("(unset)"),
                }
            }
            ConfigAction::Set { key, value } => {
                db.writer()
                    .call(move |conn| {
                        pitchdw::storage::repository::set_config(conn, &key, &value)
                    })
                    .await?;
            }
            ConfigAction::List => {
                let entries = db
                    .reader()
                    .call(|conn| pitchdw::storage::repository::list_config(conn))
                    .await?;
                for (key, value) in entries {
                    println!("{key} = {value}");
                }
            }
        },
        Commands::Table { league_id, json } => {
            let table = pitchdw::metrics::league_table(&db, league_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&table)?);
            } else {
                println!(
                    "{:<10} {:>3} {:>3} {:>3} {:>3} {:>4} {:>4} {:>4} {:>4}",
                    "Team", "P", "W", "D", "L", "GF", "GA", "GD", "Pts"
                );
                for row in &table {
                    println!(
                        "{:<10} {:>3} {:>3} {:>3} {:>3} {:>4} {:>4} {:>4} {:>4}",
                        row.team_id,
                        row.played,
                        row.won,
                        row.drawn,
                        row.lost,
                        row.goals_for,
                        row.goals_against,
                        row.goal_difference(),
                        row.points
                    );
                }
            }
        }
    }

    Ok(())
}

async fn run_sync(dw: &PitchDW, target: SyncTarget) -> anyhow::Result<()> {
    let progress = StderrProgress;
    match target {
        SyncTarget::All {
            max_pages,
            max_pages_per_run,
            force,
        } => {
            let options = SyncOptions {
                max_pages,
                max_pages_per_run,
                force,
            };
            for outcome in dw.sync_all(&options, &progress).await? {
                print_outcome(&outcome);
            }
        }
        SyncTarget::Leagues { max_pages } => {
            let options = SyncOptions {
                max_pages,
                ..Default::default()
            };
            print_outcome(&dw.sync_leagues(&options, &progress).await);
        }
        SyncTarget::Teams { max_pages } => {
            let options = SyncOptions {
                max_pages,
                ..Default::default()
            };
            print_outcome(&dw.sync_teams(&options, &progress).await);
        }
        SyncTarget::Fixtures { max_pages } => {
            let options = SyncOptions {
                max_pages,
                ..Default::default()
            };
            print_outcome(&dw.sync_fixtures(&options, &progress).await);
        }
        SyncTarget::Coaches { max_pages } => {
            let options = SyncOptions {
                max_pages,
                ..Default::default()
            };
            print_outcome(&dw.sync_coaches(&options, &progress).await);
        }
        SyncTarget::Players { max_pages_per_run } => {
            let options = SyncOptions {
                max_pages_per_run,
                ..Default::default()
            };
            let outcome = dw.sync_players(&options, &progress).await?;
            println!("{}", outcome.message);
            println!("  Pages this run: {}", outcome.pages_processed);
            println!("  Items so far:   {}", outcome.total_items_processed);
            println!("  Complete:       {}", outcome.is_complete);
            if let Some(resume_at) = outcome.next_resume_time {
                println!("  Resume after:   {resume_at}");
            }
        }
        SyncTarget::Rivals { force } => {
            let options = SyncOptions {
                force,
                ..Default::default()
            };
            print_outcome(&dw.sync_rivals(&options, &progress).await?);
        }
        SyncTarget::H2h { force } => {
            let options = SyncOptions {
                force,
                ..Default::default()
            };
            print_outcome(&dw.sync_h2h(&options, &progress).await?);
        }
    }
    Ok(())
}

fn print_outcome(outcome: &pitchdw::SyncOutcome) {
    println!("{}", outcome.message);
    println!("  Created: {}", outcome.stats.created);
    println!("  Updated: {}", outcome.stats.updated);
    println!("  Failed:  {}", outcome.stats.failed);
    for err in outcome.stats.errors.iter().take(10) {
        println!("    {}: {}", err.id, err.message);
    }
    if outcome.stats.errors.len() > 10 {
        println!("    ... and {} more", outcome.stats.errors.len() - 10);
    }
}

async fn print_status(db: &Database, json: bool) -> anyhow::Result<()> {
    let checkpoints = pitchdw::sync::checkpoint::list(db).await?;
    let metadata = pitchdw::sync::ttl::list(db).await?;
    let counts = db
        .reader()
        .call(|conn| {
            let mut counts = Vec::new();
            for table in pitchdw::storage::repository::COLLECTIONS {
                counts.push((
                    (*table).to_string(),
                    pitchdw::storage::repository::count_docs(conn, table)?,
                ));
            }
            Ok::<_, rusqlite::Error>(counts)
        })
        .await?;

    if json {
        let report = serde_json::json!({
            "collections": counts.iter().map(|(t, n)| (t.clone(), n)).collect::<std::collections::BTreeMap<_, _>>(),
            "checkpoints": checkpoints,
            "metadata": metadata,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Collections:");
    for (table, count) in &counts {
        println!("  {table:<14} {count}");
    }
    if !checkpoints.is_empty() {
        println!("Checkpoints:");
        for cp in &checkpoints {
            println!(
                "  {}: page {}, {} items, mode {:?}",
                cp.sync_id, cp.current_page, cp.items_processed, cp.mode
            );
            if let Some(resume_at) = cp.next_resume_time {
                println!("    resume after {resume_at}");
            }
        }
    }
    if !metadata.is_empty() {
        println!("TTL metadata:");
        for meta in &metadata {
            println!(
                "  {}: last synced {}, ttl {} days",
                meta.category, meta.last_sync_at, meta.ttl_days
            );
        }
    }
    Ok(())
}
