//! acd-panel — command-line host for the ACD research panel store
//!
//! Usage:
//!   acd-panel register-pool --file pool.json      — Register a canonical pool
//!   acd-panel record-run --file run.json          — Record a fitted ACD(p,q) run
//!   acd-panel observe --file day.json             — Append daily observations
//!   acd-panel panel --pool 1 --from 2024-01-01 --to 2024-03-31

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use futures_util::TryStreamExt;
use panel::{MetricCandidate, ModelRunCandidate, PoolCandidate, PoolId, SampleWindowUpdate};
use persistence::Database;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "acd-panel")]
#[command(about = "Validated append-only store for the ACD liquidity research panel", long_about = None)]
#[command(version = APP_VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// SQLite database path (falls back to ACD_PANEL_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and its tables
    Init,
    /// Register a pool from a JSON file
    RegisterPool {
        #[arg(long)]
        file: PathBuf,
    },
    /// Update a pool's sample window / in-sample flag (`--clear-end` reopens it)
    RetirePool {
        #[arg(long)]
        pool: i64,
        /// New in-main-sample flag
        #[arg(long)]
        in_sample: Option<bool>,
        #[arg(long, conflicts_with = "clear_start")]
        start: Option<NaiveDate>,
        #[arg(long, conflicts_with = "clear_end")]
        end: Option<NaiveDate>,
        /// Remove the sample start date
        #[arg(long)]
        clear_start: bool,
        /// Remove the sample end date
        #[arg(long)]
        clear_end: bool,
    },
    /// Record an estimation run from a JSON file
    RecordRun {
        #[arg(long)]
        file: PathBuf,
    },
    /// Append observations from a JSON file (one object or an array)
    Observe {
        #[arg(long)]
        file: PathBuf,
    },
    /// Look up a pool id by (chain, pair label, fee tier)
    Lookup {
        #[arg(long)]
        chain: String,
        #[arg(long)]
        pair: String,
        #[arg(long)]
        fee_tier: i64,
    },
    /// Print the most recent run id of a pool
    LatestRun {
        #[arg(long)]
        pool: i64,
    },
    /// List run ids whose estimation starts on or after a date
    Runs {
        #[arg(long)]
        pool: i64,
        #[arg(long)]
        since: NaiveDate,
    },
    /// Print a pool's daily panel (JSON lines)
    Panel {
        #[arg(long)]
        pool: i64,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Print every pool's observation for one date (JSON lines)
    CrossSection {
        #[arg(long)]
        date: NaiveDate,
    },
}

/// Observation files may hold a single record or a batch
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(t) => vec![t],
            OneOrMany::Many(v) => v,
        }
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,persistence=debug,acd_panel=debug,sqlx=info")
    } else {
        EnvFilter::new("info,persistence=info,acd_panel=info,sqlx=warn")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn db_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("ACD_PANEL_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data/panel.db"))
}

fn bound_update(date: Option<NaiveDate>, clear: bool) -> Option<Option<NaiveDate>> {
    if clear {
        Some(None)
    } else {
        date.map(Some)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let path = db_path(cli.db);
    let db = Database::new(&path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("acd-panel v{} using {}", APP_VERSION, path.display());

    match cli.command {
        Commands::Init => {
            info!("Database ready");
        }
        Commands::RegisterPool { file } => {
            let candidate: PoolCandidate = read_json(&file)?;
            let id = db.pools().register(&candidate).await?;
            print_json(&id)?;
        }
        Commands::RetirePool {
            pool,
            in_sample,
            start,
            end,
            clear_start,
            clear_end,
        } => {
            let update = SampleWindowUpdate {
                in_main_sample: in_sample,
                start: bound_update(start, clear_start),
                end: bound_update(end, clear_end),
            };
            let window = db.pools().retire(PoolId(pool), &update).await?;
            print_json(&window)?;
        }
        Commands::RecordRun { file } => {
            let candidate: ModelRunCandidate = read_json(&file)?;
            let id = db.runs().record(candidate).await?;
            print_json(&id)?;
        }
        Commands::Observe { file } => {
            cmd_observe(&db, &file).await?;
        }
        Commands::Lookup {
            chain,
            pair,
            fee_tier,
        } => {
            let id = db
                .pools()
                .lookup_by_business_key(&chain, &pair, fee_tier)
                .await?;
            print_json(&id)?;
        }
        Commands::LatestRun { pool } => {
            let id = db.runs().latest_for_pool(PoolId(pool)).await?;
            print_json(&id)?;
        }
        Commands::Runs { pool, since } => {
            let runs = db.runs();
            let mut stream = runs.runs_in_window(PoolId(pool), since);
            while let Some(id) = stream.try_next().await? {
                print_json(&id)?;
            }
        }
        Commands::Panel { pool, from, to } => {
            let metrics = db.metrics();
            let mut stream = metrics.panel_for_pool(PoolId(pool), from..=to);
            while let Some(obs) = stream.try_next().await? {
                print_json(&obs)?;
            }
        }
        Commands::CrossSection { date } => {
            let metrics = db.metrics();
            let mut stream = metrics.cross_section(date);
            while let Some(obs) = stream.try_next().await? {
                print_json(&obs)?;
            }
        }
    }

    Ok(())
}

/// Each record is accepted or rejected on its own; storage failures abort
async fn cmd_observe(db: &Database, file: &Path) -> anyhow::Result<()> {
    let batch: OneOrMany<MetricCandidate> = read_json(file)?;
    let metrics = db.metrics();

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for candidate in batch.into_vec() {
        match metrics.observe(&candidate).await {
            Ok(_) => accepted += 1,
            Err(e) if e.is_retryable() => return Err(e.into()),
            Err(e) => {
                warn!(
                    "Skipping {} on {}: {}",
                    candidate.pool_id, candidate.trading_date, e
                );
                rejected += 1;
            }
        }
    }

    info!("Observe finished: {} accepted, {} rejected", accepted, rejected);
    Ok(())
}
