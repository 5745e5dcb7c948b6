//! Persistence layer for the ACD research panel
//!
//! Provides SQLite storage for the three append-only record sets
//! (pools, model runs, daily metric observations) behind one repository
//! per component.

pub mod repository;
pub mod schema;

use panel::{Clock, ConflictError, ReferentialError, SystemClock, ValidationError};
pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

pub use repository::{MetricsPanel, ModelRunLedger, PoolRegistry};

/// Failure of the storage collaborator itself
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Corrupt row: {0}")]
    Decode(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Every way a write can be refused
#[derive(Error, Debug)]
pub enum PanelError {
    #[error("invalid record: {0}")]
    Validation(#[from] ValidationError),

    #[error("broken reference: {0}")]
    Referential(#[from] ReferentialError),

    #[error("conflict: {0}")]
    Conflict(#[from] ConflictError),

    #[error("storage unavailable: {0}")]
    Storage(#[from] DbError),
}

impl From<sqlx::Error> for PanelError {
    fn from(e: sqlx::Error) -> Self {
        PanelError::Storage(DbError::Sqlx(e))
    }
}

impl PanelError {
    /// Only storage failures are worth retrying unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, PanelError::Storage(_))
    }
}

pub type PanelResult<T> = Result<T, PanelError>;

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// One exclusive section per component around check-then-append
#[derive(Default)]
pub(crate) struct WriteLocks {
    pub pools: Arc<Mutex<()>>,
    pub runs: Arc<Mutex<()>>,
    pub metrics: Arc<Mutex<()>>,
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    locks: WriteLocks,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let options = Self::connect_options(&url)?.journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self::from_pool(pool);
        db.run_migrations().await?;

        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub async fn in_memory() -> DbResult<Self> {
        // Every connection to :memory: is a fresh database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(Self::connect_options("sqlite::memory:")?)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self::from_pool(pool);
        db.run_migrations().await?;

        Ok(db)
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            locks: WriteLocks::default(),
        }
    }

    /// Replace the clock used for creation timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Per-connection pragmas
    fn connect_options(url: &str) -> DbResult<SqliteConnectOptions> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| DbError::Connection(format!("invalid url {url}: {e}")))?
            // NORMAL sync: good balance of safety and performance
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            // 8 MB cache size (negative = KiB)
            .pragma("cache_size", "-8000");
        Ok(options)
    }

    /// Run database migrations (execute each statement individually)
    async fn run_migrations(&self) -> DbResult<()> {
        for statement in schema::CREATE_TABLES.split(';') {
            // Strip comment-only lines, then check if any SQL remains
            let sql: String = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let sql = sql.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
        }

        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn pools(&self) -> PoolRegistry {
        PoolRegistry::new(
            self.pool.clone(),
            self.clock.clone(),
            self.locks.pools.clone(),
        )
    }

    pub fn runs(&self) -> ModelRunLedger {
        ModelRunLedger::new(self.pools(), self.clock.clone(), self.locks.runs.clone())
    }

    pub fn metrics(&self) -> MetricsPanel {
        MetricsPanel::new(self.runs(), self.clock.clone(), self.locks.metrics.clone())
    }
}
