//! Pool registry — canonical pool identity records

use crate::{is_unique_violation, DbError, DbResult, PanelError, PanelResult};
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use panel::{
    Clock, ConflictError, Pool, PoolCandidate, PoolId, ReferentialError, SampleWindow,
    SampleWindowUpdate,
};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, FromRow)]
struct PoolRow {
    id: i64,
    chain: String,
    dex: String,
    pool_address: String,
    token_a_symbol: String,
    token_b_symbol: String,
    token_a_address: String,
    token_b_address: String,
    pair_label: String,
    fee_tier_bps: i64,
    in_main_sample: bool,
    sample_start: Option<NaiveDate>,
    sample_end: Option<NaiveDate>,
    created_at: DateTime<Utc>,
}

impl From<PoolRow> for Pool {
    fn from(row: PoolRow) -> Self {
        Pool {
            id: PoolId(row.id),
            chain: row.chain,
            dex: row.dex,
            pool_address: row.pool_address,
            token_a_symbol: row.token_a_symbol,
            token_b_symbol: row.token_b_symbol,
            token_a_address: row.token_a_address,
            token_b_address: row.token_b_address,
            pair_label: row.pair_label,
            fee_tier_bps: row.fee_tier_bps,
            window: SampleWindow {
                in_main_sample: row.in_main_sample,
                start: row.sample_start,
                end: row.sample_end,
            },
            created_at: row.created_at,
        }
    }
}

/// Repository for canonical pools
#[derive(Clone)]
pub struct PoolRegistry {
    pub(crate) pool: SqlitePool,
    clock: Arc<dyn Clock>,
    write_lock: Arc<Mutex<()>>,
}

impl PoolRegistry {
    pub(crate) fn new(pool: SqlitePool, clock: Arc<dyn Clock>, write_lock: Arc<Mutex<()>>) -> Self {
        Self {
            pool,
            clock,
            write_lock,
        }
    }

    /// Validate and append a pool; returns its new id
    pub async fn register(&self, candidate: &PoolCandidate) -> PanelResult<PoolId> {
        let candidate = &candidate.normalized();
        if let Err(e) = candidate.validate() {
            warn!("Pool {} rejected: {}", candidate.pool_address, e);
            return Err(e.into());
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let by_address: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM pools WHERE lower(pool_address) = lower(?1)")
                .bind(&candidate.pool_address)
                .fetch_optional(&mut *tx)
                .await?;
        if by_address.is_some() {
            return Err(self.reject(ConflictError::DuplicateAddress {
                address: candidate.pool_address.clone(),
            }));
        }

        let by_key: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM pools WHERE chain = ?1 AND pair_label = ?2 AND fee_tier_bps = ?3",
        )
        .bind(&candidate.chain)
        .bind(&candidate.pair_label)
        .bind(candidate.fee_tier_bps)
        .fetch_optional(&mut *tx)
        .await?;
        if by_key.is_some() {
            return Err(self.reject(duplicate_key(candidate)));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO pools (
                chain, dex, pool_address,
                token_a_symbol, token_b_symbol, token_a_address, token_b_address,
                pair_label, fee_tier_bps, in_main_sample, sample_start, sample_end,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&candidate.chain)
        .bind(&candidate.dex)
        .bind(&candidate.pool_address)
        .bind(&candidate.token_a_symbol)
        .bind(&candidate.token_b_symbol)
        .bind(&candidate.token_a_address)
        .bind(&candidate.token_b_address)
        .bind(&candidate.pair_label)
        .bind(candidate.fee_tier_bps)
        .bind(candidate.in_main_sample)
        .bind(candidate.sample_start)
        .bind(candidate.sample_end)
        .bind(self.clock.now())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if !is_unique_violation(&e) {
                return PanelError::from(e);
            }
            // constraint backstop: another writer outside this process got there first
            if violates_address_index(&e) {
                self.reject(ConflictError::DuplicateAddress {
                    address: candidate.pool_address.clone(),
                })
            } else {
                self.reject(duplicate_key(candidate))
            }
        })?;

        tx.commit().await?;

        let id = PoolId(result.last_insert_rowid());
        info!(
            "Registered {} {} {} {}bps as {}",
            candidate.chain, candidate.dex, candidate.pair_label, candidate.fee_tier_bps, id
        );
        Ok(id)
    }

    fn reject(&self, conflict: ConflictError) -> PanelError {
        warn!("Pool rejected: {}", conflict);
        conflict.into()
    }

    /// Update the sample window / in-sample flag; the only permitted mutation
    pub async fn retire(
        &self,
        pool_id: PoolId,
        update: &SampleWindowUpdate,
    ) -> PanelResult<SampleWindow> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current: Option<(bool, Option<NaiveDate>, Option<NaiveDate>)> = sqlx::query_as(
            "SELECT in_main_sample, sample_start, sample_end FROM pools WHERE id = ?1",
        )
        .bind(pool_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((in_main_sample, start, end)) = current else {
            warn!("Retire rejected: {} not found", pool_id);
            return Err(ReferentialError::NotFound(pool_id).into());
        };

        let window = SampleWindow {
            in_main_sample,
            start,
            end,
        }
        .apply(update);
        if let Err(e) = window.validate() {
            warn!("Retire of {} rejected: {}", pool_id, e);
            return Err(e.into());
        }

        sqlx::query(
            "UPDATE pools SET in_main_sample = ?1, sample_start = ?2, sample_end = ?3 WHERE id = ?4",
        )
        .bind(window.in_main_sample)
        .bind(window.start)
        .bind(window.end)
        .bind(pool_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            "{} window now in_main_sample={} start={:?} end={:?}",
            pool_id, window.in_main_sample, window.start, window.end
        );
        Ok(window)
    }

    pub async fn exists(&self, pool_id: PoolId) -> DbResult<bool> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pools WHERE id = ?1")
            .bind(pool_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 > 0)
    }

    pub async fn lookup_by_business_key(
        &self,
        chain: &str,
        pair_label: &str,
        fee_tier_bps: i64,
    ) -> DbResult<Option<PoolId>> {
        debug!("Looking up ({}, {}, {})", chain, pair_label, fee_tier_bps);
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM pools WHERE chain = ?1 AND pair_label = ?2 AND fee_tier_bps = ?3",
        )
        .bind(chain.trim())
        .bind(pair_label)
        .bind(fee_tier_bps)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| PoolId(id)))
    }

    /// Case-insensitive lookup by contract address
    pub async fn lookup_by_address(&self, address: &str) -> DbResult<Option<PoolId>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM pools WHERE lower(pool_address) = lower(?1)")
                .bind(address.trim())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| PoolId(id)))
    }

    pub async fn get(&self, pool_id: PoolId) -> DbResult<Option<Pool>> {
        let row = sqlx::query_as::<_, PoolRow>("SELECT * FROM pools WHERE id = ?1")
            .bind(pool_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Pool::from))
    }

    /// All pools, id ascending
    pub fn pools(&self) -> BoxStream<'_, DbResult<Pool>> {
        sqlx::query_as::<_, PoolRow>("SELECT * FROM pools ORDER BY id")
            .fetch(&self.pool)
            .map_ok(Pool::from)
            .map_err(DbError::from)
            .boxed()
    }
}

/// SQLite names the failed index in the message; the business key reports
/// its columns instead
fn violates_address_index(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation() && db.message().contains("idx_pools_address"))
}

fn duplicate_key(candidate: &PoolCandidate) -> ConflictError {
    ConflictError::DuplicateBusinessKey {
        chain: candidate.chain.clone(),
        pair_label: candidate.pair_label.clone(),
        fee_tier_bps: candidate.fee_tier_bps,
    }
}
