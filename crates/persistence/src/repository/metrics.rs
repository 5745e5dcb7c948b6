//! Metrics panel — daily (pool, date) observations
//!
//! Rows are keyed by (pool, date, data_version). A correction is a new row
//! with a higher version; the highest version of a (pool, date) is the live
//! row and is what the panel queries return. Versions below the live one are
//! refused, so history is never back-filled beneath it.

use crate::repository::ModelRunLedger;
use crate::{is_unique_violation, DbError, DbResult, PanelError, PanelResult};
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use panel::{
    Clock, ConflictError, MetricCandidate, MetricObservation, MetricValues, PoolId,
    ReferentialError, RunId,
};
use sqlx::{FromRow, SqlitePool};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, FromRow)]
struct MetricRow {
    pool_id: i64,
    trading_date: NaiveDate,
    v3_spread_bps: Option<f64>,
    v2_spread_bps: Option<f64>,
    spread_ratio: Option<f64>,
    pool_tvl_usd: Option<f64>,
    pool_volume_usd: Option<f64>,
    pool_swap_count: Option<f64>,
    pair_realized_vol: Option<f64>,
    pair_cex_volume_usd: Option<f64>,
    chain_gas_price_gwei: Option<f64>,
    chain_tx_count: Option<f64>,
    chain_block_time_secs: Option<f64>,
    acd_intensity: Option<f64>,
    model_run_id: Option<i64>,
    data_version: i64,
    created_at: DateTime<Utc>,
}

impl From<MetricRow> for MetricObservation {
    fn from(row: MetricRow) -> Self {
        MetricObservation {
            pool_id: PoolId(row.pool_id),
            trading_date: row.trading_date,
            values: MetricValues {
                v3_spread_bps: row.v3_spread_bps,
                v2_spread_bps: row.v2_spread_bps,
                spread_ratio: row.spread_ratio,
                pool_tvl_usd: row.pool_tvl_usd,
                pool_volume_usd: row.pool_volume_usd,
                pool_swap_count: row.pool_swap_count,
                pair_realized_vol: row.pair_realized_vol,
                pair_cex_volume_usd: row.pair_cex_volume_usd,
                chain_gas_price_gwei: row.chain_gas_price_gwei,
                chain_tx_count: row.chain_tx_count,
                chain_block_time_secs: row.chain_block_time_secs,
                acd_intensity: row.acd_intensity,
            },
            model_run_id: row.model_run_id.map(RunId),
            data_version: row.data_version,
            created_at: row.created_at,
        }
    }
}

/// Keeps only the highest data_version of each (pool, date)
const LIVE_ROW: &str = r#"m.data_version = (
    SELECT MAX(x.data_version) FROM metric_observations x
    WHERE x.pool_id = m.pool_id AND x.trading_date = m.trading_date
)"#;

/// Repository for the daily observation panel
#[derive(Clone)]
pub struct MetricsPanel {
    pool: SqlitePool,
    runs: ModelRunLedger,
    clock: Arc<dyn Clock>,
    write_lock: Arc<Mutex<()>>,
    panel_sql: String,
    cross_section_sql: String,
}

impl MetricsPanel {
    pub(crate) fn new(runs: ModelRunLedger, clock: Arc<dyn Clock>, write_lock: Arc<Mutex<()>>) -> Self {
        Self {
            pool: runs.pools().pool.clone(),
            runs,
            clock,
            write_lock,
            panel_sql: format!(
                "SELECT m.* FROM metric_observations m \
                 WHERE m.pool_id = ?1 AND m.trading_date >= ?2 AND m.trading_date <= ?3 \
                 AND {LIVE_ROW} ORDER BY m.trading_date ASC"
            ),
            cross_section_sql: format!(
                "SELECT m.* FROM metric_observations m \
                 WHERE m.trading_date = ?1 AND {LIVE_ROW} ORDER BY m.pool_id ASC"
            ),
        }
    }

    /// Resolve references, validate, and append one pool-day
    pub async fn observe(&self, candidate: &MetricCandidate) -> PanelResult<MetricObservation> {
        let pool_id = candidate.pool_id;
        let date = candidate.trading_date;

        if !self.runs.pools().exists(pool_id).await? {
            return Err(reject(pool_id, date, ReferentialError::UnknownPool(pool_id)));
        }

        if let Some(run_id) = candidate.model_run_id {
            match self.runs.owner_of(run_id).await? {
                None => return Err(reject(pool_id, date, ReferentialError::UnknownRun(run_id))),
                Some(owner) if owner != pool_id => {
                    return Err(reject(
                        pool_id,
                        date,
                        ReferentialError::CrossPoolRunLink {
                            run_id,
                            run_pool: owner,
                            observation_pool: pool_id,
                        },
                    ))
                }
                Some(_) => {}
            }
        }

        if let Err(e) = candidate.validate() {
            return Err(reject(pool_id, date, e));
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let (same_version,): (i64,) = sqlx::query_as(
            r#"SELECT COUNT(*) FROM metric_observations
               WHERE pool_id = ?1 AND trading_date = ?2 AND data_version = ?3"#,
        )
        .bind(pool_id.0)
        .bind(date)
        .bind(candidate.data_version)
        .fetch_one(&mut *tx)
        .await?;
        if same_version > 0 {
            return Err(reject(pool_id, date, duplicate(candidate)));
        }

        let (live,): (Option<i64>,) = sqlx::query_as(
            "SELECT MAX(data_version) FROM metric_observations WHERE pool_id = ?1 AND trading_date = ?2",
        )
        .bind(pool_id.0)
        .bind(date)
        .fetch_one(&mut *tx)
        .await?;
        if let Some(live) = live.filter(|live| *live > candidate.data_version) {
            return Err(reject(
                pool_id,
                date,
                ConflictError::StaleDataVersion {
                    pool_id,
                    trading_date: date,
                    attempted: candidate.data_version,
                    live,
                },
            ));
        }

        let created_at = self.clock.now();
        let v = &candidate.values;
        sqlx::query(
            r#"
            INSERT INTO metric_observations (
                pool_id, trading_date,
                v3_spread_bps, v2_spread_bps, spread_ratio,
                pool_tvl_usd, pool_volume_usd, pool_swap_count,
                pair_realized_vol, pair_cex_volume_usd,
                chain_gas_price_gwei, chain_tx_count, chain_block_time_secs,
                acd_intensity, model_run_id, data_version, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(pool_id.0)
        .bind(date)
        .bind(v.v3_spread_bps)
        .bind(v.v2_spread_bps)
        .bind(v.spread_ratio)
        .bind(v.pool_tvl_usd)
        .bind(v.pool_volume_usd)
        .bind(v.pool_swap_count)
        .bind(v.pair_realized_vol)
        .bind(v.pair_cex_volume_usd)
        .bind(v.chain_gas_price_gwei)
        .bind(v.chain_tx_count)
        .bind(v.chain_block_time_secs)
        .bind(v.acd_intensity)
        .bind(candidate.model_run_id.map(|r| r.0))
        .bind(candidate.data_version)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                reject(pool_id, date, duplicate(candidate))
            } else {
                PanelError::from(e)
            }
        })?;

        tx.commit().await?;

        info!(
            "Observed {} on {} (v{})",
            pool_id, date, candidate.data_version
        );
        Ok(MetricObservation {
            pool_id,
            trading_date: date,
            values: candidate.values,
            model_run_id: candidate.model_run_id,
            data_version: candidate.data_version,
            created_at,
        })
    }

    /// Live rows of one pool within `dates`, date ascending
    pub fn panel_for_pool(
        &self,
        pool_id: PoolId,
        dates: RangeInclusive<NaiveDate>,
    ) -> BoxStream<'_, DbResult<MetricObservation>> {
        debug!("Panel for {} over {:?}", pool_id, dates);
        sqlx::query_as::<_, MetricRow>(&self.panel_sql)
            .bind(pool_id.0)
            .bind(*dates.start())
            .bind(*dates.end())
            .fetch(&self.pool)
            .map_ok(MetricObservation::from)
            .map_err(DbError::from)
            .boxed()
    }

    /// Live rows of every pool on one date, pool id ascending
    pub fn cross_section(&self, date: NaiveDate) -> BoxStream<'_, DbResult<MetricObservation>> {
        sqlx::query_as::<_, MetricRow>(&self.cross_section_sql)
            .bind(date)
            .fetch(&self.pool)
            .map_ok(MetricObservation::from)
            .map_err(DbError::from)
            .boxed()
    }

    /// Every stored version of one (pool, date), version ascending
    pub fn versions(
        &self,
        pool_id: PoolId,
        date: NaiveDate,
    ) -> BoxStream<'_, DbResult<MetricObservation>> {
        sqlx::query_as::<_, MetricRow>(
            r#"SELECT * FROM metric_observations
               WHERE pool_id = ?1 AND trading_date = ?2
               ORDER BY data_version ASC"#,
        )
        .bind(pool_id.0)
        .bind(date)
        .fetch(&self.pool)
        .map_ok(MetricObservation::from)
        .map_err(DbError::from)
        .boxed()
    }

    pub async fn live_observation(
        &self,
        pool_id: PoolId,
        date: NaiveDate,
    ) -> DbResult<Option<MetricObservation>> {
        let row = sqlx::query_as::<_, MetricRow>(
            r#"SELECT * FROM metric_observations
               WHERE pool_id = ?1 AND trading_date = ?2
               ORDER BY data_version DESC LIMIT 1"#,
        )
        .bind(pool_id.0)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(MetricObservation::from))
    }
}

fn duplicate(candidate: &MetricCandidate) -> ConflictError {
    ConflictError::DuplicateObservation {
        pool_id: candidate.pool_id,
        trading_date: candidate.trading_date,
        data_version: candidate.data_version,
    }
}

fn reject(pool_id: PoolId, date: NaiveDate, err: impl Into<PanelError>) -> PanelError {
    let err = err.into();
    warn!("Observation {} on {} rejected: {}", pool_id, date, err);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use panel::{ModelRunCandidate, PoolCandidate, ShapeParameters, ValidationError};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn register(db: &Database, a: &str, b: &str, address: &str) -> PoolId {
        db.pools()
            .register(&PoolCandidate {
                chain: "ethereum".into(),
                dex: "uniswap".into(),
                pool_address: address.into(),
                token_a_symbol: a.into(),
                token_b_symbol: b.into(),
                token_a_address: format!("0x{a}"),
                token_b_address: format!("0x{b}"),
                pair_label: format!("{a}-{b}"),
                fee_tier_bps: 30,
                in_main_sample: true,
                sample_start: None,
                sample_end: None,
            })
            .await
            .unwrap()
    }

    async fn record_run(db: &Database, pool_id: PoolId) -> RunId {
        db.runs()
            .record(ModelRunCandidate {
                pool_id,
                p: 0,
                q: 1,
                innovation: "exponential".into(),
                shapes: ShapeParameters::default(),
                duration_unit: "blocks".into(),
                diurnal_adjusted: false,
                sample_size: 800,
                intercept: 0.3,
                duration_coefs: vec![0.2],
                psi_coefs: vec![],
                stationarity_slack: 0.01,
                psi_lags: vec![],
                theta_hat: vec![0.3, 0.2],
                log_likelihood: -512.0,
                optimizer_status: "converged".into(),
                iterations: None,
                grad_norm: None,
                estimation_start: date(2023, 10, 1),
                estimation_end: date(2023, 12, 31),
            })
            .await
            .unwrap()
    }

    fn obs(pool_id: PoolId, day: NaiveDate, spread: f64) -> MetricCandidate {
        let mut c = MetricCandidate::new(pool_id, day);
        c.values.v3_spread_bps = Some(spread);
        c
    }

    #[tokio::test]
    async fn test_unknown_pool() {
        let db = Database::in_memory().await.unwrap();
        let err = db
            .metrics()
            .observe(&obs(PoolId(5), date(2024, 1, 1), 1.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PanelError::Referential(ReferentialError::UnknownPool(PoolId(5)))
        ));
    }

    #[tokio::test]
    async fn test_run_link_must_exist_and_match_pool() {
        let db = Database::in_memory().await.unwrap();
        let eth = register(&db, "WETH", "USDC", "0x1").await;
        let btc = register(&db, "WBTC", "USDC", "0x2").await;
        let eth_run = record_run(&db, eth).await;
        let panel = db.metrics();

        let mut c = obs(btc, date(2024, 1, 1), 2.0);
        c.model_run_id = Some(eth_run);
        let err = panel.observe(&c).await.unwrap_err();
        assert!(matches!(
            err,
            PanelError::Referential(ReferentialError::CrossPoolRunLink { run_pool, observation_pool, .. })
                if run_pool == eth && observation_pool == btc
        ));

        c.model_run_id = Some(RunId(999));
        let err = panel.observe(&c).await.unwrap_err();
        assert!(matches!(
            err,
            PanelError::Referential(ReferentialError::UnknownRun(RunId(999)))
        ));

        let mut c = obs(eth, date(2024, 1, 1), 2.0);
        c.model_run_id = Some(eth_run);
        let stored = panel.observe(&c).await.unwrap();
        assert_eq!(stored.model_run_id, Some(eth_run));
    }

    #[tokio::test]
    async fn test_negative_zero_and_absent() {
        let db = Database::in_memory().await.unwrap();
        let pool_id = register(&db, "WETH", "USDC", "0x1").await;
        let panel = db.metrics();

        let mut c = MetricCandidate::new(pool_id, date(2024, 1, 2));
        c.values.chain_gas_price_gwei = Some(-3.0);
        let err = panel.observe(&c).await.unwrap_err();
        assert!(matches!(
            err,
            PanelError::Validation(ValidationError::NegativeField {
                field: "chain_gas_price_gwei"
            })
        ));

        c.values.chain_gas_price_gwei = Some(0.0);
        panel.observe(&c).await.unwrap();

        let mut c = MetricCandidate::new(pool_id, date(2024, 1, 3));
        c.values.chain_gas_price_gwei = None;
        let stored = panel.observe(&c).await.unwrap();
        assert_eq!(stored.values, MetricValues::default());

        let back = panel
            .live_observation(pool_id, date(2024, 1, 3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back.values.chain_gas_price_gwei, None);
    }

    #[tokio::test]
    async fn test_duplicate_even_with_different_payload() {
        let db = Database::in_memory().await.unwrap();
        let pool_id = register(&db, "WETH", "USDC", "0x1").await;
        let panel = db.metrics();

        panel.observe(&obs(pool_id, date(2024, 1, 1), 5.0)).await.unwrap();
        for spread in [5.0, 7.5] {
            let err = panel
                .observe(&obs(pool_id, date(2024, 1, 1), spread))
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                PanelError::Conflict(ConflictError::DuplicateObservation { data_version: 1, .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_corrections_bump_the_version() {
        let db = Database::in_memory().await.unwrap();
        let pool_id = register(&db, "WETH", "USDC", "0x1").await;
        let panel = db.metrics();
        let day = date(2024, 1, 1);

        panel.observe(&obs(pool_id, day, 5.0)).await.unwrap();
        let mut fix = obs(pool_id, day, 4.2);
        fix.data_version = 3;
        panel.observe(&fix).await.unwrap();

        // live row is the corrected one
        let live = panel.live_observation(pool_id, day).await.unwrap().unwrap();
        assert_eq!(live.data_version, 3);
        assert_eq!(live.values.v3_spread_bps, Some(4.2));

        // history is kept
        let history: Vec<_> = panel
            .versions(pool_id, day)
            .map_ok(|o| o.data_version)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(history, vec![1, 3]);

        // cannot slide a version in beneath the live one
        let mut late = obs(pool_id, day, 4.0);
        late.data_version = 2;
        let err = panel.observe(&late).await.unwrap_err();
        assert!(matches!(
            err,
            PanelError::Conflict(ConflictError::StaleDataVersion { attempted: 2, live: 3, .. })
        ));

        let mut zero = obs(pool_id, day, 4.0);
        zero.data_version = 0;
        let err = panel.observe(&zero).await.unwrap_err();
        assert!(matches!(
            err,
            PanelError::Validation(ValidationError::NonPositiveDataVersion(0))
        ));
    }

    #[tokio::test]
    async fn test_panel_for_pool_returns_live_rows_in_date_order() {
        let db = Database::in_memory().await.unwrap();
        let pool_id = register(&db, "WETH", "USDC", "0x1").await;
        let other = register(&db, "WBTC", "USDC", "0x2").await;
        let panel = db.metrics();

        for d in [5, 3, 1, 4, 2] {
            panel.observe(&obs(pool_id, date(2024, 1, d), d as f64)).await.unwrap();
        }
        panel.observe(&obs(other, date(2024, 1, 3), 99.0)).await.unwrap();
        let mut fix = obs(pool_id, date(2024, 1, 3), 30.0);
        fix.data_version = 2;
        panel.observe(&fix).await.unwrap();

        let rows: Vec<_> = panel
            .panel_for_pool(pool_id, date(2024, 1, 2)..=date(2024, 1, 4))
            .try_collect()
            .await
            .unwrap();
        let dates: Vec<_> = rows.iter().map(|o| o.trading_date).collect();
        assert_eq!(dates, vec![date(2024, 1, 2), date(2024, 1, 3), date(2024, 1, 4)]);
        assert_eq!(rows[1].values.v3_spread_bps, Some(30.0));
        assert!(rows.iter().all(|o| o.pool_id == pool_id));

        // restartable: a second pass sees the same rows
        let again: Vec<_> = panel
            .panel_for_pool(pool_id, date(2024, 1, 2)..=date(2024, 1, 4))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows, again);
    }

    #[tokio::test]
    async fn test_cross_section_by_pool_id() {
        let db = Database::in_memory().await.unwrap();
        let a = register(&db, "WETH", "USDC", "0x1").await;
        let b = register(&db, "WBTC", "USDC", "0x2").await;
        let c = register(&db, "LINK", "WETH", "0x3").await;
        let panel = db.metrics();
        let day = date(2024, 2, 29);

        for id in [c, a, b] {
            panel.observe(&obs(id, day, 1.0)).await.unwrap();
        }
        panel.observe(&obs(a, date(2024, 3, 1), 1.0)).await.unwrap();

        let pools: Vec<_> = panel
            .cross_section(day)
            .map_ok(|o| o.pool_id)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(pools, vec![a, b, c]);

        let empty: Vec<_> = panel.cross_section(date(2020, 1, 1)).try_collect().await.unwrap();
        assert!(empty.is_empty());
    }
}
