//! Model run ledger — immutable ACD(p,q) estimation runs

use crate::repository::PoolRegistry;
use crate::{DbError, DbResult, PanelResult};
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::future;
use futures_util::stream::{BoxStream, StreamExt, TryStreamExt};
use panel::{
    Clock, ModelRun, ModelRunCandidate, PoolId, ReferentialError, RunId, ShapeParameters,
    ValidatedModelRun,
};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, FromRow)]
struct ModelRunRow {
    id: i64,
    pool_id: i64,
    p: i64,
    q: i64,
    innovation: String,
    weibull_shape: Option<f64>,
    gengamma_kappa: Option<f64>,
    gengamma_nu: Option<f64>,
    duration_unit: String,
    diurnal_adjusted: bool,
    sample_size: i64,
    intercept: f64,
    duration_coefs: String,
    psi_coefs: String,
    stationarity_slack: f64,
    psi_lags: String,
    theta_hat: String,
    log_likelihood: f64,
    optimizer_status: String,
    iterations: Option<i64>,
    grad_norm: Option<f64>,
    estimation_start: NaiveDate,
    estimation_end: NaiveDate,
    created_at: DateTime<Utc>,
}

fn decode_vector(id: i64, column: &str, json: &str) -> DbResult<Vec<f64>> {
    serde_json::from_str(json)
        .map_err(|e| DbError::Decode(format!("model_runs[{id}].{column}: {e}")))
}

fn encode_vector(v: &[f64]) -> DbResult<String> {
    serde_json::to_string(v).map_err(|e| DbError::Decode(e.to_string()))
}

impl TryFrom<ModelRunRow> for ModelRun {
    type Error = DbError;

    /// Rows go back through the same checks as candidates
    fn try_from(row: ModelRunRow) -> DbResult<Self> {
        let id = row.id;
        let candidate = ModelRunCandidate {
            pool_id: PoolId(row.pool_id),
            p: row.p,
            q: row.q,
            innovation: row.innovation,
            shapes: ShapeParameters {
                weibull_shape: row.weibull_shape,
                gengamma_kappa: row.gengamma_kappa,
                gengamma_nu: row.gengamma_nu,
            },
            duration_unit: row.duration_unit,
            diurnal_adjusted: row.diurnal_adjusted,
            sample_size: row.sample_size,
            intercept: row.intercept,
            duration_coefs: decode_vector(id, "duration_coefs", &row.duration_coefs)?,
            psi_coefs: decode_vector(id, "psi_coefs", &row.psi_coefs)?,
            stationarity_slack: row.stationarity_slack,
            psi_lags: decode_vector(id, "psi_lags", &row.psi_lags)?,
            theta_hat: decode_vector(id, "theta_hat", &row.theta_hat)?,
            log_likelihood: row.log_likelihood,
            optimizer_status: row.optimizer_status,
            iterations: row.iterations,
            grad_norm: row.grad_norm,
            estimation_start: row.estimation_start,
            estimation_end: row.estimation_end,
        };
        let fit = candidate
            .validate()
            .map_err(|e| DbError::Decode(format!("model_runs[{id}]: {e}")))?;

        Ok(ModelRun {
            id: RunId(id),
            fit,
            created_at: row.created_at,
        })
    }
}

/// Repository for estimation runs
#[derive(Clone)]
pub struct ModelRunLedger {
    pool: SqlitePool,
    pools: PoolRegistry,
    clock: Arc<dyn Clock>,
    write_lock: Arc<Mutex<()>>,
}

impl ModelRunLedger {
    pub(crate) fn new(pools: PoolRegistry, clock: Arc<dyn Clock>, write_lock: Arc<Mutex<()>>) -> Self {
        Self {
            pool: pools.pool.clone(),
            pools,
            clock,
            write_lock,
        }
    }

    /// Check the pool reference, validate, and append a run
    pub async fn record(&self, candidate: ModelRunCandidate) -> PanelResult<RunId> {
        let pool_id = candidate.pool_id;
        if !self.pools.exists(pool_id).await? {
            warn!("Run rejected: {} does not exist", pool_id);
            return Err(ReferentialError::UnknownPool(pool_id).into());
        }

        let fit = match candidate.validate() {
            Ok(fit) => fit,
            Err(e) => {
                warn!("Run for {} rejected ({}): {}", pool_id, e.kind(), e);
                return Err(e.into());
            }
        };

        let _guard = self.write_lock.lock().await;
        let id = self.insert(&fit).await?;

        let order = fit.coefficients.order();
        info!(
            "Recorded {} ACD({},{}) {} for {} over {}..{}",
            id,
            order.p(),
            order.q(),
            fit.innovation.family(),
            pool_id,
            fit.estimation_start,
            fit.estimation_end
        );
        Ok(id)
    }

    async fn insert(&self, fit: &ValidatedModelRun) -> DbResult<RunId> {
        let order = fit.coefficients.order();
        let shapes = fit.innovation.shapes();

        let result = sqlx::query(
            r#"
            INSERT INTO model_runs (
                pool_id, p, q, innovation,
                weibull_shape, gengamma_kappa, gengamma_nu,
                duration_unit, diurnal_adjusted, sample_size,
                intercept, duration_coefs, psi_coefs, stationarity_slack,
                psi_lags, theta_hat, log_likelihood,
                optimizer_status, iterations, grad_norm,
                estimation_start, estimation_end, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(fit.pool_id.0)
        .bind(order.p() as i64)
        .bind(order.q() as i64)
        .bind(fit.innovation.family().as_str())
        .bind(shapes.weibull_shape)
        .bind(shapes.gengamma_kappa)
        .bind(shapes.gengamma_nu)
        .bind(&fit.duration_unit)
        .bind(fit.diurnal_adjusted)
        .bind(fit.sample_size)
        .bind(fit.coefficients.intercept())
        .bind(encode_vector(fit.coefficients.duration_coefs())?)
        .bind(encode_vector(fit.coefficients.psi_coefs())?)
        .bind(fit.stationarity_slack)
        .bind(encode_vector(fit.coefficients.psi_lags())?)
        .bind(encode_vector(fit.coefficients.theta_hat())?)
        .bind(fit.log_likelihood)
        .bind(&fit.optimizer_status)
        .bind(fit.iterations)
        .bind(fit.grad_norm)
        .bind(fit.estimation_start)
        .bind(fit.estimation_end)
        .bind(self.clock.now())
        .execute(&self.pool)
        .await?;

        Ok(RunId(result.last_insert_rowid()))
    }

    /// Most recently created run for a pool; later insertion wins ties
    pub async fn latest_for_pool(&self, pool_id: PoolId) -> DbResult<Option<RunId>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM model_runs WHERE pool_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(pool_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| RunId(id)))
    }

    /// Runs whose estimation window starts on or after `start`, by start ascending
    pub fn runs_in_window(&self, pool_id: PoolId, start: NaiveDate) -> BoxStream<'_, DbResult<RunId>> {
        sqlx::query_as::<_, (i64,)>(
            r#"SELECT id FROM model_runs
               WHERE pool_id = ?1 AND estimation_start >= ?2
               ORDER BY estimation_start ASC, id ASC"#,
        )
        .bind(pool_id.0)
        .bind(start)
        .fetch(&self.pool)
        .map_ok(|(id,)| RunId(id))
        .map_err(DbError::from)
        .boxed()
    }

    /// Every run for a pool in insertion order
    pub fn runs_for_pool(&self, pool_id: PoolId) -> BoxStream<'_, DbResult<ModelRun>> {
        sqlx::query_as::<_, ModelRunRow>("SELECT * FROM model_runs WHERE pool_id = ?1 ORDER BY id")
            .bind(pool_id.0)
            .fetch(&self.pool)
            .map_err(DbError::from)
            .and_then(|row| future::ready(ModelRun::try_from(row)))
            .boxed()
    }

    pub async fn get(&self, run_id: RunId) -> DbResult<Option<ModelRun>> {
        let row = sqlx::query_as::<_, ModelRunRow>("SELECT * FROM model_runs WHERE id = ?1")
            .bind(run_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ModelRun::try_from).transpose()
    }

    /// Pool that owns a run, if the run exists
    pub async fn owner_of(&self, run_id: RunId) -> DbResult<Option<PoolId>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT pool_id FROM model_runs WHERE id = ?1")
            .bind(run_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| PoolId(id)))
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }
}
