//! Daily (pool, date) metric observations
//!
//! Every numeric field is optional: `None` means unknown or not yet computed
//! and is always accepted. A present value must be `>= 0`.

use crate::error::ValidationError;
use crate::types::{PoolId, RunId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Version assigned to an observation that does not name one
pub const DEFAULT_DATA_VERSION: i64 = 1;

fn default_data_version() -> i64 {
    DEFAULT_DATA_VERSION
}

/// Targets and regressors of one pool-day
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricValues {
    // Targets
    pub v3_spread_bps: Option<f64>,
    pub v2_spread_bps: Option<f64>,
    pub spread_ratio: Option<f64>,

    // Pool-level regressors
    pub pool_tvl_usd: Option<f64>,
    pub pool_volume_usd: Option<f64>,
    pub pool_swap_count: Option<f64>,

    // Pair-level regressors
    pub pair_realized_vol: Option<f64>,
    pub pair_cex_volume_usd: Option<f64>,

    // Chain-level regressors
    pub chain_gas_price_gwei: Option<f64>,
    pub chain_tx_count: Option<f64>,
    pub chain_block_time_secs: Option<f64>,

    /// Fitted ACD intensity for the day
    pub acd_intensity: Option<f64>,
}

impl MetricValues {
    /// Every non-negativity-checked field, in declaration order
    pub fn fields(&self) -> [(&'static str, Option<f64>); 12] {
        [
            ("v3_spread_bps", self.v3_spread_bps),
            ("v2_spread_bps", self.v2_spread_bps),
            ("spread_ratio", self.spread_ratio),
            ("pool_tvl_usd", self.pool_tvl_usd),
            ("pool_volume_usd", self.pool_volume_usd),
            ("pool_swap_count", self.pool_swap_count),
            ("pair_realized_vol", self.pair_realized_vol),
            ("pair_cex_volume_usd", self.pair_cex_volume_usd),
            ("chain_gas_price_gwei", self.chain_gas_price_gwei),
            ("chain_tx_count", self.chain_tx_count),
            ("chain_block_time_secs", self.chain_block_time_secs),
            ("acd_intensity", self.acd_intensity),
        ]
    }

    /// First present field that is not `>= 0` (NaN included)
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in self.fields() {
            if let Some(v) = value {
                if !(v >= 0.0) {
                    return Err(ValidationError::NegativeField { field });
                }
            }
        }
        Ok(())
    }
}

/// A pool-day as submitted by ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricCandidate {
    pub pool_id: PoolId,
    pub trading_date: NaiveDate,
    #[serde(flatten)]
    pub values: MetricValues,
    #[serde(default)]
    pub model_run_id: Option<RunId>,
    #[serde(default = "default_data_version")]
    pub data_version: i64,
}

impl MetricCandidate {
    pub fn new(pool_id: PoolId, trading_date: NaiveDate) -> Self {
        Self {
            pool_id,
            trading_date,
            values: MetricValues::default(),
            model_run_id: None,
            data_version: DEFAULT_DATA_VERSION,
        }
    }

    /// Structural checks only; pool/run references are resolved by the panel
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.data_version < 1 {
            return Err(ValidationError::NonPositiveDataVersion(self.data_version));
        }
        self.values.validate()
    }
}

/// An accepted observation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricObservation {
    pub pool_id: PoolId,
    pub trading_date: NaiveDate,
    #[serde(flatten)]
    pub values: MetricValues,
    pub model_run_id: Option<RunId>,
    pub data_version: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[test]
    fn test_all_absent_is_valid() {
        assert_eq!(MetricCandidate::new(PoolId(1), day()).validate(), Ok(()));
    }

    #[test]
    fn test_each_field_is_checked() {
        let base = MetricValues::default();
        for (i, (name, _)) in base.fields().into_iter().enumerate() {
            let mut values = [None; 12];
            values[i] = Some(-0.01);
            let v = from_array(values);
            assert_eq!(
                v.validate(),
                Err(ValidationError::NegativeField { field: name }),
                "{name}"
            );

            values[i] = Some(0.0);
            assert_eq!(from_array(values).validate(), Ok(()), "{name}");
        }
    }

    fn from_array(a: [Option<f64>; 12]) -> MetricValues {
        MetricValues {
            v3_spread_bps: a[0],
            v2_spread_bps: a[1],
            spread_ratio: a[2],
            pool_tvl_usd: a[3],
            pool_volume_usd: a[4],
            pool_swap_count: a[5],
            pair_realized_vol: a[6],
            pair_cex_volume_usd: a[7],
            chain_gas_price_gwei: a[8],
            chain_tx_count: a[9],
            chain_block_time_secs: a[10],
            acd_intensity: a[11],
        }
    }

    #[test]
    fn test_nan_is_rejected() {
        let mut c = MetricCandidate::new(PoolId(1), day());
        c.values.acd_intensity = Some(f64::NAN);
        assert_eq!(
            c.validate(),
            Err(ValidationError::NegativeField {
                field: "acd_intensity"
            })
        );
    }

    #[test]
    fn test_data_version_must_be_positive() {
        let mut c = MetricCandidate::new(PoolId(1), day());
        c.data_version = 0;
        assert_eq!(c.validate(), Err(ValidationError::NonPositiveDataVersion(0)));
    }

    #[test]
    fn test_flat_json_shape() {
        let json = r#"{"pool_id": 1, "trading_date": "2024-01-01", "v3_spread_bps": 5.0}"#;
        let c: MetricCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(c.values.v3_spread_bps, Some(5.0));
        assert_eq!(c.values.v2_spread_bps, None);
        assert_eq!(c.data_version, DEFAULT_DATA_VERSION);
        assert_eq!(c.model_run_id, None);
    }
}
