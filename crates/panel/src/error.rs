//! Rejection families returned by the three components
//!
//! - [`ValidationError`]: the candidate itself is malformed
//! - [`ReferentialError`]: a referenced pool or run is missing or belongs elsewhere
//! - [`ConflictError`]: the candidate collides with an accepted record
//!
//! Storage failures are a separate kind owned by the `persistence` crate.

use crate::types::{PoolId, RunId};
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("field `{field}` is empty")]
    EmptyField { field: &'static str },

    #[error("field `{field}` must differ between token A and token B")]
    IdenticalTokens { field: &'static str },

    #[error("pair label `{actual}` does not match `{expected}`")]
    InvalidPairLabel { expected: String, actual: String },

    #[error("fee tier must be positive, got {0}")]
    NonPositiveFeeTier(i64),

    #[error("sample window start {start} does not precede end {end}")]
    InvertedSampleWindow { start: NaiveDate, end: NaiveDate },

    #[error("invalid ACD orders p={p}, q={q}")]
    InvalidOrders { p: i64, q: i64 },

    #[error("unknown innovation family `{0}`")]
    InvalidInnovationFamily(String),

    #[error("shape parameters do not match the {family} family")]
    ShapeParameterMismatch { family: &'static str },

    #[error("duration unit label is empty")]
    EmptyUnitsLabel,

    #[error("sample length must be positive, got {0}")]
    NonPositiveSampleLength(i64),

    #[error("`{field}` has length {actual}, expected {expected}")]
    VectorLengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("stationarity slack must be positive, got {0}")]
    NonPositiveSlack(f64),

    #[error("iteration count must be positive, got {0}")]
    NonPositiveIterationCount(i64),

    #[error("field `{field}` is not a finite number")]
    NonFiniteValue { field: &'static str },

    #[error("gradient norm must be non-negative, got {0}")]
    NegativeGradientNorm(f64),

    #[error("estimation window start {start} does not precede end {end}")]
    InvertedEstimationWindow { start: NaiveDate, end: NaiveDate },

    #[error("field `{field}` is negative")]
    NegativeField { field: &'static str },

    #[error("data version must be at least 1, got {0}")]
    NonPositiveDataVersion(i64),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReferentialError {
    #[error("{0} does not exist")]
    UnknownPool(PoolId),

    #[error("{0} does not exist")]
    UnknownRun(RunId),

    #[error("{run_id} belongs to {run_pool}, not {observation_pool}")]
    CrossPoolRunLink {
        run_id: RunId,
        run_pool: PoolId,
        observation_pool: PoolId,
    },

    #[error("{0} not found")]
    NotFound(PoolId),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConflictError {
    #[error("pool address {address} is already registered")]
    DuplicateAddress { address: String },

    #[error("({chain}, {pair_label}, {fee_tier_bps}bps) is already registered")]
    DuplicateBusinessKey {
        chain: String,
        pair_label: String,
        fee_tier_bps: i64,
    },

    #[error("observation for {pool_id} on {trading_date} (v{data_version}) already exists")]
    DuplicateObservation {
        pool_id: PoolId,
        trading_date: NaiveDate,
        data_version: i64,
    },

    #[error("data version {attempted} is older than live version {live} for {pool_id} on {trading_date}")]
    StaleDataVersion {
        pool_id: PoolId,
        trading_date: NaiveDate,
        attempted: i64,
        live: i64,
    },
}

impl ValidationError {
    /// Short machine-readable name of the violated rule
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyField { .. } => "EmptyField",
            Self::IdenticalTokens { .. } => "IdenticalTokens",
            Self::InvalidPairLabel { .. } => "InvalidPairLabel",
            Self::NonPositiveFeeTier(_) => "NonPositiveFeeTier",
            Self::InvertedSampleWindow { .. } => "InvertedSampleWindow",
            Self::InvalidOrders { .. } => "InvalidOrders",
            Self::InvalidInnovationFamily(_) => "InvalidInnovationFamily",
            Self::ShapeParameterMismatch { .. } => "ShapeParameterMismatch",
            Self::EmptyUnitsLabel => "EmptyUnitsLabel",
            Self::NonPositiveSampleLength(_) => "NonPositiveSampleLength",
            Self::VectorLengthMismatch { .. } => "VectorLengthMismatch",
            Self::NonPositiveSlack(_) => "NonPositiveSlack",
            Self::NonPositiveIterationCount(_) => "NonPositiveIterationCount",
            Self::NonFiniteValue { .. } => "NonFiniteValue",
            Self::NegativeGradientNorm(_) => "NegativeGradientNorm",
            Self::InvertedEstimationWindow { .. } => "InvertedEstimationWindow",
            Self::NegativeField { .. } => "NegativeField",
            Self::NonPositiveDataVersion(_) => "NonPositiveDataVersion",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offending_field() {
        let err = ValidationError::VectorLengthMismatch {
            field: "duration_coefs",
            expected: 1,
            actual: 2,
        };
        assert_eq!(err.to_string(), "`duration_coefs` has length 2, expected 1");
        assert_eq!(err.kind(), "VectorLengthMismatch");
    }

    #[test]
    fn test_cross_pool_message() {
        let err = ReferentialError::CrossPoolRunLink {
            run_id: RunId(3),
            run_pool: PoolId(1),
            observation_pool: PoolId(2),
        };
        assert_eq!(err.to_string(), "run#3 belongs to pool#1, not pool#2");
    }
}
