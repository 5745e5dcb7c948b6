//! Canonical DEX pool records

use crate::error::ValidationError;
use crate::types::PoolId;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A pool as submitted for registration (not yet validated)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolCandidate {
    pub chain: String,
    pub dex: String,
    pub pool_address: String,
    pub token_a_symbol: String,
    pub token_b_symbol: String,
    pub token_a_address: String,
    pub token_b_address: String,
    /// Must equal `token_a_symbol + "-" + token_b_symbol`
    pub pair_label: String,
    /// Fee tier in basis points
    pub fee_tier_bps: i64,
    #[serde(default = "default_in_main_sample")]
    pub in_main_sample: bool,
    #[serde(default)]
    pub sample_start: Option<NaiveDate>,
    #[serde(default)]
    pub sample_end: Option<NaiveDate>,
}

fn default_in_main_sample() -> bool {
    true
}

/// An accepted pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub chain: String,
    pub dex: String,
    pub pool_address: String,
    pub token_a_symbol: String,
    pub token_b_symbol: String,
    pub token_a_address: String,
    pub token_b_address: String,
    pub pair_label: String,
    pub fee_tier_bps: i64,
    pub window: SampleWindow,
    pub created_at: DateTime<Utc>,
}

/// The only mutable part of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleWindow {
    pub in_main_sample: bool,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

/// Partial update of a [`SampleWindow`].
///
/// An outer `None` leaves the field unchanged. For the bounds, `Some(None)`
/// clears the date; in JSON that is an explicit `null`, while a missing key
/// means unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleWindowUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_main_sample: Option<bool>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub start: Option<Option<NaiveDate>>,
    #[serde(
        default,
        deserialize_with = "present_or_null",
        skip_serializing_if = "Option::is_none"
    )]
    pub end: Option<Option<NaiveDate>>,
}

fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<NaiveDate>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<NaiveDate>::deserialize(deserializer).map(Some)
}

impl PoolCandidate {
    pub fn derived_pair_label(&self) -> String {
        format!("{}-{}", self.token_a_symbol, self.token_b_symbol)
    }

    pub fn window(&self) -> SampleWindow {
        SampleWindow {
            in_main_sample: self.in_main_sample,
            start: self.sample_start,
            end: self.sample_end,
        }
    }

    /// Copy with surrounding whitespace removed from the identity fields
    /// (chain, dex, address), as stored and matched by the registry
    pub fn normalized(&self) -> PoolCandidate {
        PoolCandidate {
            chain: self.chain.trim().to_string(),
            dex: self.dex.trim().to_string(),
            pool_address: self.pool_address.trim().to_string(),
            ..self.clone()
        }
    }

    /// Check every structural invariant that does not need the registry.
    ///
    /// Uniqueness of the address and business key is checked by the registry.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("chain", &self.chain)?;
        require_non_empty("dex", &self.dex)?;
        require_non_empty("pool_address", &self.pool_address)?;
        require_non_empty("token_a_symbol", &self.token_a_symbol)?;
        require_non_empty("token_b_symbol", &self.token_b_symbol)?;
        require_non_empty("token_a_address", &self.token_a_address)?;
        require_non_empty("token_b_address", &self.token_b_address)?;

        if same_ignoring_case(&self.token_a_symbol, &self.token_b_symbol) {
            return Err(ValidationError::IdenticalTokens {
                field: "token_symbol",
            });
        }
        if same_ignoring_case(&self.token_a_address, &self.token_b_address) {
            return Err(ValidationError::IdenticalTokens {
                field: "token_address",
            });
        }

        let expected = self.derived_pair_label();
        if self.pair_label != expected {
            return Err(ValidationError::InvalidPairLabel {
                expected,
                actual: self.pair_label.clone(),
            });
        }

        if self.fee_tier_bps <= 0 {
            return Err(ValidationError::NonPositiveFeeTier(self.fee_tier_bps));
        }

        self.window().validate()
    }
}

impl SampleWindow {
    /// Start must strictly precede end when both bounds are present
    pub fn validate(&self) -> Result<(), ValidationError> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start >= end => {
                Err(ValidationError::InvertedSampleWindow { start, end })
            }
            _ => Ok(()),
        }
    }

    pub fn apply(&self, update: &SampleWindowUpdate) -> SampleWindow {
        SampleWindow {
            in_main_sample: update.in_main_sample.unwrap_or(self.in_main_sample),
            start: update.start.unwrap_or(self.start),
            end: update.end.unwrap_or(self.end),
        }
    }
}

impl SampleWindowUpdate {
    /// Drop the pool from the main sample, closing its window at `end`
    pub fn retire_at(end: NaiveDate) -> Self {
        Self {
            in_main_sample: Some(false),
            start: None,
            end: Some(Some(end)),
        }
    }

    /// Put the pool back in the main sample with an open end
    pub fn reinstate() -> Self {
        Self {
            in_main_sample: Some(true),
            start: None,
            end: Some(None),
        }
    }
}

fn same_ignoring_case(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

pub(crate) fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::EmptyField { field })
    } else {
        Ok(())
    }
}
