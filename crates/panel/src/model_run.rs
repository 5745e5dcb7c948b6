//! ACD(p,q) estimation runs
//!
//! A run arrives as a [`ModelRunCandidate`] carrying raw integers, strings and
//! vectors. [`ModelRunCandidate::validate`] turns it into a
//! [`ValidatedModelRun`] whose order, innovation family and coefficient
//! vectors are built through fallible constructors, so a value whose vector
//! lengths disagree with (p, q) cannot exist.
//!
//! Checks run in a fixed order and the first violation wins:
//! orders → innovation family/shapes → metadata → vector lengths →
//! finiteness and numeric positivity → estimation window.

use crate::error::ValidationError;
use crate::pool::require_non_empty;
use crate::types::{PoolId, RunId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distribution of the standardized duration innovations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InnovationFamily {
    Exponential,
    Weibull,
    GeneralizedGamma,
}

impl InnovationFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Weibull => "weibull",
            Self::GeneralizedGamma => "generalized_gamma",
        }
    }
}

impl fmt::Display for InnovationFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InnovationFamily {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "exponential" => Ok(Self::Exponential),
            "weibull" => Ok(Self::Weibull),
            "generalized_gamma" | "generalized-gamma" => Ok(Self::GeneralizedGamma),
            other => Err(ValidationError::InvalidInnovationFamily(other.to_string())),
        }
    }
}

/// Raw family-specific shape parameters, as estimated
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapeParameters {
    #[serde(default)]
    pub weibull_shape: Option<f64>,
    #[serde(default)]
    pub gengamma_kappa: Option<f64>,
    #[serde(default)]
    pub gengamma_nu: Option<f64>,
}

/// Innovation family together with exactly the shapes it needs
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Innovation {
    Exponential,
    Weibull { shape: f64 },
    GeneralizedGamma { kappa: f64, nu: f64 },
}

fn positive(v: f64) -> bool {
    v > 0.0 && v.is_finite()
}

impl Innovation {
    pub fn from_parts(
        family: InnovationFamily,
        shapes: ShapeParameters,
    ) -> Result<Self, ValidationError> {
        let mismatch = || ValidationError::ShapeParameterMismatch {
            family: family.as_str(),
        };
        let ShapeParameters {
            weibull_shape,
            gengamma_kappa,
            gengamma_nu,
        } = shapes;

        match family {
            InnovationFamily::Exponential => match (weibull_shape, gengamma_kappa, gengamma_nu) {
                (None, None, None) => Ok(Self::Exponential),
                _ => Err(mismatch()),
            },
            InnovationFamily::Weibull => match (weibull_shape, gengamma_kappa, gengamma_nu) {
                (Some(shape), None, None) if positive(shape) => Ok(Self::Weibull { shape }),
                _ => Err(mismatch()),
            },
            InnovationFamily::GeneralizedGamma => {
                match (weibull_shape, gengamma_kappa, gengamma_nu) {
                    (None, Some(kappa), Some(nu)) if positive(kappa) && positive(nu) => {
                        Ok(Self::GeneralizedGamma { kappa, nu })
                    }
                    _ => Err(mismatch()),
                }
            }
        }
    }

    pub fn family(&self) -> InnovationFamily {
        match self {
            Self::Exponential => InnovationFamily::Exponential,
            Self::Weibull { .. } => InnovationFamily::Weibull,
            Self::GeneralizedGamma { .. } => InnovationFamily::GeneralizedGamma,
        }
    }

    pub fn shapes(&self) -> ShapeParameters {
        match *self {
            Self::Exponential => ShapeParameters::default(),
            Self::Weibull { shape } => ShapeParameters {
                weibull_shape: Some(shape),
                ..Default::default()
            },
            Self::GeneralizedGamma { kappa, nu } => ShapeParameters {
                weibull_shape: None,
                gengamma_kappa: Some(kappa),
                gengamma_nu: Some(nu),
            },
        }
    }
}

/// ACD order: p lags of ψ, q lags of the realized duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AcdOrder {
    p: usize,
    q: usize,
}

impl AcdOrder {
    pub fn new(p: i64, q: i64) -> Result<Self, ValidationError> {
        let invalid = ValidationError::InvalidOrders { p, q };
        let (Ok(up), Ok(uq)) = (usize::try_from(p), usize::try_from(q)) else {
            return Err(invalid);
        };
        if up + uq == 0 {
            return Err(invalid);
        }
        Ok(Self { p: up, q: uq })
    }

    pub fn p(&self) -> usize {
        self.p
    }

    pub fn q(&self) -> usize {
        self.q
    }

    /// Length of θ̂ = [intercept, α..., β...]
    pub fn theta_len(&self) -> usize {
        1 + self.p + self.q
    }
}

/// Fitted coefficient vectors, length-checked against an [`AcdOrder`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcdCoefficients {
    order: AcdOrder,
    intercept: f64,
    /// α, length q
    duration_coefs: Vec<f64>,
    /// β, length p
    psi_coefs: Vec<f64>,
    /// ψ values seeding the recursion, length p
    psi_lags: Vec<f64>,
    /// θ̂, length 1+p+q
    theta_hat: Vec<f64>,
}

fn check_len(field: &'static str, expected: usize, v: &[f64]) -> Result<(), ValidationError> {
    if v.len() == expected {
        Ok(())
    } else {
        Err(ValidationError::VectorLengthMismatch {
            field,
            expected,
            actual: v.len(),
        })
    }
}

/// Fitted values must survive storage as numbers
fn check_finite(coefficients: &AcdCoefficients, log_likelihood: f64) -> Result<(), ValidationError> {
    let scalars = [
        ("intercept", coefficients.intercept),
        ("log_likelihood", log_likelihood),
    ];
    let vectors = [
        ("duration_coefs", coefficients.duration_coefs()),
        ("psi_coefs", coefficients.psi_coefs()),
        ("psi_lags", coefficients.psi_lags()),
        ("theta_hat", coefficients.theta_hat()),
    ];
    for (field, v) in scalars {
        if !v.is_finite() {
            return Err(ValidationError::NonFiniteValue { field });
        }
    }
    for (field, v) in vectors {
        if v.iter().any(|x| !x.is_finite()) {
            return Err(ValidationError::NonFiniteValue { field });
        }
    }
    Ok(())
}

impl AcdCoefficients {
    pub fn new(
        order: AcdOrder,
        intercept: f64,
        duration_coefs: Vec<f64>,
        psi_coefs: Vec<f64>,
        psi_lags: Vec<f64>,
        theta_hat: Vec<f64>,
    ) -> Result<Self, ValidationError> {
        check_len("duration_coefs", order.q(), &duration_coefs)?;
        check_len("psi_coefs", order.p(), &psi_coefs)?;
        check_len("psi_lags", order.p(), &psi_lags)?;
        check_len("theta_hat", order.theta_len(), &theta_hat)?;
        Ok(Self {
            order,
            intercept,
            duration_coefs,
            psi_coefs,
            psi_lags,
            theta_hat,
        })
    }

    pub fn order(&self) -> AcdOrder {
        self.order
    }

    pub fn intercept(&self) -> f64 {
        self.intercept
    }

    pub fn duration_coefs(&self) -> &[f64] {
        &self.duration_coefs
    }

    pub fn psi_coefs(&self) -> &[f64] {
        &self.psi_coefs
    }

    pub fn psi_lags(&self) -> &[f64] {
        &self.psi_lags
    }

    pub fn theta_hat(&self) -> &[f64] {
        &self.theta_hat
    }

    /// Σα + Σβ
    pub fn persistence(&self) -> f64 {
        self.duration_coefs.iter().sum::<f64>() + self.psi_coefs.iter().sum::<f64>()
    }
}

/// A completed estimation as handed over by the fitting pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRunCandidate {
    pub pool_id: PoolId,
    pub p: i64,
    pub q: i64,
    pub innovation: String,
    #[serde(default)]
    pub shapes: ShapeParameters,
    pub duration_unit: String,
    #[serde(default)]
    pub diurnal_adjusted: bool,
    /// Number of durations used in the fit
    pub sample_size: i64,
    pub intercept: f64,
    pub duration_coefs: Vec<f64>,
    pub psi_coefs: Vec<f64>,
    pub stationarity_slack: f64,
    pub psi_lags: Vec<f64>,
    pub theta_hat: Vec<f64>,
    pub log_likelihood: f64,
    pub optimizer_status: String,
    #[serde(default)]
    pub iterations: Option<i64>,
    #[serde(default)]
    pub grad_norm: Option<f64>,
    pub estimation_start: NaiveDate,
    pub estimation_end: NaiveDate,
}

/// A run that passed every structural check, ready to append
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidatedModelRun {
    pub pool_id: PoolId,
    pub innovation: Innovation,
    pub coefficients: AcdCoefficients,
    pub duration_unit: String,
    pub diurnal_adjusted: bool,
    pub sample_size: i64,
    pub stationarity_slack: f64,
    pub log_likelihood: f64,
    pub optimizer_status: String,
    pub iterations: Option<i64>,
    pub grad_norm: Option<f64>,
    pub estimation_start: NaiveDate,
    pub estimation_end: NaiveDate,
}

impl ModelRunCandidate {
    pub fn validate(self) -> Result<ValidatedModelRun, ValidationError> {
        let order = AcdOrder::new(self.p, self.q)?;

        let family: InnovationFamily = self.innovation.parse()?;
        let innovation = Innovation::from_parts(family, self.shapes)?;

        if require_non_empty("duration_unit", &self.duration_unit).is_err() {
            return Err(ValidationError::EmptyUnitsLabel);
        }
        if self.sample_size <= 0 {
            return Err(ValidationError::NonPositiveSampleLength(self.sample_size));
        }

        let coefficients = AcdCoefficients::new(
            order,
            self.intercept,
            self.duration_coefs,
            self.psi_coefs,
            self.psi_lags,
            self.theta_hat,
        )?;

        check_finite(&coefficients, self.log_likelihood)?;
        if !(self.stationarity_slack > 0.0) {
            return Err(ValidationError::NonPositiveSlack(self.stationarity_slack));
        }
        if let Some(n) = self.iterations.filter(|n| *n <= 0) {
            return Err(ValidationError::NonPositiveIterationCount(n));
        }
        if let Some(g) = self.grad_norm.filter(|g| !(*g >= 0.0)) {
            return Err(ValidationError::NegativeGradientNorm(g));
        }

        if self.estimation_start >= self.estimation_end {
            return Err(ValidationError::InvertedEstimationWindow {
                start: self.estimation_start,
                end: self.estimation_end,
            });
        }

        Ok(ValidatedModelRun {
            pool_id: self.pool_id,
            innovation,
            coefficients,
            duration_unit: self.duration_unit,
            diurnal_adjusted: self.diurnal_adjusted,
            sample_size: self.sample_size,
            stationarity_slack: self.stationarity_slack,
            log_likelihood: self.log_likelihood,
            optimizer_status: self.optimizer_status,
            iterations: self.iterations,
            grad_norm: self.grad_norm,
            estimation_start: self.estimation_start,
            estimation_end: self.estimation_end,
        })
    }
}

/// An accepted, immutable estimation run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRun {
    pub id: RunId,
    #[serde(flatten)]
    pub fit: ValidatedModelRun,
    pub created_at: DateTime<Utc>,
}

impl ModelRun {
    pub fn pool_id(&self) -> PoolId {
        self.fit.pool_id
    }

    pub fn order(&self) -> AcdOrder {
        self.fit.coefficients.order()
    }

    pub fn persistence(&self) -> f64 {
        self.fit.coefficients.persistence()
    }

    /// Σα + Σβ ≤ 1 − slack (reported only, not enforced on write)
    pub fn satisfies_stationarity(&self) -> bool {
        self.persistence() <= 1.0 - self.fit.stationarity_slack
    }
}
