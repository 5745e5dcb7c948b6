//! ACD Panel — record model and write-time validation
//!
//! Pure domain crate for the append-only research panel.
//! Provides:
//! - Canonical pool candidates and sample-window updates
//! - ACD(p,q) model-run candidates with order/vector shape checks
//! - Daily metric observation candidates with non-negativity checks
//! - Typed rejection families and the clock collaborator
//!
//! Storage lives in the `persistence` crate; nothing here performs I/O.

pub mod clock;
pub mod error;
pub mod metrics;
pub mod model_run;
pub mod pool;
pub mod types;

// Re-exports for convenience
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{ConflictError, ReferentialError, ValidationError};
pub use metrics::{MetricCandidate, MetricObservation, MetricValues, DEFAULT_DATA_VERSION};
pub use model_run::{
    AcdCoefficients, AcdOrder, Innovation, InnovationFamily, ModelRun, ModelRunCandidate,
    ShapeParameters, ValidatedModelRun,
};
pub use pool::{Pool, PoolCandidate, SampleWindow, SampleWindowUpdate};
pub use types::{PoolId, RunId};
