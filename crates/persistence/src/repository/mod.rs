//! Repository implementations, one per component

pub mod metrics;
pub mod model_runs;
pub mod pools;

pub use metrics::*;
pub use model_runs::*;
pub use pools::*;
