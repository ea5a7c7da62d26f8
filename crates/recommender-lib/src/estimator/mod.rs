//! Resource estimation
//!
//! An estimator maps an aggregate to a resource amount per resource. Leaf
//! estimators read the aggregate's histograms or return constants; the
//! wrappers adjust what an inner estimator returns. [`PodResourceRecommender`]
//! assembles the target, lower-bound and upper-bound pipelines.

mod basic;
mod pod;
mod wrappers;

pub use basic::{ConstEstimator, PercentileEstimator};
pub use pod::{PodResourceRecommender, DEFAULT_POD_MIN_CPU_MILLICORES, DEFAULT_POD_MIN_MEMORY_MB};
pub use wrappers::{ConfidenceMultiplierEstimator, MarginEstimator, MinResourcesEstimator};

use crate::model::AggregateContainerState;
use crate::models::Resources;
use std::fmt::Debug;
use std::sync::Arc;

pub trait ResourceEstimator: Send + Sync + Debug {
    fn estimate(&self, state: &AggregateContainerState) -> Resources;
}

pub type SharedEstimator = Arc<dyn ResourceEstimator>;
