//! Histograms used to aggregate resource usage
//!
//! Samples are accumulated as weights in buckets laid out by a
//! [`HistogramOptions`] implementation. [`DecayingHistogram`] gives recent
//! samples exponentially more weight than old ones. Both can be saved to and
//! restored from a compact [`HistogramCheckpoint`].

mod checkpoint;
mod decaying;
mod options;
mod weighted;


pub use checkpoint::{HistogramCheckpoint, MAX_CHECKPOINT_WEIGHT};
pub use decaying::{DecayingHistogram, MAX_DECAY_EXPONENT};
pub use options::{
    same_options, ExponentialHistogramOptions, HistogramOptions, LinearHistogramOptions,
    SharedOptions,
};
pub use weighted::Histogram;

use std::sync::Arc;
use thiserror::Error;

/// Smallest weight a single sample carries
pub const MIN_SAMPLE_WEIGHT: f64 = 0.1;

/// Weights below this are treated as zero in the default layouts
pub const DEFAULT_EPSILON: f64 = 0.001 * MIN_SAMPLE_WEIGHT;

/// Default bucket growth for the CPU and memory layouts
pub const DEFAULT_BUCKET_GROWTH: f64 = 1.05;

#[derive(Debug, Error, PartialEq)]
pub enum HistogramError {
    #[error("invalid histogram options: {0}")]
    InvalidOptions(String),

    #[error("sample weight must be non-negative, got {0}")]
    NegativeWeight(f64),

    #[error("cannot merge histograms with different bucket layouts")]
    OptionsMismatch,

    #[error("cannot merge decaying histograms with different half-lives")]
    HalfLifeMismatch,

    #[error("invalid histogram checkpoint: {0}")]
    InvalidCheckpoint(String),
}

pub type HistogramResult<T> = Result<T, HistogramError>;

/// Layout for CPU usage in cores: 10 millicores up to 1000 cores
pub fn cpu_histogram_options(bucket_growth: f64) -> HistogramResult<SharedOptions> {
    Ok(Arc::new(ExponentialHistogramOptions::new(
        1000.0,
        0.01,
        bucket_growth,
        DEFAULT_EPSILON,
    )?))
}

/// Layout for memory peaks in bytes: 10MB up to 1TB
pub fn memory_histogram_options(bucket_growth: f64) -> HistogramResult<SharedOptions> {
    Ok(Arc::new(ExponentialHistogramOptions::new(
        1e12,
        1e7,
        bucket_growth,
        DEFAULT_EPSILON,
    )?))
}

/// CPU layout with the default growth ratio
pub fn default_cpu_histogram_options() -> SharedOptions {
    Arc::new(ExponentialHistogramOptions::build(
        1000.0,
        0.01,
        DEFAULT_BUCKET_GROWTH,
        DEFAULT_EPSILON,
    ))
}

/// Memory layout with the default growth ratio
pub fn default_memory_histogram_options() -> SharedOptions {
    Arc::new(ExponentialHistogramOptions::build(
        1e12,
        1e7,
        DEFAULT_BUCKET_GROWTH,
        DEFAULT_EPSILON,
    ))
}
