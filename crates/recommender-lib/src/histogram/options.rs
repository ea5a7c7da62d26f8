//! Bucket layouts for histograms
//!
//! A layout maps a value to a bucket index and gives the start of each
//! bucket. Two layouts exist: fixed-width (linear) buckets and buckets whose
//! width grows geometrically (exponential).

use super::{HistogramError, HistogramResult};
use std::fmt;
use std::sync::Arc;

/// Bucket layout shared by every histogram built from it
pub trait HistogramOptions: Send + Sync + fmt::Debug {
    /// Number of buckets. Always at least 1.
    fn num_buckets(&self) -> usize;

    /// Bucket a value falls into. Values below the first bucket map to 0,
    /// values past the last bucket map to the last one.
    fn find_bucket(&self, value: f64) -> usize;

    /// Smallest value that falls into `bucket`
    fn bucket_start(&self, bucket: usize) -> f64;

    /// Weights below this are treated as zero
    fn epsilon(&self) -> f64;
}

/// Shared handle to a bucket layout
pub type SharedOptions = Arc<dyn HistogramOptions>;

/// Two histograms are compatible only if they share the same layout instance
pub fn same_options(a: &SharedOptions, b: &SharedOptions) -> bool {
    Arc::ptr_eq(a, b)
}

/// Buckets of equal width: `[0, s), [s, 2s), ...`
#[derive(Debug, Clone, PartialEq)]
pub struct LinearHistogramOptions {
    num_buckets: usize,
    bucket_size: f64,
    epsilon: f64,
}

impl LinearHistogramOptions {
    pub fn new(max_value: f64, bucket_size: f64, epsilon: f64) -> HistogramResult<Self> {
        if !(bucket_size > 0.0) || !(epsilon > 0.0) || !(max_value > 0.0) {
            return Err(HistogramError::InvalidOptions(format!(
                "linear layout needs positive max_value, bucket_size and epsilon \
                 (got {max_value}, {bucket_size}, {epsilon})"
            )));
        }
        let num_buckets = (max_value / bucket_size).ceil() as usize + 1;
        Ok(Self {
            num_buckets,
            bucket_size,
            epsilon,
        })
    }

    pub fn bucket_size(&self) -> f64 {
        self.bucket_size
    }
}

impl HistogramOptions for LinearHistogramOptions {
    fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    fn find_bucket(&self, value: f64) -> usize {
        if !(value > 0.0) {
            return 0;
        }
        let bucket = (value / self.bucket_size).floor() as usize;
        bucket.min(self.num_buckets - 1)
    }

    fn bucket_start(&self, bucket: usize) -> f64 {
        debug_assert!(bucket < self.num_buckets);
        bucket.min(self.num_buckets - 1) as f64 * self.bucket_size
    }

    fn epsilon(&self) -> f64 {
        self.epsilon
    }
}

/// Buckets whose width grows by `ratio`: the first one is `first_bucket_size`
/// wide, the n-th one `first_bucket_size * ratio^n` wide.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialHistogramOptions {
    num_buckets: usize,
    first_bucket_size: f64,
    ratio: f64,
    epsilon: f64,
}

impl ExponentialHistogramOptions {
    pub fn new(
        max_value: f64,
        first_bucket_size: f64,
        ratio: f64,
        epsilon: f64,
    ) -> HistogramResult<Self> {
        if !(max_value > 0.0) || !(first_bucket_size > 0.0) || !(epsilon > 0.0) || !(ratio > 1.0) {
            return Err(HistogramError::InvalidOptions(format!(
                "exponential layout needs positive max_value, first_bucket_size and epsilon \
                 and a ratio above 1 (got {max_value}, {first_bucket_size}, {ratio}, {epsilon})"
            )));
        }
        Ok(Self::build(max_value, first_bucket_size, ratio, epsilon))
    }

    /// Build a layout from parameters already known to be valid
    pub(crate) fn build(max_value: f64, first_bucket_size: f64, ratio: f64, epsilon: f64) -> Self {
        let n = ((max_value * (ratio - 1.0) / first_bucket_size + 1.0).ln() / ratio.ln()).ceil();
        Self {
            num_buckets: n as usize + 1,
            first_bucket_size,
            ratio,
            epsilon,
        }
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn first_bucket_size(&self) -> f64 {
        self.first_bucket_size
    }
}

impl HistogramOptions for ExponentialHistogramOptions {
    fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    fn find_bucket(&self, value: f64) -> usize {
        if !(value >= self.first_bucket_size) {
            return 0;
        }
        let bucket = ((value * (self.ratio - 1.0) / self.first_bucket_size + 1.0).ln()
            / self.ratio.ln())
        .floor() as usize;
        bucket.min(self.num_buckets - 1)
    }

    fn bucket_start(&self, bucket: usize) -> f64 {
        debug_assert!(bucket < self.num_buckets);
        let bucket = bucket.min(self.num_buckets - 1);
        if bucket == 0 {
            return 0.0;
        }
        self.first_bucket_size * (self.ratio.powi(bucket as i32) - 1.0) / (self.ratio - 1.0)
    }

    fn epsilon(&self) -> f64 {
        self.epsilon
    }
}
