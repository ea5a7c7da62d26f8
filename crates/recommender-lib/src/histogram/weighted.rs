//! Weighted bucket histogram
//!
//! Keeps a weight per bucket plus the total weight, and tracks the lowest
//! and highest bucket holding at least `epsilon` of weight so that scans
//! only touch the populated range.

use super::checkpoint::{HistogramCheckpoint, MAX_CHECKPOINT_WEIGHT};
use super::options::{same_options, SharedOptions};
use super::{HistogramError, HistogramResult};
use std::collections::BTreeMap;

const EQUALITY_TOLERANCE: f64 = 1e-15;

#[derive(Debug, Clone)]
pub struct Histogram {
    options: SharedOptions,
    bucket_weight: Vec<f64>,
    total_weight: f64,
    min_bucket: usize,
    max_bucket: usize,
}

impl Histogram {
    /// Empty histogram over the given layout
    pub fn new(options: SharedOptions) -> Self {
        let num_buckets = options.num_buckets();
        Self {
            options,
            bucket_weight: vec![0.0; num_buckets],
            total_weight: 0.0,
            min_bucket: num_buckets - 1,
            max_bucket: 0,
        }
    }

    pub fn options(&self) -> &SharedOptions {
        &self.options
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn bucket_weight(&self, bucket: usize) -> f64 {
        self.bucket_weight.get(bucket).copied().unwrap_or(0.0)
    }

    pub fn min_bucket(&self) -> usize {
        self.min_bucket
    }

    pub fn max_bucket(&self) -> usize {
        self.max_bucket
    }

    pub fn is_empty(&self) -> bool {
        self.bucket_weight[self.min_bucket] < self.options.epsilon()
    }

    /// Add `weight` to the bucket holding `value`
    pub fn add_sample(&mut self, value: f64, weight: f64) -> HistogramResult<()> {
        if !(weight >= 0.0) {
            return Err(HistogramError::NegativeWeight(weight));
        }
        let bucket = self.options.find_bucket(value);
        self.bucket_weight[bucket] += weight;
        self.total_weight += weight;
        if self.bucket_weight[bucket] >= self.options.epsilon() {
            self.min_bucket = self.min_bucket.min(bucket);
            self.max_bucket = self.max_bucket.max(bucket);
        }
        Ok(())
    }

    /// Remove `weight` from the bucket holding `value`. Weights never go
    /// below zero.
    pub fn subtract_sample(&mut self, value: f64, weight: f64) -> HistogramResult<()> {
        if !(weight >= 0.0) {
            return Err(HistogramError::NegativeWeight(weight));
        }
        let epsilon = self.options.epsilon();
        let bucket = self.options.find_bucket(value);

        self.total_weight -= weight;
        if self.total_weight < epsilon {
            self.total_weight = 0.0;
        }
        self.bucket_weight[bucket] -= weight;
        if self.bucket_weight[bucket] < epsilon {
            self.bucket_weight[bucket] = 0.0;
        }
        self.update_min_and_max_bucket();
        Ok(())
    }

    /// Multiply every weight by `factor`. Negative factors are treated as zero.
    pub fn scale(&mut self, factor: f64) {
        let factor = if factor > 0.0 { factor } else { 0.0 };
        for bucket in self.min_bucket..=self.max_bucket {
            self.bucket_weight[bucket] *= factor;
        }
        self.total_weight *= factor;
        self.update_min_and_max_bucket();
    }

    /// Add every bucket of `other` into this histogram
    pub fn merge(&mut self, other: &Histogram) -> HistogramResult<()> {
        if !same_options(&self.options, &other.options) {
            return Err(HistogramError::OptionsMismatch);
        }
        if other.min_bucket > other.max_bucket {
            return Ok(());
        }
        for bucket in other.min_bucket..=other.max_bucket {
            self.bucket_weight[bucket] += other.bucket_weight[bucket];
        }
        self.total_weight += other.total_weight;
        self.min_bucket = self.min_bucket.min(other.min_bucket);
        self.max_bucket = self.max_bucket.max(other.max_bucket);
        Ok(())
    }

    /// Approximate value below which `percentile` of the weight lies.
    ///
    /// Returns the end of the bucket where the cumulative weight first
    /// reaches the threshold, or the start of the last bucket if that is
    /// where it lands. An empty histogram yields 0.
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let threshold = percentile * self.total_weight;
        let mut partial_sum = 0.0;
        let mut bucket = self.min_bucket;
        while bucket < self.max_bucket {
            partial_sum += self.bucket_weight[bucket];
            if partial_sum >= threshold {
                break;
            }
            bucket += 1;
        }
        if bucket < self.options.num_buckets() - 1 {
            self.options.bucket_start(bucket + 1)
        } else {
            self.options.bucket_start(bucket)
        }
    }

    /// True if both histograms share a layout and populated range and every
    /// bucket weight agrees within `EQUALITY_TOLERANCE`
    pub fn equals(&self, other: &Histogram) -> bool {
        if !same_options(&self.options, &other.options) {
            return false;
        }
        if self.is_empty() && other.is_empty() {
            return true;
        }
        if self.min_bucket != other.min_bucket || self.max_bucket != other.max_bucket {
            return false;
        }
        self.bucket_weight
            .iter()
            .zip(other.bucket_weight.iter())
            .all(|(a, b)| (a - b).abs() < EQUALITY_TOLERANCE)
    }

    /// Compact form of the histogram: weights are normalised so the heaviest
    /// bucket becomes `MAX_CHECKPOINT_WEIGHT`, and empty buckets are dropped.
    pub fn save_checkpoint(&self) -> HistogramCheckpoint {
        let mut bucket_weights = BTreeMap::new();
        if !self.is_empty() {
            let max_weight = (self.min_bucket..=self.max_bucket)
                .map(|b| self.bucket_weight[b])
                .fold(0.0_f64, f64::max);
            if max_weight > 0.0 {
                let ratio = MAX_CHECKPOINT_WEIGHT as f64 / max_weight;
                for bucket in self.min_bucket..=self.max_bucket {
                    let weight = (self.bucket_weight[bucket] * ratio).round() as u32;
                    if weight > 0 {
                        bucket_weights.insert(bucket as i64, weight);
                    }
                }
            }
        }
        HistogramCheckpoint {
            reference_timestamp: None,
            total_weight: self.total_weight,
            bucket_weights,
        }
    }

    /// Add the contents of a checkpoint to this histogram, rescaling the
    /// stored integer weights so they sum to the checkpoint's total weight.
    /// Nothing is modified if the checkpoint is invalid.
    pub fn load_checkpoint(&mut self, checkpoint: &HistogramCheckpoint) -> HistogramResult<()> {
        if !(checkpoint.total_weight >= 0.0) {
            return Err(HistogramError::InvalidCheckpoint(format!(
                "negative total weight {}",
                checkpoint.total_weight
            )));
        }
        let num_buckets = self.options.num_buckets() as i64;
        let mut sum = 0_u64;
        for (&bucket, &weight) in &checkpoint.bucket_weights {
            if bucket < 0 || bucket >= num_buckets {
                return Err(HistogramError::InvalidCheckpoint(format!(
                    "bucket index {bucket} outside 0..{num_buckets}"
                )));
            }
            sum += u64::from(weight);
        }
        if sum == 0 {
            return Ok(());
        }

        let ratio = checkpoint.total_weight / sum as f64;
        for (&bucket, &weight) in &checkpoint.bucket_weights {
            let bucket = bucket as usize;
            self.bucket_weight[bucket] += f64::from(weight) * ratio;
            if self.bucket_weight[bucket] >= self.options.epsilon() {
                self.min_bucket = self.min_bucket.min(bucket);
                self.max_bucket = self.max_bucket.max(bucket);
            }
        }
        self.total_weight += checkpoint.total_weight;
        Ok(())
    }

    fn update_min_and_max_bucket(&mut self) {
        let epsilon = self.options.epsilon();
        let last = self.options.num_buckets() - 1;
        while self.bucket_weight[self.min_bucket] < epsilon && self.min_bucket < last {
            self.min_bucket += 1;
        }
        while self.bucket_weight[self.max_bucket] < epsilon && self.max_bucket > 0 {
            self.max_bucket -= 1;
        }
    }
}
