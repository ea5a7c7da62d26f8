//! Recommender configuration
//!
//! Every field has a default so partial files and environment overrides
//! deserialize cleanly.

use crate::histogram::HistogramResult;
use crate::model::AggregationsConfig;
use crate::postprocess::PostProcessorKind;
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted duration setting, 100 years
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommenderConfig {
    /// Time between recommender iterations
    #[serde(default = "default_recommender_interval")]
    pub recommender_interval_secs: u64,

    /// Length of one memory-peak window
    #[serde(default = "default_one_day")]
    pub memory_aggregation_interval_secs: u64,

    /// Number of memory-peak windows kept
    #[serde(default = "default_memory_aggregation_interval_count")]
    pub memory_aggregation_interval_count: u32,

    #[serde(default = "default_one_day")]
    pub cpu_histogram_decay_half_life_secs: u64,

    #[serde(default = "default_one_day")]
    pub memory_histogram_decay_half_life_secs: u64,

    /// Relative growth of consecutive histogram bucket widths
    #[serde(default = "default_bucket_size_growth")]
    pub histogram_bucket_size_growth: f64,

    #[serde(default = "default_target_percentile")]
    pub target_cpu_percentile: f64,
    #[serde(default = "default_lower_bound_percentile")]
    pub lower_bound_cpu_percentile: f64,
    #[serde(default = "default_upper_bound_percentile")]
    pub upper_bound_cpu_percentile: f64,

    #[serde(default = "default_target_percentile")]
    pub target_memory_percentile: f64,
    #[serde(default = "default_lower_bound_percentile")]
    pub lower_bound_memory_percentile: f64,
    #[serde(default = "default_upper_bound_percentile")]
    pub upper_bound_memory_percentile: f64,

    /// Fraction added on top of every estimated percentile
    #[serde(default = "default_safety_margin_fraction")]
    pub safety_margin_fraction: f64,

    /// Pod-wide CPU floor, split evenly across the pod's containers
    #[serde(default = "default_pod_min_cpu_millicores")]
    pub pod_min_cpu_millicores: f64,

    /// Pod-wide memory floor in MiB, split evenly across the pod's containers
    #[serde(default = "default_pod_min_memory_mb")]
    pub pod_min_memory_mb: f64,

    /// Accepted for compatibility; confidence is derived from sample history
    #[serde(default = "default_one_day")]
    pub confidence_interval_cpu_secs: u64,
    #[serde(default = "default_one_day")]
    pub confidence_interval_memory_secs: u64,

    #[serde(default = "default_oom_bump_up_ratio")]
    pub oom_bump_up_ratio: f64,

    #[serde(default = "default_oom_min_bump_up_bytes")]
    pub oom_min_bump_up_bytes: f64,

    /// Aggregate garbage collection cadence
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,

    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,

    /// Cadence of deleting checkpoints whose VPA is gone
    #[serde(default = "default_checkpoint_gc_interval")]
    pub checkpoint_gc_interval_secs: u64,

    /// Upper bound on VPAs checkpointed per iteration
    #[serde(default = "default_max_checkpoints_per_run")]
    pub max_checkpoints_per_run: usize,

    /// Cap applied by the capping processor when a container policy has no maxAllowed CPU
    #[serde(default)]
    pub global_max_allowed_cpu_millicores: Option<u64>,

    /// Cap applied by the capping processor when a container policy has no maxAllowed memory
    #[serde(default)]
    pub global_max_allowed_memory_bytes: Option<u64>,

    /// Publish memory as `Mi`/`Gi` quantities instead of plain bytes
    #[serde(default)]
    pub humanize_memory: bool,

    /// Confidence, in days of history, below which `LowConfidence` is set
    #[serde(default = "default_low_confidence_threshold_days")]
    pub low_confidence_threshold_days: f64,

    /// Capacity of the input hand-off queue
    #[serde(default = "default_input_queue_capacity")]
    pub input_queue_capacity: usize,

    /// Post-processors, applied in order
    #[serde(default = "default_post_processors")]
    pub post_processors: Vec<PostProcessorKind>,
}

fn default_recommender_interval() -> u64 {
    60
}

fn default_one_day() -> u64 {
    24 * 60 * 60
}

fn default_memory_aggregation_interval_count() -> u32 {
    crate::model::DEFAULT_MEMORY_AGGREGATION_INTERVAL_COUNT
}

fn default_bucket_size_growth() -> f64 {
    0.05
}

fn default_target_percentile() -> f64 {
    0.9
}

fn default_lower_bound_percentile() -> f64 {
    0.5
}

fn default_upper_bound_percentile() -> f64 {
    0.95
}

fn default_safety_margin_fraction() -> f64 {
    0.15
}

fn default_pod_min_cpu_millicores() -> f64 {
    crate::estimator::DEFAULT_POD_MIN_CPU_MILLICORES
}

fn default_pod_min_memory_mb() -> f64 {
    crate::estimator::DEFAULT_POD_MIN_MEMORY_MB
}

fn default_oom_bump_up_ratio() -> f64 {
    crate::model::DEFAULT_OOM_BUMP_UP_RATIO
}

fn default_oom_min_bump_up_bytes() -> f64 {
    crate::model::DEFAULT_OOM_MIN_BUMP_UP_BYTES
}

fn default_gc_interval() -> u64 {
    60 * 60
}

fn default_checkpoint_interval() -> u64 {
    60
}

fn default_checkpoint_gc_interval() -> u64 {
    10 * 60
}

fn default_max_checkpoints_per_run() -> usize {
    10
}

fn default_low_confidence_threshold_days() -> f64 {
    1.0
}

fn default_input_queue_capacity() -> usize {
    10_000
}

fn default_post_processors() -> Vec<PostProcessorKind> {
    vec![
        PostProcessorKind::CpuInteger,
        PostProcessorKind::MemoryPerCpu,
        PostProcessorKind::Capping,
    ]
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            recommender_interval_secs: default_recommender_interval(),
            memory_aggregation_interval_secs: default_one_day(),
            memory_aggregation_interval_count: default_memory_aggregation_interval_count(),
            cpu_histogram_decay_half_life_secs: default_one_day(),
            memory_histogram_decay_half_life_secs: default_one_day(),
            histogram_bucket_size_growth: default_bucket_size_growth(),
            target_cpu_percentile: default_target_percentile(),
            lower_bound_cpu_percentile: default_lower_bound_percentile(),
            upper_bound_cpu_percentile: default_upper_bound_percentile(),
            target_memory_percentile: default_target_percentile(),
            lower_bound_memory_percentile: default_lower_bound_percentile(),
            upper_bound_memory_percentile: default_upper_bound_percentile(),
            safety_margin_fraction: default_safety_margin_fraction(),
            pod_min_cpu_millicores: default_pod_min_cpu_millicores(),
            pod_min_memory_mb: default_pod_min_memory_mb(),
            confidence_interval_cpu_secs: default_one_day(),
            confidence_interval_memory_secs: default_one_day(),
            oom_bump_up_ratio: default_oom_bump_up_ratio(),
            oom_min_bump_up_bytes: default_oom_min_bump_up_bytes(),
            gc_interval_secs: default_gc_interval(),
            checkpoint_interval_secs: default_checkpoint_interval(),
            checkpoint_gc_interval_secs: default_checkpoint_gc_interval(),
            max_checkpoints_per_run: default_max_checkpoints_per_run(),
            global_max_allowed_cpu_millicores: None,
            global_max_allowed_memory_bytes: None,
            humanize_memory: false,
            low_confidence_threshold_days: default_low_confidence_threshold_days(),
            input_queue_capacity: default_input_queue_capacity(),
            post_processors: default_post_processors(),
        }
    }
}

impl RecommenderConfig {
    /// Reject settings the recommender cannot run with
    pub fn validate(&self) -> Result<()> {
        let percentiles = [
            self.target_cpu_percentile,
            self.lower_bound_cpu_percentile,
            self.upper_bound_cpu_percentile,
            self.target_memory_percentile,
            self.lower_bound_memory_percentile,
            self.upper_bound_memory_percentile,
        ];
        ensure!(
            percentiles.iter().all(|p| (0.0..=1.0).contains(p)),
            "percentiles must be within [0, 1]"
        );
        ensure!(self.safety_margin_fraction >= 0.0, "safety margin must not be negative");
        ensure!(self.histogram_bucket_size_growth > 0.0, "bucket growth must be positive");
        ensure!(self.memory_aggregation_interval_secs > 0, "memory aggregation interval must be positive");
        ensure!(self.memory_aggregation_interval_count > 0, "memory aggregation interval count must be positive");
        ensure!(self.recommender_interval_secs > 0, "recommender interval must be positive");
        ensure!(
            self.cpu_histogram_decay_half_life_secs > 0 && self.memory_histogram_decay_half_life_secs > 0,
            "histogram decay half-lives must be positive"
        );
        let durations = [
            ("recommender_interval_secs", self.recommender_interval_secs),
            ("memory_aggregation_interval_secs", self.memory_aggregation_interval_secs),
            ("cpu_histogram_decay_half_life_secs", self.cpu_histogram_decay_half_life_secs),
            ("memory_histogram_decay_half_life_secs", self.memory_histogram_decay_half_life_secs),
            ("confidence_interval_cpu_secs", self.confidence_interval_cpu_secs),
            ("confidence_interval_memory_secs", self.confidence_interval_memory_secs),
            ("gc_interval_secs", self.gc_interval_secs),
            ("checkpoint_interval_secs", self.checkpoint_interval_secs),
            ("checkpoint_gc_interval_secs", self.checkpoint_gc_interval_secs),
        ];
        for (name, secs) in durations {
            ensure!(secs <= MAX_DURATION_SECS, "{name} must not exceed {MAX_DURATION_SECS} seconds");
        }
        let window = self
            .memory_aggregation_interval_secs
            .saturating_mul(u64::from(self.memory_aggregation_interval_count));
        ensure!(
            window <= MAX_DURATION_SECS,
            "memory aggregation window must not exceed {MAX_DURATION_SECS} seconds"
        );
        ensure!(self.input_queue_capacity > 0, "input queue capacity must be positive");
        Ok(())
    }

    /// Aggregation parameters derived from this config
    pub fn aggregations(&self) -> HistogramResult<AggregationsConfig> {
        AggregationsConfig::new(
            seconds(self.memory_aggregation_interval_secs),
            self.memory_aggregation_interval_count,
            seconds(self.cpu_histogram_decay_half_life_secs),
            seconds(self.memory_histogram_decay_half_life_secs),
            self.oom_bump_up_ratio,
            self.oom_min_bump_up_bytes,
            self.histogram_bucket_size_growth,
        )
    }

    pub fn recommender_interval(&self) -> Duration {
        Duration::from_secs(self.recommender_interval_secs)
    }

    pub fn gc_interval(&self) -> chrono::Duration {
        seconds(self.gc_interval_secs)
    }

    pub fn checkpoint_interval(&self) -> chrono::Duration {
        seconds(self.checkpoint_interval_secs)
    }

    pub fn checkpoint_gc_interval(&self) -> chrono::Duration {
        seconds(self.checkpoint_gc_interval_secs)
    }
}

/// Saturates instead of overflowing; `validate` keeps real settings far below the limit
fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}
