//! Aggregation parameters shared by the cluster state and its aggregates

use crate::histogram::{
    cpu_histogram_options, default_cpu_histogram_options, default_memory_histogram_options,
    memory_histogram_options, HistogramResult, SharedOptions,
};
use chrono::Duration;

/// Memory added on top of the observed usage after an OOM kill
pub const DEFAULT_OOM_MIN_BUMP_UP_BYTES: f64 = 100.0 * 1024.0 * 1024.0;
pub const DEFAULT_OOM_BUMP_UP_RATIO: f64 = 1.2;
pub const DEFAULT_MEMORY_AGGREGATION_INTERVAL_COUNT: u32 = 8;

#[derive(Debug, Clone)]
pub struct AggregationsConfig {
    /// Length of a single memory-peak window
    pub memory_aggregation_interval: Duration,
    /// Number of windows kept; together with the interval this is the history length
    pub memory_aggregation_interval_count: u32,
    pub cpu_histogram_decay_half_life: Duration,
    pub memory_histogram_decay_half_life: Duration,
    pub oom_bump_up_ratio: f64,
    pub oom_min_bump_up_bytes: f64,
    pub cpu_histogram_options: SharedOptions,
    pub memory_histogram_options: SharedOptions,
}

impl AggregationsConfig {
    /// Build a config, creating the histogram layouts for `bucket_growth`
    /// (relative growth of consecutive bucket widths, e.g. 0.05).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory_aggregation_interval: Duration,
        memory_aggregation_interval_count: u32,
        cpu_histogram_decay_half_life: Duration,
        memory_histogram_decay_half_life: Duration,
        oom_bump_up_ratio: f64,
        oom_min_bump_up_bytes: f64,
        bucket_growth: f64,
    ) -> HistogramResult<Self> {
        Ok(Self {
            memory_aggregation_interval,
            memory_aggregation_interval_count,
            cpu_histogram_decay_half_life,
            memory_histogram_decay_half_life,
            oom_bump_up_ratio,
            oom_min_bump_up_bytes,
            cpu_histogram_options: cpu_histogram_options(1.0 + bucket_growth)?,
            memory_histogram_options: memory_histogram_options(1.0 + bucket_growth)?,
        })
    }

    /// Total history retained for memory peaks (interval × count)
    pub fn memory_aggregation_window_length(&self) -> Duration {
        i32::try_from(self.memory_aggregation_interval_count)
            .ok()
            .and_then(|count| self.memory_aggregation_interval.checked_mul(count))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for AggregationsConfig {
    fn default() -> Self {
        Self {
            memory_aggregation_interval: Duration::hours(24),
            memory_aggregation_interval_count: DEFAULT_MEMORY_AGGREGATION_INTERVAL_COUNT,
            cpu_histogram_decay_half_life: Duration::hours(24),
            memory_histogram_decay_half_life: Duration::hours(24),
            oom_bump_up_ratio: DEFAULT_OOM_BUMP_UP_RATIO,
            oom_min_bump_up_bytes: DEFAULT_OOM_MIN_BUMP_UP_BYTES,
            cpu_histogram_options: default_cpu_histogram_options(),
            memory_histogram_options: default_memory_histogram_options(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_window_is_eight_days() {
        let config = AggregationsConfig::default();
        assert_eq!(config.memory_aggregation_window_length(), Duration::days(8));
    }

    #[test]
    fn test_invalid_growth_rejected() {
        let result = AggregationsConfig::new(
            Duration::hours(24),
            8,
            Duration::hours(24),
            Duration::hours(24),
            1.2,
            DEFAULT_OOM_MIN_BUMP_UP_BYTES,
            0.0,
        );
        assert!(result.is_err());
    }
}
