//! Usage statistics shared by all containers of one aggregation key
//!
//! An aggregate keeps a decaying histogram of CPU usage and one of memory
//! peaks. CPU samples also drive the sample counters and timestamps; memory
//! arrives as one peak per window from the owning containers.

use super::config::AggregationsConfig;
use super::policy::ResolvedContainerPolicy;
use super::{ModelError, ModelResult};
use crate::checkpoint::{CheckpointStatus, CHECKPOINT_VERSION};
use crate::histogram::{DecayingHistogram, MIN_SAMPLE_WEIGHT};
use crate::models::{ContainerUsageSample, ResourceName, Resources, ScalingMode, UpdateMode};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

/// Sample count treated as one "day" of confidence (one sample per minute)
const SAMPLES_PER_CONFIDENCE_DAY: f64 = 60.0 * 24.0;

#[derive(Debug, Clone)]
pub struct AggregateContainerState {
    cpu_usage: DecayingHistogram,
    memory_peaks: DecayingHistogram,
    first_sample_start: Option<DateTime<Utc>>,
    last_sample_start: Option<DateTime<Utc>>,
    total_samples_count: u64,
    creation_time: DateTime<Utc>,
    /// Uncapped target most recently recommended for this aggregate
    pub last_recommendation: Option<Resources>,
    /// Whether any VPA currently selects this aggregate
    pub is_under_vpa: bool,
    pub update_mode: Option<UpdateMode>,
    scaling_mode: ScalingMode,
    controlled_resources: BTreeSet<ResourceName>,
}

impl AggregateContainerState {
    pub fn new(config: &AggregationsConfig, now: DateTime<Utc>) -> Self {
        Self {
            cpu_usage: DecayingHistogram::new(
                config.cpu_histogram_options.clone(),
                config.cpu_histogram_decay_half_life,
            ),
            memory_peaks: DecayingHistogram::new(
                config.memory_histogram_options.clone(),
                config.memory_histogram_decay_half_life,
            ),
            first_sample_start: None,
            last_sample_start: None,
            total_samples_count: 0,
            creation_time: now,
            last_recommendation: None,
            is_under_vpa: false,
            update_mode: None,
            scaling_mode: ScalingMode::Auto,
            controlled_resources: ResourceName::ALL.into_iter().collect(),
        }
    }

    pub fn cpu_usage(&self) -> &DecayingHistogram {
        &self.cpu_usage
    }

    pub fn memory_peaks(&self) -> &DecayingHistogram {
        &self.memory_peaks
    }

    pub fn first_sample_start(&self) -> Option<DateTime<Utc>> {
        self.first_sample_start
    }

    pub fn last_sample_start(&self) -> Option<DateTime<Utc>> {
        self.last_sample_start
    }

    pub fn total_samples_count(&self) -> u64 {
        self.total_samples_count
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn scaling_mode(&self) -> ScalingMode {
        self.scaling_mode
    }

    pub fn controlled_resources(&self) -> &BTreeSet<ResourceName> {
        &self.controlled_resources
    }

    pub fn add_sample(&mut self, sample: &ContainerUsageSample) -> ModelResult<()> {
        match sample.resource {
            ResourceName::Cpu => self.add_cpu_sample(sample),
            ResourceName::Memory => Ok(self.memory_peaks.add_sample(
                sample.usage.bytes(),
                1.0,
                sample.measure_start,
            )?),
        }
    }

    /// Remove a previously added memory peak. CPU samples cannot be removed.
    pub fn subtract_sample(&mut self, sample: &ContainerUsageSample) -> ModelResult<()> {
        match sample.resource {
            ResourceName::Memory => Ok(self.memory_peaks.subtract_sample(
                sample.usage.bytes(),
                1.0,
                sample.measure_start,
            )?),
            ResourceName::Cpu => Err(ModelError::UnsupportedSubtraction(sample.resource)),
        }
    }

    fn add_cpu_sample(&mut self, sample: &ContainerUsageSample) -> ModelResult<()> {
        // Larger requests give new samples more weight, so history fades
        // faster once a container's request is raised.
        let weight = sample.request.cores().max(MIN_SAMPLE_WEIGHT);
        self.cpu_usage
            .add_sample(sample.usage.cores(), weight, sample.measure_start)?;

        if self.last_sample_start.map_or(true, |last| sample.measure_start > last) {
            self.last_sample_start = Some(sample.measure_start);
        }
        if self.first_sample_start.map_or(true, |first| sample.measure_start < first) {
            self.first_sample_start = Some(sample.measure_start);
        }
        self.total_samples_count += 1;
        Ok(())
    }

    /// Add the histograms and counters of `other` into this aggregate
    pub fn merge(&mut self, other: &AggregateContainerState) -> ModelResult<()> {
        self.cpu_usage.merge(&other.cpu_usage)?;
        self.memory_peaks.merge(&other.memory_peaks)?;
        self.first_sample_start = earliest(self.first_sample_start, other.first_sample_start);
        self.last_sample_start = latest(self.last_sample_start, other.last_sample_start);
        self.total_samples_count += other.total_samples_count;
        Ok(())
    }

    pub fn save_checkpoint(&self, now: DateTime<Utc>) -> CheckpointStatus {
        CheckpointStatus {
            version: CHECKPOINT_VERSION.to_string(),
            last_update_time: Some(now),
            first_sample_start: self.first_sample_start,
            last_sample_start: self.last_sample_start,
            total_samples_count: self.total_samples_count,
            cpu_histogram: self.cpu_usage.save_checkpoint(),
            memory_histogram: self.memory_peaks.save_checkpoint(),
        }
    }

    /// Restore counters from a checkpoint and add its histograms. The
    /// aggregate is left untouched if the checkpoint is rejected.
    pub fn load_checkpoint(&mut self, checkpoint: &CheckpointStatus) -> ModelResult<()> {
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(ModelError::CheckpointVersion {
                expected: CHECKPOINT_VERSION.to_string(),
                found: checkpoint.version.clone(),
            });
        }
        let mut cpu_usage = self.cpu_usage.clone();
        cpu_usage.load_checkpoint(&checkpoint.cpu_histogram)?;
        let mut memory_peaks = self.memory_peaks.clone();
        memory_peaks.load_checkpoint(&checkpoint.memory_histogram)?;

        self.cpu_usage = cpu_usage;
        self.memory_peaks = memory_peaks;
        self.first_sample_start = checkpoint.first_sample_start;
        self.last_sample_start = checkpoint.last_sample_start;
        self.total_samples_count = checkpoint.total_samples_count;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples_count == 0 && self.cpu_usage.is_empty() && self.memory_peaks.is_empty()
    }

    /// True once no CPU sample arrived for longer than `window`. Aggregates
    /// that never saw a sample age from their creation time.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let since = self.last_sample_start.unwrap_or(self.creation_time);
        now - since > window
    }

    pub fn update_from_policy(&mut self, policy: &ResolvedContainerPolicy) {
        self.scaling_mode = policy.mode;
        self.controlled_resources = policy.controlled_resources.clone();
    }

    /// Forget VPA-derived settings once no VPA selects this aggregate
    pub fn mark_not_autoscaled(&mut self) {
        self.is_under_vpa = false;
        self.last_recommendation = None;
        self.update_mode = None;
    }

    /// How much history backs this aggregate, in days.
    ///
    /// The smaller of the span between first and last sample and the sample
    /// count read as one sample per minute.
    pub fn confidence(&self) -> f64 {
        let lifespan_days = match (self.first_sample_start, self.last_sample_start) {
            (Some(first), Some(last)) => {
                (last - first).num_milliseconds() as f64 / Duration::days(1).num_milliseconds() as f64
            }
            _ => 0.0,
        };
        let samples_days = self.total_samples_count as f64 / SAMPLES_PER_CONFIDENCE_DAY;
        lifespan_days.min(samples_days).max(0.0)
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
