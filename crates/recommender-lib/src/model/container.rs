//! Per-container sample intake
//!
//! A container holds no histograms of its own. CPU samples pass straight
//! through to the bound aggregate; memory samples are reduced to one peak
//! per aggregation window, replacing the previous peak whenever a higher
//! one is seen inside the same window.

use super::aggregate::AggregateContainerState;
use super::cluster::AggregateStateKey;
use super::config::AggregationsConfig;
use super::{ModelError, ModelResult};
use crate::models::{ContainerUsageSample, ResourceAmount, ResourceName, Resources};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct ContainerState {
    /// Current resource request
    pub request: Resources,
    aggregate_key: AggregateStateKey,
    last_cpu_sample_start: Option<DateTime<Utc>>,
    last_memory_sample_start: Option<DateTime<Utc>>,
    /// End of the current memory-peak window
    window_end: Option<DateTime<Utc>>,
    memory_peak: ResourceAmount,
    oom_peak: ResourceAmount,
}

impl ContainerState {
    pub fn new(request: Resources, aggregate_key: AggregateStateKey) -> Self {
        Self {
            request,
            aggregate_key,
            last_cpu_sample_start: None,
            last_memory_sample_start: None,
            window_end: None,
            memory_peak: ResourceAmount::ZERO,
            oom_peak: ResourceAmount::ZERO,
        }
    }

    /// Key of the aggregate this container feeds
    pub fn aggregate_key(&self) -> &AggregateStateKey {
        &self.aggregate_key
    }

    pub(crate) fn set_aggregate_key(&mut self, key: AggregateStateKey) {
        self.aggregate_key = key;
    }

    pub fn window_end(&self) -> Option<DateTime<Utc>> {
        self.window_end
    }

    /// Highest memory usage seen in the current window, OOM-derived or not
    pub fn max_memory_peak(&self) -> ResourceAmount {
        self.memory_peak.max(self.oom_peak)
    }

    /// Peak of the still-open window at `now`, with the window end it was
    /// recorded at
    pub fn open_window_peak(&self, now: DateTime<Utc>) -> Option<(ResourceAmount, DateTime<Utc>)> {
        self.window_end
            .filter(|end| now < *end)
            .map(|end| (self.max_memory_peak(), end))
    }

    /// Feed a sample to `aggregate`. Returns false if the sample was
    /// discarded as out of order.
    pub fn add_sample(
        &mut self,
        sample: &ContainerUsageSample,
        aggregate: &mut AggregateContainerState,
        config: &AggregationsConfig,
    ) -> ModelResult<bool> {
        match sample.resource {
            ResourceName::Cpu => self.add_cpu_sample(sample, aggregate),
            ResourceName::Memory => self.add_memory_sample(sample, false, aggregate, config),
        }
    }

    /// Turn an OOM kill into a synthetic memory peak above what the
    /// container was using or requesting at the time
    pub fn record_oom(
        &mut self,
        timestamp: DateTime<Utc>,
        requested_memory: ResourceAmount,
        aggregate: &mut AggregateContainerState,
        config: &AggregationsConfig,
    ) -> ModelResult<()> {
        if let Some(window_end) = self.window_end {
            if timestamp < window_end - config.memory_aggregation_interval {
                return Err(ModelError::OomTooOld { timestamp });
            }
        }
        // The previous OOM peak is left out so repeated OOMs do not compound
        let memory_used = requested_memory.max(self.memory_peak);
        let memory_needed = memory_used
            .saturating_add(ResourceAmount::from_bytes(config.oom_min_bump_up_bytes))
            .max(memory_used.scale(config.oom_bump_up_ratio));

        let sample = ContainerUsageSample {
            measure_start: timestamp,
            usage: memory_needed,
            request: requested_memory,
            resource: ResourceName::Memory,
        };
        if self.add_memory_sample(&sample, true, aggregate, config)? {
            Ok(())
        } else {
            Err(ModelError::OomSampleRejected { timestamp })
        }
    }

    fn add_cpu_sample(
        &mut self,
        sample: &ContainerUsageSample,
        aggregate: &mut AggregateContainerState,
    ) -> ModelResult<bool> {
        if self
            .last_cpu_sample_start
            .is_some_and(|last| sample.measure_start <= last)
        {
            return Ok(false);
        }
        aggregate.add_sample(sample)?;
        self.last_cpu_sample_start = Some(sample.measure_start);
        Ok(true)
    }

    fn add_memory_sample(
        &mut self,
        sample: &ContainerUsageSample,
        is_oom: bool,
        aggregate: &mut AggregateContainerState,
        config: &AggregationsConfig,
    ) -> ModelResult<bool> {
        let ts = sample.measure_start;
        if !is_oom && self.last_memory_sample_start.is_some_and(|last| ts < last) {
            return Ok(false);
        }
        if self.last_memory_sample_start.map_or(true, |last| ts > last) {
            self.last_memory_sample_start = Some(ts);
        }

        let interval = config.memory_aggregation_interval;
        let window_end = self.window_end.unwrap_or(ts);
        let mut add_new_peak = false;

        if ts < window_end {
            let old_peak = self.max_memory_peak();
            if !old_peak.is_zero() && sample.usage > old_peak {
                aggregate.subtract_sample(&peak_sample(old_peak, sample.request, window_end))?;
                add_new_peak = true;
            }
            self.window_end = Some(window_end);
        } else {
            // Jump to the window containing `ts`
            let elapsed = ts - window_end;
            let whole_intervals = elapsed.num_milliseconds() / interval.num_milliseconds().max(1);
            let shift = Duration::milliseconds(whole_intervals * interval.num_milliseconds()) + interval;
            self.window_end = Some(window_end + shift);
            self.memory_peak = ResourceAmount::ZERO;
            self.oom_peak = ResourceAmount::ZERO;
            add_new_peak = true;
        }

        if add_new_peak {
            if let Some(end) = self.window_end {
                aggregate.add_sample(&peak_sample(sample.usage, sample.request, end))?;
            }
            if is_oom {
                self.oom_peak = sample.usage;
            } else {
                self.memory_peak = sample.usage;
            }
        }
        Ok(true)
    }
}

fn peak_sample(usage: ResourceAmount, request: ResourceAmount, window_end: DateTime<Utc>) -> ContainerUsageSample {
    ContainerUsageSample {
        measure_start: window_end,
        usage,
        request,
        resource: ResourceName::Memory,
    }
}
