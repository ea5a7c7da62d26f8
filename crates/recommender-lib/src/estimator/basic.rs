use super::ResourceEstimator;
use crate::model::AggregateContainerState;
use crate::models::{ResourceAmount, ResourceName, Resources};

/// Reads one percentile from each of the aggregate's histograms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PercentileEstimator {
    cpu_percentile: f64,
    memory_percentile: f64,
}

impl PercentileEstimator {
    pub fn new(cpu_percentile: f64, memory_percentile: f64) -> Self {
        Self {
            cpu_percentile,
            memory_percentile,
        }
    }
}

impl ResourceEstimator for PercentileEstimator {
    fn estimate(&self, state: &AggregateContainerState) -> Resources {
        Resources::from([
            (
                ResourceName::Cpu,
                ResourceAmount::from_cores(state.cpu_usage().percentile(self.cpu_percentile)),
            ),
            (
                ResourceName::Memory,
                ResourceAmount::from_bytes(state.memory_peaks().percentile(self.memory_percentile)),
            ),
        ])
    }
}

/// Always returns the same resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConstEstimator {
    resources: Resources,
}

impl ConstEstimator {
    pub fn new(resources: Resources) -> Self {
        Self { resources }
    }
}

impl ResourceEstimator for ConstEstimator {
    fn estimate(&self, _state: &AggregateContainerState) -> Resources {
        self.resources.clone()
    }
}
