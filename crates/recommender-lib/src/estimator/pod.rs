//! Per-pod recommendation assembly

use super::{
    ConfidenceMultiplierEstimator, MarginEstimator, MinResourcesEstimator, PercentileEstimator,
    ResourceEstimator, SharedEstimator,
};
use crate::config::RecommenderConfig;
use crate::model::AggregateContainerState;
use crate::models::{
    filter_controlled_resources, RecommendedContainerResources, RecommendedPodResources,
    ResourceAmount, ResourceName, Resources,
};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DEFAULT_POD_MIN_CPU_MILLICORES: f64 = 25.0;
pub const DEFAULT_POD_MIN_MEMORY_MB: f64 = 250.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Produces target, lower bound and upper bound for every container of a
/// VPA's pods.
///
/// Each tier is a percentile with a safety margin. The upper bound is
/// inflated and the lower bound deflated while history is short. Pod-wide
/// floors are split evenly across the containers being recommended.
#[derive(Debug, Clone)]
pub struct PodResourceRecommender {
    target: SharedEstimator,
    lower_bound: SharedEstimator,
    upper_bound: SharedEstimator,
    pod_min_cpu_millicores: f64,
    pod_min_memory_mb: f64,
}

impl PodResourceRecommender {
    pub fn new(
        target: SharedEstimator,
        lower_bound: SharedEstimator,
        upper_bound: SharedEstimator,
        pod_min_cpu_millicores: f64,
        pod_min_memory_mb: f64,
    ) -> Self {
        Self {
            target,
            lower_bound,
            upper_bound,
            pod_min_cpu_millicores,
            pod_min_memory_mb,
        }
    }

    pub fn from_config(config: &RecommenderConfig) -> Self {
        let margin = config.safety_margin_fraction;
        let tier = |cpu: f64, memory: f64| -> SharedEstimator {
            Arc::new(MarginEstimator::new(
                margin,
                Arc::new(PercentileEstimator::new(cpu, memory)),
            ))
        };
        let target = tier(config.target_cpu_percentile, config.target_memory_percentile);
        let lower_bound = tier(
            config.lower_bound_cpu_percentile,
            config.lower_bound_memory_percentile,
        );
        let upper_bound = tier(
            config.upper_bound_cpu_percentile,
            config.upper_bound_memory_percentile,
        );

        Self::new(
            target,
            Arc::new(ConfidenceMultiplierEstimator::new(0.001, -2.0, lower_bound)),
            Arc::new(ConfidenceMultiplierEstimator::new(1.0, 1.0, upper_bound)),
            config.pod_min_cpu_millicores,
            config.pod_min_memory_mb,
        )
    }

    /// Floors for one of `containers` containers
    fn min_resources(&self, containers: usize) -> Resources {
        let fraction = 1.0 / containers.max(1) as f64;
        Resources::from([
            (
                ResourceName::Cpu,
                ResourceAmount::from_f64(self.pod_min_cpu_millicores).scale(fraction),
            ),
            (
                ResourceName::Memory,
                ResourceAmount::from_bytes(self.pod_min_memory_mb * BYTES_PER_MB).scale(fraction),
            ),
        ])
    }

    /// Recommend resources for every container state, keyed by container name
    pub fn recommend(
        &self,
        states: &BTreeMap<String, AggregateContainerState>,
    ) -> RecommendedPodResources {
        if states.is_empty() {
            return RecommendedPodResources::default();
        }
        let min_resources = self.min_resources(states.len());
        let floored = |base: &SharedEstimator| MinResourcesEstimator::new(min_resources.clone(), base.clone());
        let target = floored(&self.target);
        let lower_bound = floored(&self.lower_bound);
        let upper_bound = floored(&self.upper_bound);

        let container_recommendations = states
            .iter()
            .map(|(name, state)| {
                let controlled = state.controlled_resources();
                let target = filter_controlled_resources(&target.estimate(state), controlled);
                RecommendedContainerResources {
                    container_name: name.clone(),
                    uncapped_target: target.clone(),
                    target,
                    lower_bound: filter_controlled_resources(&lower_bound.estimate(state), controlled),
                    upper_bound: filter_controlled_resources(&upper_bound.estimate(state), controlled),
                }
            })
            .collect();
        RecommendedPodResources {
            container_recommendations,
        }
    }
}

impl Default for PodResourceRecommender {
    fn default() -> Self {
        Self::from_config(&RecommenderConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AggregationsConfig, ResolvedContainerPolicy};
    use crate::models::ContainerUsageSample;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::BTreeSet;

    const MIB: f64 = 1024.0 * 1024.0;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn cpu(at: DateTime<Utc>, cores: f64, request: f64) -> ContainerUsageSample {
        ContainerUsageSample {
            measure_start: at,
            usage: ResourceAmount::from_cores(cores),
            request: ResourceAmount::from_cores(request),
            resource: ResourceName::Cpu,
        }
    }

    fn memory(at: DateTime<Utc>, bytes: f64) -> ContainerUsageSample {
        ContainerUsageSample {
            measure_start: at,
            usage: ResourceAmount::from_bytes(bytes),
            request: ResourceAmount::ZERO,
            resource: ResourceName::Memory,
        }
    }

    fn new_state() -> AggregateContainerState {
        AggregateContainerState::new(&AggregationsConfig::default(), t0())
    }

    #[test]
    fn test_steady_cpu_load() {
        let mut state = new_state();
        for (minutes, cores) in [(0, 1.0), (30, 2.0), (60, 3.0)] {
            state.add_sample(&cpu(t0() + Duration::minutes(minutes), cores, 3.0)).unwrap();
        }
        let target_percentile = state.cpu_usage().percentile(0.9);
        assert!(target_percentile > 3.0 && target_percentile <= 3.16);

        let states = BTreeMap::from([("app".to_string(), state)]);
        let recommendation = PodResourceRecommender::default().recommend(&states);
        let app = recommendation.container("app").unwrap();

        let target_cpu = app.target[&ResourceName::Cpu].cores();
        assert!((target_cpu - target_percentile * 1.15).abs() < 0.002, "target {target_cpu}");
        // No memory history: the floor for a single container
        assert_eq!(
            app.target[&ResourceName::Memory],
            ResourceAmount::from_bytes(250.0 * MIB)
        );
        assert_eq!(app.uncapped_target, app.target);
    }

    #[test]
    fn test_short_history_widens_bounds() {
        let mut state = new_state();
        // Five samples spanning five minutes
        for minute in [0, 1, 2, 3, 5] {
            state.add_sample(&cpu(t0() + Duration::minutes(minute), 1.0, 1.0)).unwrap();
        }
        let lower_percentile = state.cpu_usage().percentile(0.5);
        let upper_percentile = state.cpu_usage().percentile(0.95);

        let states = BTreeMap::from([("app".to_string(), state)]);
        let recommendation = PodResourceRecommender::default().recommend(&states);
        let app = recommendation.container("app").unwrap();

        let upper = app.upper_bound[&ResourceName::Cpu].cores();
        let lower = app.lower_bound[&ResourceName::Cpu].cores();
        assert!(upper >= 3.0 * upper_percentile, "upper {upper}");
        assert!(lower < 0.7 * lower_percentile * 1.15, "lower {lower}");
        assert!(lower <= app.target[&ResourceName::Cpu].cores());
        assert!(app.target[&ResourceName::Cpu].cores() <= upper);
    }

    #[test]
    fn test_bounds_ordered_with_long_history() {
        let mut state = new_state();
        for i in 0..(3 * 1440) {
            let cores = 0.5 + (i % 10) as f64 * 0.1;
            state.add_sample(&cpu(t0() + Duration::minutes(i), cores, 1.0)).unwrap();
            if i % 60 == 0 {
                state
                    .add_sample(&memory(t0() + Duration::minutes(i), (300 + i % 200) as f64 * MIB))
                    .unwrap();
            }
        }
        let states = BTreeMap::from([("app".to_string(), state)]);
        let recommendation = PodResourceRecommender::default().recommend(&states);
        let app = recommendation.container("app").unwrap();
        for resource in ResourceName::ALL {
            assert!(app.lower_bound[&resource] <= app.target[&resource]);
            assert!(app.target[&resource] <= app.upper_bound[&resource]);
        }
    }

    #[test]
    fn test_floors_split_across_containers() {
        let mut states = BTreeMap::new();
        for name in ["app", "sidecar"] {
            let mut state = new_state();
            state.add_sample(&cpu(t0(), 0.001, 0.1)).unwrap();
            states.insert(name.to_string(), state);
        }
        let recommendation = PodResourceRecommender::default().recommend(&states);
        assert_eq!(recommendation.container_recommendations.len(), 2);
        for container in &recommendation.container_recommendations {
            for tier in [&container.target, &container.lower_bound, &container.upper_bound] {
                assert!(tier[&ResourceName::Cpu].value() >= 12);
                assert!(tier[&ResourceName::Memory].bytes() >= 125.0 * MIB - 1.0);
            }
        }
    }

    #[test]
    fn test_uncontrolled_resources_left_out() {
        let mut state = new_state();
        state.add_sample(&cpu(t0(), 1.0, 1.0)).unwrap();
        state.update_from_policy(&ResolvedContainerPolicy {
            controlled_resources: BTreeSet::from([ResourceName::Cpu]),
            ..Default::default()
        });
        let states = BTreeMap::from([("app".to_string(), state)]);
        let recommendation = PodResourceRecommender::default().recommend(&states);
        let app = recommendation.container("app").unwrap();
        assert!(app.target.contains_key(&ResourceName::Cpu));
        assert!(!app.target.contains_key(&ResourceName::Memory));
        assert!(!app.upper_bound.contains_key(&ResourceName::Memory));
    }

    #[test]
    fn test_no_containers_no_recommendation() {
        let recommendation = PodResourceRecommender::default().recommend(&BTreeMap::new());
        assert!(recommendation.is_empty());
    }
}
