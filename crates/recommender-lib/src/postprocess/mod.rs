//! Recommendation post-processing
//!
//! Post-processors run in the configured order on the estimator output
//! before it is stored on the VPA. Each one is a total function of the VPA
//! and the recommendation; policy conflicts are reported through VPA
//! conditions by the recommender, not here.

mod capping;
mod integer_cpu;
mod memory_ratio;

pub use capping::CappingPostProcessor;
pub use integer_cpu::{integer_cpu_annotation, IntegerCpuPostProcessor, INTEGER_CPU_ANNOTATION_PREFIX};
pub use memory_ratio::MemoryPerCpuPostProcessor;

use crate::config::RecommenderConfig;
use crate::model::Vpa;
use crate::models::{RecommendedContainerResources, RecommendedPodResources, ResourceAmount, ResourceName, Resources};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

pub trait RecommendationPostProcessor: Send + Sync + Debug {
    fn process(&self, vpa: &Vpa, recommendation: RecommendedPodResources) -> RecommendedPodResources;
}

pub type SharedPostProcessor = Arc<dyn RecommendationPostProcessor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PostProcessorKind {
    Capping,
    CpuInteger,
    MemoryPerCpu,
}

/// Build the processors for `config.post_processors`, in order
pub fn build_post_processors(config: &RecommenderConfig) -> Vec<SharedPostProcessor> {
    config
        .post_processors
        .iter()
        .map(|kind| -> SharedPostProcessor {
            match kind {
                PostProcessorKind::Capping => Arc::new(CappingPostProcessor::from_config(config)),
                PostProcessorKind::CpuInteger => Arc::new(IntegerCpuPostProcessor),
                PostProcessorKind::MemoryPerCpu => Arc::new(MemoryPerCpuPostProcessor),
            }
        })
        .collect()
}

/// Run `recommendation` through every processor, left to right
pub fn apply_post_processors(
    processors: &[SharedPostProcessor],
    vpa: &Vpa,
    recommendation: RecommendedPodResources,
) -> RecommendedPodResources {
    processors
        .iter()
        .fold(recommendation, |current, processor| processor.process(vpa, current))
}

/// Apply `f` to the target, lower bound and upper bound of a container.
/// The uncapped target is left as estimated.
fn map_tiers(
    mut container: RecommendedContainerResources,
    mut f: impl FnMut(&mut Resources),
) -> RecommendedContainerResources {
    f(&mut container.target);
    f(&mut container.lower_bound);
    f(&mut container.upper_bound);
    container
}

fn amount(resources: &Resources, resource: ResourceName) -> Option<ResourceAmount> {
    resources.get(&resource).copied()
}
