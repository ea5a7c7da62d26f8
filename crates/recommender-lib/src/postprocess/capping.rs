//! Clamp recommendations to the container policy's allowed range

use super::{map_tiers, RecommendationPostProcessor};
use crate::config::RecommenderConfig;
use crate::model::{resolve_container_policy, Vpa};
use crate::models::{RecommendedPodResources, ResourceAmount, ResourceName, Resources};

/// Clamps every tier into `[minAllowed, maxAllowed]`. A global maximum
/// stands in for resources the policy sets no maximum for. When the
/// policy's minimum is above its maximum the minimum wins.
#[derive(Debug, Clone, Default)]
pub struct CappingPostProcessor {
    global_max_allowed: Resources,
}

impl CappingPostProcessor {
    pub fn new(global_max_allowed: Resources) -> Self {
        Self { global_max_allowed }
    }

    pub fn from_config(config: &RecommenderConfig) -> Self {
        let mut global_max_allowed = Resources::new();
        if let Some(cpu) = config.global_max_allowed_cpu_millicores {
            global_max_allowed.insert(ResourceName::Cpu, ResourceAmount::new(cpu));
        }
        if let Some(memory) = config.global_max_allowed_memory_bytes {
            global_max_allowed.insert(ResourceName::Memory, ResourceAmount::new(memory));
        }
        Self::new(global_max_allowed)
    }
}

impl RecommendationPostProcessor for CappingPostProcessor {
    fn process(&self, vpa: &Vpa, recommendation: RecommendedPodResources) -> RecommendedPodResources {
        let container_recommendations = recommendation
            .container_recommendations
            .into_iter()
            .map(|container| {
                let policy = resolve_container_policy(vpa.resource_policy.as_ref(), &container.container_name);
                let mut max_allowed = self.global_max_allowed.clone();
                max_allowed.extend(policy.max_allowed.iter().map(|(k, v)| (*k, *v)));

                map_tiers(container, |tier| {
                    for (resource, amount) in tier.iter_mut() {
                        if let Some(max) = max_allowed.get(resource) {
                            *amount = (*amount).min(*max);
                        }
                        if let Some(min) = policy.min_allowed.get(resource) {
                            *amount = (*amount).max(*min);
                        }
                    }
                })
            })
            .collect();
        RecommendedPodResources {
            container_recommendations,
        }
    }
}
