//! Per-container resource policy resolution
//!
//! A container's effective policy starts from the defaults, takes the
//! fields set on the `*` entry and then the fields set on the entry named
//! after the container.

use crate::models::{
    ContainerResourcePolicy, PodResourcePolicy, ResourceAmount, ResourceName, Resources,
    ScalingMode,
};
use std::collections::BTreeSet;

/// Container name matching every container in a policy
pub const WILDCARD_CONTAINER_NAME: &str = "*";

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedContainerPolicy {
    pub mode: ScalingMode,
    pub controlled_resources: BTreeSet<ResourceName>,
    pub min_allowed: Resources,
    pub max_allowed: Resources,
    pub memory_per_cpu: Option<ResourceAmount>,
}

impl Default for ResolvedContainerPolicy {
    fn default() -> Self {
        Self {
            mode: ScalingMode::Auto,
            controlled_resources: ResourceName::ALL.into_iter().collect(),
            min_allowed: Resources::new(),
            max_allowed: Resources::new(),
            memory_per_cpu: None,
        }
    }
}

impl ResolvedContainerPolicy {
    fn apply(&mut self, entry: &ContainerResourcePolicy) {
        if let Some(mode) = entry.mode {
            self.mode = mode;
        }
        if let Some(controlled) = &entry.controlled_resources {
            self.controlled_resources = controlled.iter().copied().collect();
        }
        self.min_allowed
            .extend(entry.min_allowed.iter().map(|(k, v)| (*k, *v)));
        self.max_allowed
            .extend(entry.max_allowed.iter().map(|(k, v)| (*k, *v)));
        if entry.memory_per_cpu.is_some() {
            self.memory_per_cpu = entry.memory_per_cpu;
        }
    }

    /// Resources whose `minAllowed` is above `maxAllowed`
    pub fn conflicting_resources(&self) -> Vec<ResourceName> {
        self.min_allowed
            .iter()
            .filter(|(resource, min)| self.max_allowed.get(resource).is_some_and(|max| *min > max))
            .map(|(resource, _)| *resource)
            .collect()
    }
}

/// Effective policy for `container_name`
pub fn resolve_container_policy(
    policy: Option<&PodResourcePolicy>,
    container_name: &str,
) -> ResolvedContainerPolicy {
    let mut resolved = ResolvedContainerPolicy::default();
    let Some(policy) = policy else {
        return resolved;
    };
    if let Some(wildcard) = policy
        .container_policies
        .iter()
        .find(|p| p.container_name == WILDCARD_CONTAINER_NAME)
    {
        resolved.apply(wildcard);
    }
    if let Some(exact) = policy
        .container_policies
        .iter()
        .find(|p| p.container_name == container_name)
    {
        resolved.apply(exact);
    }
    resolved
}
