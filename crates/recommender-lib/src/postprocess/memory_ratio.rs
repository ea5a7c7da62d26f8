//! Keep memory and CPU at the policy's memory-per-core ratio

use super::{amount, map_tiers, RecommendationPostProcessor};
use crate::model::{resolve_container_policy, Vpa};
use crate::models::{RecommendedPodResources, ResourceAmount, ResourceName, Resources};

/// For containers whose policy sets `memoryPerCPU`, raises whichever of
/// CPU and memory falls short of the ratio. Nothing is ever lowered.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryPerCpuPostProcessor;

impl RecommendationPostProcessor for MemoryPerCpuPostProcessor {
    fn process(&self, vpa: &Vpa, recommendation: RecommendedPodResources) -> RecommendedPodResources {
        let container_recommendations = recommendation
            .container_recommendations
            .into_iter()
            .map(|container| {
                let policy = resolve_container_policy(vpa.resource_policy.as_ref(), &container.container_name);
                match policy.memory_per_cpu {
                    Some(ratio) if !ratio.is_zero() => {
                        map_tiers(container, |tier| apply_ratio(tier, ratio.value()))
                    }
                    _ => container,
                }
            })
            .collect();
        RecommendedPodResources {
            container_recommendations,
        }
    }
}

/// `bytes_per_core` is memory per 1000 millicores
fn apply_ratio(tier: &mut Resources, bytes_per_core: u64) {
    let (Some(cpu), Some(memory)) = (amount(tier, ResourceName::Cpu), amount(tier, ResourceName::Memory)) else {
        return;
    };
    if cpu.is_zero() || memory.is_zero() {
        return;
    }
    let ratio = u128::from(bytes_per_core);
    let memory_for = |millicores: u64| (u128::from(millicores) * ratio).div_ceil(1000);

    let desired_memory = memory_for(cpu.value());
    let memory_bytes = u128::from(memory.value());
    if memory_bytes < desired_memory {
        tier.insert(ResourceName::Memory, saturating(desired_memory));
    } else if memory_bytes > desired_memory {
        let raised_cpu = saturating((memory_bytes * 1000).div_ceil(ratio));
        tier.insert(ResourceName::Cpu, raised_cpu);
        // Whole millicores can overshoot the ratio slightly; follow with memory
        let matched_memory = saturating(memory_for(raised_cpu.value()));
        tier.insert(ResourceName::Memory, memory.max(matched_memory));
    }
}

fn saturating(value: u128) -> ResourceAmount {
    ResourceAmount::new(u64::try_from(value).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerResourcePolicy, PodResourcePolicy, RecommendedContainerResources, VpaId};
    use chrono::{TimeZone, Utc};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn vpa(bytes_per_core: u64) -> Vpa {
        let mut vpa = Vpa::new(
            VpaId::new("default", "web"),
            None,
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        );
        vpa.resource_policy = Some(PodResourcePolicy {
            container_policies: vec![ContainerResourcePolicy {
                container_name: "app".to_string(),
                memory_per_cpu: Some(ResourceAmount::new(bytes_per_core)),
                ..Default::default()
            }],
        });
        vpa
    }

    fn single(cpu: u64, memory: u64) -> RecommendedPodResources {
        let tier = Resources::from([
            (ResourceName::Cpu, ResourceAmount::new(cpu)),
            (ResourceName::Memory, ResourceAmount::new(memory)),
        ]);
        RecommendedPodResources {
            container_recommendations: vec![RecommendedContainerResources {
                container_name: "app".to_string(),
                target: tier.clone(),
                lower_bound: tier.clone(),
                upper_bound: tier.clone(),
                uncapped_target: tier,
            }],
        }
    }

    fn target(recommendation: &RecommendedPodResources) -> (u64, u64) {
        let target = &recommendation.container("app").unwrap().target;
        (target[&ResourceName::Cpu].value(), target[&ResourceName::Memory].value())
    }

    #[test]
    fn test_memory_raised_to_ratio() {
        let processed = MemoryPerCpuPostProcessor.process(&vpa(4 * GIB), single(1000, GIB));
        assert_eq!(target(&processed), (1000, 4 * GIB));
    }

    #[test]
    fn test_cpu_raised_to_ratio() {
        let processed = MemoryPerCpuPostProcessor.process(&vpa(4 * GIB), single(1000, 8 * GIB));
        assert_eq!(target(&processed), (2000, 8 * GIB));
    }

    #[test]
    fn test_idempotent_and_ratio_holds() {
        let vpa = vpa(3 * GIB);
        for (cpu, memory) in [(333, GIB), (1, 10 * GIB), (2500, 7), (999, 3 * GIB + 17)] {
            let once = MemoryPerCpuPostProcessor.process(&vpa, single(cpu, memory));
            let twice = MemoryPerCpuPostProcessor.process(&vpa, once.clone());
            assert_eq!(once, twice);

            let (cpu, memory) = target(&once);
            assert!(u128::from(memory) * 1000 >= u128::from(cpu) * u128::from(3 * GIB));
        }
    }

    #[test]
    fn test_containers_without_ratio_untouched() {
        let mut vpa = vpa(4 * GIB);
        vpa.resource_policy = None;
        let processed = MemoryPerCpuPostProcessor.process(&vpa, single(1000, GIB));
        assert_eq!(target(&processed), (1000, GIB));
    }

    #[test]
    fn test_zero_amounts_skipped() {
        let processed = MemoryPerCpuPostProcessor.process(&vpa(4 * GIB), single(0, GIB));
        assert_eq!(target(&processed), (0, GIB));
    }
}
