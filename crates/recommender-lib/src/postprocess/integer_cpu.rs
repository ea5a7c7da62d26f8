//! Round CPU up to whole cores for opted-in containers

use super::{amount, map_tiers, RecommendationPostProcessor};
use crate::model::Vpa;
use crate::models::{RecommendedPodResources, ResourceAmount, ResourceName};

pub const INTEGER_CPU_ANNOTATION_PREFIX: &str = "vpa-post-processor.kubernetes.io/";
const INTEGER_CPU_ANNOTATION_SUFFIX: &str = "_integerCPU";
const INTEGER_CPU_ANNOTATION_VALUE: &str = "true";

const MILLICORES_PER_CORE: u64 = 1000;

/// VPA annotation opting `container_name` into whole-core CPU
pub fn integer_cpu_annotation(container_name: &str) -> String {
    format!("{INTEGER_CPU_ANNOTATION_PREFIX}{container_name}{INTEGER_CPU_ANNOTATION_SUFFIX}")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerCpuPostProcessor;

impl RecommendationPostProcessor for IntegerCpuPostProcessor {
    fn process(&self, vpa: &Vpa, recommendation: RecommendedPodResources) -> RecommendedPodResources {
        let container_recommendations = recommendation
            .container_recommendations
            .into_iter()
            .map(|container| {
                let opted_in = vpa
                    .annotations
                    .get(&integer_cpu_annotation(&container.container_name))
                    .is_some_and(|value| value == INTEGER_CPU_ANNOTATION_VALUE);
                if !opted_in {
                    return container;
                }
                map_tiers(container, |tier| {
                    if let Some(cpu) = amount(tier, ResourceName::Cpu) {
                        tier.insert(ResourceName::Cpu, round_up_to_core(cpu));
                    }
                })
            })
            .collect();
        RecommendedPodResources {
            container_recommendations,
        }
    }
}

fn round_up_to_core(cpu: ResourceAmount) -> ResourceAmount {
    let cores = cpu.value().div_ceil(MILLICORES_PER_CORE);
    ResourceAmount::new(cores.saturating_mul(MILLICORES_PER_CORE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecommendedContainerResources, Resources, VpaId};
    use chrono::{TimeZone, Utc};

    fn recommendation(names: &[&str], cpu_millicores: u64) -> RecommendedPodResources {
        let tier = Resources::from([
            (ResourceName::Cpu, ResourceAmount::new(cpu_millicores)),
            (ResourceName::Memory, ResourceAmount::new(123_456)),
        ]);
        RecommendedPodResources {
            container_recommendations: names
                .iter()
                .map(|name| RecommendedContainerResources {
                    container_name: name.to_string(),
                    target: tier.clone(),
                    lower_bound: tier.clone(),
                    upper_bound: tier.clone(),
                    uncapped_target: tier.clone(),
                })
                .collect(),
        }
    }

    fn vpa_with_annotation(container: &str, value: &str) -> Vpa {
        let mut vpa = Vpa::new(
            VpaId::new("default", "web"),
            None,
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        );
        vpa.annotations
            .insert(integer_cpu_annotation(container), value.to_string());
        vpa
    }

    #[test]
    fn test_annotation_name() {
        assert_eq!(
            integer_cpu_annotation("app"),
            "vpa-post-processor.kubernetes.io/app_integerCPU"
        );
    }

    #[test]
    fn test_rounds_only_annotated_containers() {
        let vpa = vpa_with_annotation("app", "true");
        let processed = IntegerCpuPostProcessor.process(&vpa, recommendation(&["app", "sidecar"], 1250));

        let app = processed.container("app").unwrap();
        for tier in [&app.target, &app.lower_bound, &app.upper_bound] {
            assert_eq!(tier[&ResourceName::Cpu].value(), 2000);
            assert_eq!(tier[&ResourceName::Memory].value(), 123_456);
        }
        assert_eq!(app.uncapped_target[&ResourceName::Cpu].value(), 1250);
        let sidecar = processed.container("sidecar").unwrap();
        assert_eq!(sidecar.target[&ResourceName::Cpu].value(), 1250);
    }

    #[test]
    fn test_whole_cores_unchanged() {
        let vpa = vpa_with_annotation("app", "true");
        let processed = IntegerCpuPostProcessor.process(&vpa, recommendation(&["app"], 3000));
        assert_eq!(processed.container("app").unwrap().target[&ResourceName::Cpu].value(), 3000);
    }

    #[test]
    fn test_other_values_ignored() {
        let vpa = vpa_with_annotation("app", "yes");
        let processed = IntegerCpuPostProcessor.process(&vpa, recommendation(&["app"], 10));
        assert_eq!(processed.container("app").unwrap().target[&ResourceName::Cpu].value(), 10);
    }
}
