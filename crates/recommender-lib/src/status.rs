//! Published VPA status
//!
//! The document the recommender hands to its status writer after every
//! iteration. CPU is rendered in millicores (`250m`); memory in bytes or,
//! when humanized, as `Mi`/`Gi` with two decimals.

use crate::model::{Vpa, VpaCondition};
use crate::models::{RecommendedContainerResources, ResourceAmount, ResourceName, Resources};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * MIB;

/// Rendered quantities, keyed by resource
pub type Quantities = BTreeMap<ResourceName, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRecommendationStatus {
    pub container_name: String,
    pub target: Quantities,
    pub lower_bound: Quantities,
    pub upper_bound: Quantities,
    pub uncapped_target: Quantities,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationStatus {
    pub container_recommendations: Vec<ContainerRecommendationStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaStatus {
    pub namespace: String,
    pub name: String,
    pub conditions: Vec<VpaCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<RecommendationStatus>,
    pub pod_count: usize,
    pub containers_per_pod: usize,
    pub last_updated: DateTime<Utc>,
}

impl VpaStatus {
    pub fn from_vpa(vpa: &Vpa, humanize_memory: bool, now: DateTime<Utc>) -> Self {
        let recommendation = vpa
            .recommendation
            .as_ref()
            .filter(|r| !r.is_empty())
            .map(|r| RecommendationStatus {
                container_recommendations: r
                    .container_recommendations
                    .iter()
                    .map(|c| container_status(c, humanize_memory))
                    .collect(),
            });
        Self {
            namespace: vpa.id.namespace.clone(),
            name: vpa.id.vpa_name.clone(),
            conditions: vpa.conditions.iter().cloned().collect(),
            recommendation,
            pod_count: vpa.pod_count,
            containers_per_pod: vpa.containers_per_pod,
            last_updated: now,
        }
    }
}

fn container_status(container: &RecommendedContainerResources, humanize: bool) -> ContainerRecommendationStatus {
    let render = |resources: &Resources| -> Quantities {
        resources
            .iter()
            .map(|(resource, amount)| (*resource, format_quantity(*resource, *amount, humanize)))
            .collect()
    };
    ContainerRecommendationStatus {
        container_name: container.container_name.clone(),
        target: render(&container.target),
        lower_bound: render(&container.lower_bound),
        upper_bound: render(&container.upper_bound),
        uncapped_target: render(&container.uncapped_target),
    }
}

pub fn format_quantity(resource: ResourceName, amount: ResourceAmount, humanize_memory: bool) -> String {
    match resource {
        ResourceName::Cpu => format!("{}m", amount.value()),
        ResourceName::Memory if humanize_memory => humanize_bytes(amount.value()),
        ResourceName::Memory => amount.value().to_string(),
    }
}

fn humanize_bytes(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes >= GIB {
        format!("{:.2}Gi", bytes / GIB)
    } else {
        format!("{:.2}Mi", bytes / MIB)
    }
}
