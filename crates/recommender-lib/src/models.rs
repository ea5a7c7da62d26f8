//! Core data models for the recommender
//!
//! Identifiers, resource quantities, usage samples and the input objects
//! handed to the recommender by its external sources (pod listings, VPA
//! objects, metrics snapshots and OOM events).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Upper bound for any resource quantity (CPU millicores or memory bytes)
pub const MAX_RESOURCE_AMOUNT: u64 = 100_000_000_000_000;

/// Compute resources tracked by the recommender
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Cpu,
    Memory,
}

impl ResourceName {
    pub const ALL: [ResourceName; 2] = [ResourceName::Cpu, ResourceName::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceName::Cpu => "cpu",
            ResourceName::Memory => "memory",
        }
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Amount of a resource: millicores for CPU, bytes for memory.
///
/// Always within `[0, MAX_RESOURCE_AMOUNT]`; arithmetic saturates instead
/// of overflowing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceAmount(u64);

impl ResourceAmount {
    pub const ZERO: ResourceAmount = ResourceAmount(0);
    pub const MAX: ResourceAmount = ResourceAmount(MAX_RESOURCE_AMOUNT);

    pub fn new(value: u64) -> Self {
        Self(value.min(MAX_RESOURCE_AMOUNT))
    }

    /// Convert a float, clamping negatives and NaN to zero and large values to the maximum
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() || value <= 0.0 {
            Self::ZERO
        } else if value >= MAX_RESOURCE_AMOUNT as f64 {
            Self::MAX
        } else {
            Self(value as u64)
        }
    }

    pub fn from_cores(cores: f64) -> Self {
        Self::from_f64(cores * 1000.0)
    }

    pub fn from_millicores(millicores: u64) -> Self {
        Self::new(millicores)
    }

    pub fn from_bytes(bytes: f64) -> Self {
        Self::from_f64(bytes)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn cores(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn bytes(self) -> f64 {
        self.0 as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Multiply by `factor`, saturating at both ends
    pub fn scale(self, factor: f64) -> Self {
        Self::from_f64(self.0 as f64 * factor)
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self::new(self.0.saturating_add(other.0))
    }
}

impl fmt::Display for ResourceAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Map from resource to amount. Estimators always fill both resources;
/// filtered recommendations may carry a subset.
pub type Resources = BTreeMap<ResourceName, ResourceAmount>;

/// Keep only the entries of `resources` that are in `controlled`
pub fn filter_controlled_resources(
    resources: &Resources,
    controlled: &BTreeSet<ResourceName>,
) -> Resources {
    resources
        .iter()
        .filter(|(name, _)| controlled.contains(name))
        .map(|(name, amount)| (*name, *amount))
        .collect()
}

/// Unique pod identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodId {
    pub namespace: String,
    pub pod_name: String,
}

impl PodId {
    pub fn new(namespace: impl Into<String>, pod_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod_name: pod_name.into(),
        }
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod_name)
    }
}

/// Container identifier, unique within its pod
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId {
    pub pod_id: PodId,
    pub container_name: String,
}

impl ContainerId {
    pub fn new(pod_id: PodId, container_name: impl Into<String>) -> Self {
        Self {
            pod_id,
            container_name: container_name.into(),
        }
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pod_id, self.container_name)
    }
}

/// VPA object identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VpaId {
    pub namespace: String,
    pub vpa_name: String,
}

impl VpaId {
    pub fn new(namespace: impl Into<String>, vpa_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            vpa_name: vpa_name.into(),
        }
    }
}

impl fmt::Display for VpaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.vpa_name)
    }
}

/// Single measurement of one resource of one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsageSample {
    /// Start of the measurement interval
    pub measure_start: DateTime<Utc>,
    /// Observed usage
    pub usage: ResourceAmount,
    /// Container request at the time of the measurement
    pub request: ResourceAmount,
    pub resource: ResourceName,
}

/// Usage sample together with the container it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsageSampleWithKey {
    pub container: ContainerId,
    pub sample: ContainerUsageSample,
}

/// Pod lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    Unknown,
}

impl PodPhase {
    /// Succeeded and failed pods will never run again
    pub fn is_terminal(&self) -> bool {
        match self {
            PodPhase::Succeeded | PodPhase::Failed => true,
            PodPhase::Pending | PodPhase::Running | PodPhase::Unknown => false,
        }
    }
}

/// Container as reported by the pod listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    #[serde(default)]
    pub request: Resources,
}

/// Pod as reported by the pod listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub id: PodId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

/// Usage snapshot for one container from the metrics source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetricsSnapshot {
    pub id: ContainerId,
    pub snapshot_time: DateTime<Utc>,
    /// Length of the window the usage was averaged over
    #[serde(default)]
    pub window_secs: u64,
    pub usage: Resources,
}

impl ContainerMetricsSnapshot {
    /// Split the snapshot into one sample per reported resource
    pub fn into_samples(self) -> Vec<ContainerUsageSampleWithKey> {
        let id = self.id;
        let snapshot_time = self.snapshot_time;
        self.usage
            .into_iter()
            .map(|(resource, usage)| ContainerUsageSampleWithKey {
                container: id.clone(),
                sample: ContainerUsageSample {
                    measure_start: snapshot_time,
                    usage,
                    request: ResourceAmount::ZERO,
                    resource,
                },
            })
            .collect()
    }
}

/// Out-of-memory kill observed for a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OomInfo {
    pub container: ContainerId,
    pub timestamp: DateTime<Utc>,
    pub requested_memory: ResourceAmount,
}

/// VPA update mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateMode {
    Off,
    Initial,
    Recreate,
    #[default]
    Auto,
}

/// Per-container scaling participation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalingMode {
    #[default]
    Auto,
    Off,
}

/// Resource constraints for one container name, or `*` for all containers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    pub container_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ScalingMode>,
    #[serde(default)]
    pub min_allowed: Resources,
    #[serde(default)]
    pub max_allowed: Resources,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_resources: Option<Vec<ResourceName>>,
    /// Bytes of memory per whole core
    #[serde(default, rename = "memoryPerCPU", skip_serializing_if = "Option::is_none")]
    pub memory_per_cpu: Option<ResourceAmount>,
}

/// Resource policy of a VPA object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodResourcePolicy {
    #[serde(default)]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

/// Reference to the workload controller a VPA targets
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub api_version: String,
}

/// VPA object as reported by the VPA listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaObject {
    pub id: VpaId,
    /// Label selector in its string form, e.g. `app=web,tier in (a,b)`
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub update_mode: UpdateMode,
    #[serde(default)]
    pub resource_policy: Option<PodResourcePolicy>,
    #[serde(default)]
    pub target_ref: Option<TargetRef>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub api_version: String,
}

/// Recommendation for a single container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedContainerResources {
    pub container_name: String,
    pub target: Resources,
    pub lower_bound: Resources,
    pub upper_bound: Resources,
    /// Target before post-processing
    pub uncapped_target: Resources,
}

/// Recommendation for all containers of the pods matched by a VPA
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendedPodResources {
    pub container_recommendations: Vec<RecommendedContainerResources>,
}

impl RecommendedPodResources {
    pub fn is_empty(&self) -> bool {
        self.container_recommendations.is_empty()
    }

    pub fn container(&self, name: &str) -> Option<&RecommendedContainerResources> {
        self.container_recommendations
            .iter()
            .find(|r| r.container_name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_amount_saturates() {
        assert_eq!(ResourceAmount::from_f64(-5.0), ResourceAmount::ZERO);
        assert_eq!(ResourceAmount::from_f64(f64::NAN), ResourceAmount::ZERO);
        assert_eq!(ResourceAmount::from_f64(f64::INFINITY), ResourceAmount::MAX);
        assert_eq!(ResourceAmount::new(u64::MAX), ResourceAmount::MAX);
        assert_eq!(
            ResourceAmount::MAX.saturating_add(ResourceAmount::new(1)),
            ResourceAmount::MAX
        );
    }

    #[test]
    fn test_cpu_conversion() {
        assert_eq!(ResourceAmount::from_cores(1.5).value(), 1500);
        assert!((ResourceAmount::from_millicores(250).cores() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_split_into_samples() {
        let id = ContainerId::new(PodId::new("default", "web-0"), "app");
        let snapshot = ContainerMetricsSnapshot {
            id: id.clone(),
            snapshot_time: Utc::now(),
            window_secs: 30,
            usage: Resources::from([
                (ResourceName::Cpu, ResourceAmount::from_millicores(300)),
                (ResourceName::Memory, ResourceAmount::new(1 << 20)),
            ]),
        };

        let samples = snapshot.into_samples();
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.container == id));
        assert!(samples
            .iter()
            .any(|s| s.sample.resource == ResourceName::Cpu && s.sample.usage.value() == 300));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(PodPhase::Succeeded.is_terminal());
        assert!(PodPhase::Failed.is_terminal());
        assert!(!PodPhase::Unknown.is_terminal());
        assert!(!PodPhase::Pending.is_terminal());
    }

    #[test]
    fn test_vpa_object_deserialize_defaults() {
        let json = r#"{
            "id": {"namespace": "default", "vpa_name": "web"},
            "selector": "app=web",
            "creationTime": "2024-01-01T00:00:00Z"
        }"#;
        let vpa: VpaObject = serde_json::from_str(json).unwrap();
        assert_eq!(vpa.update_mode, UpdateMode::Auto);
        assert!(vpa.resource_policy.is_none());
        assert_eq!(vpa.selector.as_deref(), Some("app=web"));
    }
}
