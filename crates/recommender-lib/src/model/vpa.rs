//! VPA objects as tracked by the cluster state
//!
//! A VPA owns no usage data. It keeps the keys of the aggregates its
//! selector matches, the latest recommendation and its status conditions.

use super::aggregate::AggregateContainerState;
use super::cluster::AggregateStateKey;
use super::labels::LabelSet;
use super::policy::resolve_container_policy;
use super::selector::LabelSelector;
use crate::models::{
    PodResourcePolicy, RecommendedPodResources, TargetRef, UpdateMode, VpaId, VpaObject,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VpaConditionType {
    RecommendationProvided,
    LowConfidence,
    NoPodsMatched,
    FetchingHistory,
    ConfigUnsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaCondition {
    #[serde(rename = "type")]
    pub condition_type: VpaConditionType,
    pub status: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VpaConditions(BTreeMap<VpaConditionType, VpaCondition>);

impl VpaConditions {
    /// Set a condition. The transition time only moves when the status flips.
    pub fn set(
        &mut self,
        condition_type: VpaConditionType,
        status: bool,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let last_transition_time = match self.0.get(&condition_type) {
            Some(existing) if existing.status == status => existing.last_transition_time,
            _ => now,
        };
        self.0.insert(
            condition_type,
            VpaCondition {
                condition_type,
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time,
            },
        );
    }

    pub fn remove(&mut self, condition_type: VpaConditionType) {
        self.0.remove(&condition_type);
    }

    pub fn get(&self, condition_type: VpaConditionType) -> Option<&VpaCondition> {
        self.0.get(&condition_type)
    }

    pub fn is_true(&self, condition_type: VpaConditionType) -> bool {
        self.0.get(&condition_type).is_some_and(|c| c.status)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VpaCondition> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Vpa {
    pub id: VpaId,
    /// None when the object had no selector or it failed to parse; such a
    /// VPA matches nothing
    pod_selector: Option<LabelSelector>,
    /// Why the object's selector was rejected, if it was
    pub selector_error: Option<String>,
    pub target_ref: Option<TargetRef>,
    pub update_mode: UpdateMode,
    pub resource_policy: Option<PodResourcePolicy>,
    pub annotations: BTreeMap<String, String>,
    pub api_version: String,
    pub recommendation: Option<RecommendedPodResources>,
    pub conditions: VpaConditions,
    /// Number of tracked pods matched by the selector
    pub pod_count: usize,
    /// Most containers seen in a single matching pod
    pub containers_per_pod: usize,
    pub created: DateTime<Utc>,
    pub checkpoint_written: Option<DateTime<Utc>>,
    aggregate_keys: BTreeSet<AggregateStateKey>,
    /// Aggregates restored from checkpoints, by container name
    pub initial_aggregate_states: BTreeMap<String, AggregateContainerState>,
}

impl Vpa {
    pub fn new(id: VpaId, pod_selector: Option<LabelSelector>, created: DateTime<Utc>) -> Self {
        Self {
            id,
            pod_selector,
            selector_error: None,
            target_ref: None,
            update_mode: UpdateMode::default(),
            resource_policy: None,
            annotations: BTreeMap::new(),
            api_version: String::new(),
            recommendation: None,
            conditions: VpaConditions::default(),
            pod_count: 0,
            containers_per_pod: 0,
            created,
            checkpoint_written: None,
            aggregate_keys: BTreeSet::new(),
            initial_aggregate_states: BTreeMap::new(),
        }
    }

    pub(crate) fn from_object(object: &VpaObject, pod_selector: Option<LabelSelector>) -> Self {
        let mut vpa = Self::new(object.id.clone(), pod_selector, object.creation_time);
        vpa.apply_spec(object);
        vpa
    }

    /// Copy the mutable parts of the object's spec
    pub(crate) fn apply_spec(&mut self, object: &VpaObject) {
        self.target_ref = object.target_ref.clone();
        self.update_mode = object.update_mode;
        self.resource_policy = object.resource_policy.clone();
        self.annotations = object.annotations.clone();
        self.api_version = object.api_version.clone();
    }

    pub fn pod_selector(&self) -> Option<&LabelSelector> {
        self.pod_selector.as_ref()
    }

    /// Canonical selector string, used to detect selector changes
    pub fn selector_string(&self) -> Option<String> {
        self.pod_selector.as_ref().map(|s| s.to_string())
    }

    /// True if a pod in `namespace` with `labels` is selected by this VPA
    pub fn matches_labels(&self, namespace: &str, labels: &LabelSet) -> bool {
        namespace == self.id.namespace
            && self
                .pod_selector
                .as_ref()
                .is_some_and(|selector| selector.matches(labels))
    }

    /// Link the aggregate if this VPA selects it, applying the VPA's update
    /// mode and container policy. Returns true if a new link was made.
    pub fn use_aggregation_if_matching(
        &mut self,
        key: &AggregateStateKey,
        labels: &LabelSet,
        aggregate: &mut AggregateContainerState,
    ) -> bool {
        if self.aggregate_keys.contains(key) || !self.matches_labels(key.namespace(), labels) {
            return false;
        }
        self.aggregate_keys.insert(key.clone());
        self.apply_to_aggregate(key, aggregate);
        true
    }

    /// Push the VPA's update mode and resolved policy down to an aggregate
    pub(crate) fn apply_to_aggregate(
        &self,
        key: &AggregateStateKey,
        aggregate: &mut AggregateContainerState,
    ) {
        aggregate.is_under_vpa = true;
        aggregate.update_mode = Some(self.update_mode);
        aggregate.update_from_policy(&resolve_container_policy(
            self.resource_policy.as_ref(),
            key.container_name(),
        ));
    }

    pub fn delete_aggregation(&mut self, key: &AggregateStateKey) -> bool {
        self.aggregate_keys.remove(key)
    }

    pub fn uses_aggregation(&self, key: &AggregateStateKey) -> bool {
        self.aggregate_keys.contains(key)
    }

    pub fn aggregate_keys(&self) -> impl Iterator<Item = &AggregateStateKey> {
        self.aggregate_keys.iter()
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregate_keys.len()
    }

    pub fn has_recommendation(&self) -> bool {
        self.recommendation.as_ref().is_some_and(|r| !r.is_empty())
    }

    /// Refresh `NoPodsMatched` and `RecommendationProvided`
    pub fn update_conditions(&mut self, pods_matched: bool, now: DateTime<Utc>) {
        let (reason, message) = if pods_matched {
            self.conditions.remove(VpaConditionType::NoPodsMatched);
            ("", "")
        } else {
            let reason = "NoPodsMatched";
            let message = "No pods match this VPA object";
            self.conditions
                .set(VpaConditionType::NoPodsMatched, true, reason, message, now);
            (reason, message)
        };
        if self.has_recommendation() {
            self.conditions
                .set(VpaConditionType::RecommendationProvided, true, "", "", now);
        } else {
            self.conditions.set(
                VpaConditionType::RecommendationProvided,
                false,
                reason,
                message,
                now,
            );
        }
    }
}
