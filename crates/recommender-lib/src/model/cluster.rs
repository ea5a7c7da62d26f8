//! Cluster state: pods, VPAs and aggregates
//!
//! The cluster state is the only owner of these maps. Containers and VPAs
//! refer to aggregates by [`AggregateStateKey`]; every mutation that may
//! change those links goes through the methods here.

use super::aggregate::AggregateContainerState;
use super::config::AggregationsConfig;
use super::container::ContainerState;
use super::controller::{ControllerFetcher, ControllerKey};
use super::labels::{LabelSet, LabelSetInterner, LabelSetKey};
use super::policy::resolve_container_policy;
use super::selector::LabelSelector;
use super::vpa::Vpa;
use super::{ModelError, ModelResult};
use crate::checkpoint::VpaCheckpoint;
use crate::models::{
    ContainerId, ContainerUsageSampleWithKey, PodId, PodPhase, RecommendedPodResources,
    ResourceAmount, Resources, ScalingMode, VpaId, VpaObject,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Minutes a VPA may go without a recommendation before it is reported
pub const RECOMMENDATION_MISSING_MAX_MINUTES: i64 = 30;

/// Aggregation key: containers with the same name, in the same namespace,
/// whose pods carry identical labels share one aggregate
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateStateKey {
    namespace: String,
    container_name: String,
    labels: LabelSetKey,
}

impl AggregateStateKey {
    pub fn new(
        namespace: impl Into<String>,
        container_name: impl Into<String>,
        labels: LabelSetKey,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            container_name: container_name.into(),
            labels,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn label_set_key(&self) -> &LabelSetKey {
        &self.labels
    }
}

impl fmt::Display for AggregateStateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{{{}}}", self.namespace, self.container_name, self.labels)
    }
}

#[derive(Debug, Clone)]
pub struct PodState {
    pub id: PodId,
    labels: LabelSetKey,
    pub phase: PodPhase,
    containers: BTreeMap<String, ContainerState>,
}

impl PodState {
    pub fn label_set_key(&self) -> &LabelSetKey {
        &self.labels
    }

    pub fn containers(&self) -> &BTreeMap<String, ContainerState> {
        &self.containers
    }

    pub fn container(&self, name: &str) -> Option<&ContainerState> {
        self.containers.get(name)
    }
}

/// Counts from one garbage collection sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub aggregates_removed: usize,
    pub label_sets_reclaimed: usize,
}

#[derive(Debug)]
pub struct ClusterState {
    config: Arc<AggregationsConfig>,
    pods: HashMap<PodId, PodState>,
    vpas: BTreeMap<VpaId, Vpa>,
    /// First time each VPA was seen without a recommendation
    empty_vpas: HashMap<VpaId, DateTime<Utc>>,
    aggregates: HashMap<AggregateStateKey, AggregateContainerState>,
    label_sets: LabelSetInterner,
    gc_interval: Duration,
    last_gc: Option<DateTime<Utc>>,
}

impl ClusterState {
    pub fn new(config: Arc<AggregationsConfig>, gc_interval: Duration) -> Self {
        Self {
            config,
            pods: HashMap::new(),
            vpas: BTreeMap::new(),
            empty_vpas: HashMap::new(),
            aggregates: HashMap::new(),
            label_sets: LabelSetInterner::new(),
            gc_interval,
            last_gc: None,
        }
    }

    pub fn config(&self) -> &Arc<AggregationsConfig> {
        &self.config
    }

    pub fn pods(&self) -> &HashMap<PodId, PodState> {
        &self.pods
    }

    pub fn pod(&self, id: &PodId) -> Option<&PodState> {
        self.pods.get(id)
    }

    pub fn container(&self, id: &ContainerId) -> Option<&ContainerState> {
        self.pods.get(&id.pod_id)?.containers.get(&id.container_name)
    }

    pub fn vpas(&self) -> &BTreeMap<VpaId, Vpa> {
        &self.vpas
    }

    pub fn vpa(&self, id: &VpaId) -> Option<&Vpa> {
        self.vpas.get(id)
    }

    pub fn vpa_mut(&mut self, id: &VpaId) -> Option<&mut Vpa> {
        self.vpas.get_mut(id)
    }

    pub fn aggregates(&self) -> &HashMap<AggregateStateKey, AggregateContainerState> {
        &self.aggregates
    }

    pub fn aggregate(&self, key: &AggregateStateKey) -> Option<&AggregateContainerState> {
        self.aggregates.get(key)
    }

    pub fn labels(&self, key: &LabelSetKey) -> Option<&LabelSet> {
        self.label_sets.labels(key)
    }

    pub fn label_set_count(&self) -> usize {
        self.label_sets.len()
    }

    /// Aggregation key for a container of a tracked pod
    pub fn aggregate_key_for(&self, id: &ContainerId) -> Option<AggregateStateKey> {
        let pod = self.pods.get(&id.pod_id)?;
        Some(AggregateStateKey::new(
            &id.pod_id.namespace,
            &id.container_name,
            pod.labels.clone(),
        ))
    }

    /// Create or update a pod. A label change moves its containers to the
    /// aggregates for the new labels and updates VPA pod counts.
    pub fn add_or_update_pod(
        &mut self,
        id: &PodId,
        labels: &LabelSet,
        phase: PodPhase,
        now: DateTime<Utc>,
    ) {
        let new_labels = self.label_sets.intern(labels);
        let old_labels = self.pods.get(id).map(|pod| pod.labels.clone());

        match old_labels {
            Some(old) if old == new_labels => {}
            Some(old) => {
                self.adjust_pod_counts(&id.namespace, &old, false);
                let container_names: Vec<String> = self
                    .pods
                    .get(id)
                    .map(|pod| pod.containers.keys().cloned().collect())
                    .unwrap_or_default();
                for name in container_names {
                    let key = AggregateStateKey::new(&id.namespace, &name, new_labels.clone());
                    self.find_or_create_aggregate(&key, now);
                    if let Some(container) = self
                        .pods
                        .get_mut(id)
                        .and_then(|pod| pod.containers.get_mut(&name))
                    {
                        container.set_aggregate_key(key);
                    }
                }
                if let Some(pod) = self.pods.get_mut(id) {
                    pod.labels = new_labels.clone();
                }
                self.adjust_pod_counts(&id.namespace, &new_labels, true);
            }
            None => {
                self.pods.insert(
                    id.clone(),
                    PodState {
                        id: id.clone(),
                        labels: new_labels.clone(),
                        phase,
                        containers: BTreeMap::new(),
                    },
                );
                self.adjust_pod_counts(&id.namespace, &new_labels, true);
            }
        }

        if let Some(pod) = self.pods.get_mut(id) {
            pod.phase = phase;
        }
        self.update_containers_per_pod(id);
    }

    /// Forget a pod. Its aggregates stay until garbage collection.
    pub fn delete_pod(&mut self, id: &PodId) {
        if let Some(pod) = self.pods.remove(id) {
            self.adjust_pod_counts(&id.namespace, &pod.labels, false);
        }
    }

    /// Create a container of a tracked pod or update its request
    pub fn add_or_update_container(
        &mut self,
        id: &ContainerId,
        request: Resources,
        now: DateTime<Utc>,
    ) -> ModelResult<()> {
        let pod = self
            .pods
            .get_mut(&id.pod_id)
            .ok_or_else(|| ModelError::PodNotFound(id.pod_id.clone()))?;
        if let Some(container) = pod.containers.get_mut(&id.container_name) {
            container.request = request;
            return Ok(());
        }

        let key = AggregateStateKey::new(&id.pod_id.namespace, &id.container_name, pod.labels.clone());
        self.find_or_create_aggregate(&key, now);
        if let Some(pod) = self.pods.get_mut(&id.pod_id) {
            pod.containers
                .insert(id.container_name.clone(), ContainerState::new(request, key));
        }
        self.update_containers_per_pod(&id.pod_id);
        Ok(())
    }

    /// Route a usage sample to its container and aggregate
    pub fn add_sample(
        &mut self,
        sample: &ContainerUsageSampleWithKey,
        now: DateTime<Utc>,
    ) -> ModelResult<()> {
        let id = &sample.container;
        let (container, aggregate, config) = self.bound_container(id, now)?;
        if container.add_sample(&sample.sample, aggregate, config)? {
            Ok(())
        } else {
            Err(ModelError::SampleDiscarded {
                container: id.clone(),
            })
        }
    }

    /// Record an OOM kill of a container as a synthetic memory peak
    pub fn record_oom(
        &mut self,
        id: &ContainerId,
        timestamp: DateTime<Utc>,
        requested_memory: ResourceAmount,
        now: DateTime<Utc>,
    ) -> ModelResult<()> {
        let (container, aggregate, config) = self.bound_container(id, now)?;
        container.record_oom(timestamp, requested_memory, aggregate, config)
    }

    /// Container together with its aggregate, recreating the aggregate if it
    /// was garbage collected in the meantime
    fn bound_container(
        &mut self,
        id: &ContainerId,
        now: DateTime<Utc>,
    ) -> ModelResult<(&mut ContainerState, &mut AggregateContainerState, &AggregationsConfig)> {
        let key = self
            .pods
            .get(&id.pod_id)
            .ok_or_else(|| ModelError::PodNotFound(id.pod_id.clone()))?
            .containers
            .get(&id.container_name)
            .ok_or_else(|| ModelError::ContainerNotFound(id.clone()))?
            .aggregate_key()
            .clone();
        self.find_or_create_aggregate(&key, now);

        let container = self
            .pods
            .get_mut(&id.pod_id)
            .and_then(|pod| pod.containers.get_mut(&id.container_name))
            .ok_or_else(|| ModelError::ContainerNotFound(id.clone()))?;
        let config = &self.config;
        let aggregate = self
            .aggregates
            .entry(key)
            .or_insert_with(|| AggregateContainerState::new(config, now));
        Ok((container, aggregate, config.as_ref()))
    }

    /// Create or update a VPA. A changed selector recreates the VPA so its
    /// links are derived from scratch. An unparsable selector is returned as
    /// an error after the VPA is stored without one.
    pub fn add_or_update_vpa(&mut self, object: &VpaObject) -> ModelResult<()> {
        let (selector, selector_error) = match object.selector.as_deref() {
            None => (None, None),
            Some(raw) => match raw.parse::<LabelSelector>() {
                Ok(selector) => (Some(selector), None),
                Err(e) => (None, Some(e)),
            },
        };
        let new_selector_string = selector.as_ref().map(|s| s.to_string());

        if let Some(existing) = self.vpas.get(&object.id) {
            if existing.selector_string() != new_selector_string {
                debug!(vpa = %object.id, "VPA selector changed, relinking aggregates");
                self.delete_vpa(&object.id)?;
            }
        }

        if let Some(vpa) = self.vpas.get_mut(&object.id) {
            vpa.apply_spec(object);
            for key in vpa.aggregate_keys() {
                if let Some(aggregate) = self.aggregates.get_mut(key) {
                    vpa.apply_to_aggregate(key, aggregate);
                }
            }
        } else {
            let mut vpa = Vpa::from_object(object, selector);
            for (key, aggregate) in self.aggregates.iter_mut() {
                if let Some(labels) = self.label_sets.labels(key.label_set_key()) {
                    vpa.use_aggregation_if_matching(key, labels, aggregate);
                }
            }
            let matching: Vec<&PodState> = self
                .pods
                .values()
                .filter(|pod| {
                    self.label_sets
                        .labels(&pod.labels)
                        .is_some_and(|labels| vpa.matches_labels(&pod.id.namespace, labels))
                })
                .collect();
            vpa.pod_count = matching.len();
            vpa.containers_per_pod = matching
                .iter()
                .map(|pod| pod.containers.len())
                .max()
                .unwrap_or(0);
            self.vpas.insert(object.id.clone(), vpa);
        }

        if let Some(vpa) = self.vpas.get_mut(&object.id) {
            vpa.selector_error = selector_error.as_ref().map(|e| e.to_string());
        }
        match selector_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Remove a VPA. Aggregates no other VPA selects are marked as not
    /// autoscaled.
    pub fn delete_vpa(&mut self, id: &VpaId) -> ModelResult<()> {
        let vpa = self
            .vpas
            .remove(id)
            .ok_or_else(|| ModelError::VpaNotFound(id.clone()))?;
        for key in vpa.aggregate_keys() {
            let still_selected = self.vpas.values().any(|other| other.uses_aggregation(key));
            if let Some(aggregate) = self.aggregates.get_mut(key) {
                if !still_selected {
                    aggregate.mark_not_autoscaled();
                }
            }
        }
        self.empty_vpas.remove(id);
        Ok(())
    }

    /// Store a checkpointed aggregate as initial state for the VPA's container
    pub fn set_vpa_checkpoint(
        &mut self,
        checkpoint: &VpaCheckpoint,
        now: DateTime<Utc>,
    ) -> ModelResult<()> {
        let vpa_id = checkpoint.vpa_id();
        if !self.vpas.contains_key(&vpa_id) {
            return Err(ModelError::VpaNotFound(vpa_id));
        }
        let mut state = AggregateContainerState::new(&self.config, now);
        state.load_checkpoint(&checkpoint.status)?;
        if let Some(vpa) = self.vpas.get_mut(&vpa_id) {
            vpa.initial_aggregate_states
                .insert(checkpoint.container_name.clone(), state);
        }
        Ok(())
    }

    /// Merge every aggregate the VPA links, plus its checkpointed initial
    /// state, into one state per container name
    pub fn aggregate_state_by_container_name(
        &self,
        id: &VpaId,
        now: DateTime<Utc>,
    ) -> ModelResult<BTreeMap<String, AggregateContainerState>> {
        let vpa = self
            .vpas
            .get(id)
            .ok_or_else(|| ModelError::VpaNotFound(id.clone()))?;
        let mut states: BTreeMap<String, AggregateContainerState> = BTreeMap::new();
        for key in vpa.aggregate_keys() {
            let Some(aggregate) = self.aggregates.get(key) else {
                continue;
            };
            states
                .entry(key.container_name().to_string())
                .or_insert_with(|| AggregateContainerState::new(&self.config, now))
                .merge(aggregate)?;
        }
        for (name, initial) in &vpa.initial_aggregate_states {
            states
                .entry(name.clone())
                .or_insert_with(|| AggregateContainerState::new(&self.config, now))
                .merge(initial)?;
        }
        Ok(states)
    }

    /// Containers of the VPA that take part in recommendation: scaling mode
    /// not off and at least one CPU sample seen
    pub fn recommendable_container_states(
        &self,
        id: &VpaId,
        now: DateTime<Utc>,
    ) -> ModelResult<BTreeMap<String, AggregateContainerState>> {
        let policy = self.vpas.get(id).and_then(|vpa| vpa.resource_policy.clone());
        let mut states = self.aggregate_state_by_container_name(id, now)?;
        states.retain(|name, state| {
            let resolved = resolve_container_policy(policy.as_ref(), name);
            if resolved.mode == ScalingMode::Off || state.total_samples_count() == 0 {
                return false;
            }
            state.update_from_policy(&resolved);
            true
        });
        Ok(states)
    }

    /// Set the VPA's recommendation and remember each container's uncapped
    /// target on the aggregates it links
    pub fn update_recommendation(
        &mut self,
        id: &VpaId,
        recommendation: RecommendedPodResources,
    ) -> ModelResult<()> {
        let vpa = self
            .vpas
            .get_mut(id)
            .ok_or_else(|| ModelError::VpaNotFound(id.clone()))?;
        for container in &recommendation.container_recommendations {
            for key in vpa.aggregate_keys() {
                if key.container_name() != container.container_name {
                    continue;
                }
                if let Some(aggregate) = self.aggregates.get_mut(key) {
                    aggregate.last_recommendation = Some(container.uncapped_target.clone());
                }
            }
        }
        vpa.recommendation = Some(recommendation);
        Ok(())
    }

    /// Track how long a VPA has gone without a recommendation. Errors once
    /// the gap exceeds `RECOMMENDATION_MISSING_MAX_MINUTES`, then starts
    /// counting again.
    pub fn record_recommendation(&mut self, id: &VpaId, now: DateTime<Utc>) -> ModelResult<()> {
        let vpa = self
            .vpas
            .get(id)
            .ok_or_else(|| ModelError::VpaNotFound(id.clone()))?;
        if vpa.has_recommendation() {
            self.empty_vpas.remove(id);
            return Ok(());
        }
        match self.empty_vpas.get(id).copied() {
            None => {
                self.empty_vpas.insert(id.clone(), now);
                Ok(())
            }
            Some(since) if now - since > Duration::minutes(RECOMMENDATION_MISSING_MAX_MINUTES) => {
                self.empty_vpas.insert(id.clone(), now);
                Err(ModelError::RecommendationMissing {
                    vpa: id.clone(),
                    since,
                })
            }
            Some(_) => Ok(()),
        }
    }

    /// Pods selected by a VPA
    pub fn matching_pods<'a>(&'a self, vpa: &'a Vpa) -> impl Iterator<Item = &'a PodState> + 'a {
        self.pods.values().filter(move |pod| {
            self.label_sets
                .labels(&pod.labels)
                .is_some_and(|labels| vpa.matches_labels(&pod.id.namespace, labels))
        })
    }

    /// Oldest VPA selecting the pod
    pub fn controlling_vpa(&self, pod: &PodState) -> Option<&Vpa> {
        let labels = self.label_sets.labels(&pod.labels)?;
        self.vpas
            .values()
            .filter(|vpa| vpa.matches_labels(&pod.id.namespace, labels))
            .min_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)))
    }

    /// Run garbage collection if at least `gc_interval` passed since the last run
    pub fn rate_limited_garbage_collect(
        &mut self,
        now: DateTime<Utc>,
        fetcher: &dyn ControllerFetcher,
    ) -> Option<GcStats> {
        if self.last_gc.is_some_and(|last| now - last < self.gc_interval) {
            return None;
        }
        let stats = self.garbage_collect(now, fetcher);
        self.last_gc = Some(now);
        Some(stats)
    }

    /// Remove aggregates that are expired, or empty and no longer fed by a
    /// live pod, then reclaim unused label sets
    pub fn garbage_collect(&mut self, now: DateTime<Utc>, fetcher: &dyn ControllerFetcher) -> GcStats {
        let contributive = self.contributive_keys(fetcher);
        let window = self.config.memory_aggregation_window_length();

        let doomed: Vec<AggregateStateKey> = self
            .aggregates
            .iter()
            .filter(|(key, aggregate)| {
                (!contributive.contains(*key) && aggregate.is_empty())
                    || aggregate.is_expired(now, window)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            debug!(aggregate = %key, "removing aggregate");
            self.aggregates.remove(key);
            for vpa in self.vpas.values_mut() {
                vpa.delete_aggregation(key);
            }
        }

        let before = self.label_sets.len();
        let referenced: HashSet<LabelSetKey> = self
            .pods
            .values()
            .map(|pod| pod.labels.clone())
            .chain(self.aggregates.keys().map(|key| key.labels.clone()))
            .collect();
        self.label_sets.retain(|key| referenced.contains(key));

        GcStats {
            aggregates_removed: doomed.len(),
            label_sets_reclaimed: before - self.label_sets.len(),
        }
    }

    /// Keys fed by a pod that is still active or whose controlling VPA's
    /// target controller still exists
    fn contributive_keys(&self, fetcher: &dyn ControllerFetcher) -> HashSet<AggregateStateKey> {
        let mut keys = HashSet::new();
        for pod in self.pods.values() {
            let active = !pod.phase.is_terminal();
            if !active && !self.pod_controller_exists(pod, fetcher) {
                continue;
            }
            keys.extend(pod.containers.values().map(|c| c.aggregate_key().clone()));
        }
        keys
    }

    fn pod_controller_exists(&self, pod: &PodState, fetcher: &dyn ControllerFetcher) -> bool {
        let Some(target) = self
            .controlling_vpa(pod)
            .and_then(|vpa| vpa.target_ref.as_ref())
        else {
            return false;
        };
        let key = ControllerKey {
            namespace: pod.id.namespace.clone(),
            kind: target.kind.clone(),
            name: target.name.clone(),
            api_version: target.api_version.clone(),
        };
        fetcher.find_top_most_controller(&key).is_some()
    }

    /// Link a new aggregate for `key` to every VPA selecting it
    fn find_or_create_aggregate(&mut self, key: &AggregateStateKey, now: DateTime<Utc>) {
        if self.aggregates.contains_key(key) {
            return;
        }
        let mut aggregate = AggregateContainerState::new(&self.config, now);
        match self.label_sets.labels(key.label_set_key()) {
            Some(labels) => {
                for vpa in self.vpas.values_mut() {
                    vpa.use_aggregation_if_matching(key, labels, &mut aggregate);
                }
            }
            None => warn!(aggregate = %key, "label set missing for aggregate key"),
        }
        self.aggregates.insert(key.clone(), aggregate);
    }

    fn adjust_pod_counts(&mut self, namespace: &str, labels: &LabelSetKey, add: bool) {
        let Some(labels) = self.label_sets.labels(labels) else {
            return;
        };
        for vpa in self.vpas.values_mut() {
            if vpa.matches_labels(namespace, labels) {
                vpa.pod_count = if add {
                    vpa.pod_count + 1
                } else {
                    vpa.pod_count.saturating_sub(1)
                };
            }
        }
    }

    fn update_containers_per_pod(&mut self, id: &PodId) {
        let Some(pod) = self.pods.get(id) else {
            return;
        };
        let Some(labels) = self.label_sets.labels(&pod.labels) else {
            return;
        };
        let count = pod.containers.len();
        for vpa in self.vpas.values_mut() {
            if vpa.matches_labels(&id.namespace, labels) {
                vpa.containers_per_pod = vpa.containers_per_pod.max(count);
            }
        }
    }
}
