//! End-to-end tests for the feeder, the recommender iteration and the loop

use super::*;
use crate::checkpoint::{CheckpointStore, CheckpointWriter, InMemoryCheckpointStore, VpaCheckpoint};
use crate::config::RecommenderConfig;
use crate::health::{components, ComponentStatus, HealthRegistry};
use crate::model::{AggregateContainerState, AggregationsConfig, NoControllers, VpaCondition, VpaConditionType};
use crate::models::{
    ContainerId, ContainerMetricsSnapshot, ContainerResourcePolicy, ContainerSpec, OomInfo, PodId,
    PodPhase, PodResourcePolicy, PodSpec, ResourceAmount, ResourceName, Resources, UpdateMode,
    VpaId, VpaObject,
};
use crate::observability::{RecommenderMetrics, StructuredLogger};
use crate::status::VpaStatus;
use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

const MIB: u64 = 1024 * 1024;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

#[derive(Default)]
struct RecordingStatusWriter {
    statuses: Mutex<BTreeMap<VpaId, VpaStatus>>,
}

impl RecordingStatusWriter {
    fn get(&self, id: &VpaId) -> Option<VpaStatus> {
        self.statuses.lock().unwrap().get(id).cloned()
    }
}

impl StatusWriter for RecordingStatusWriter {
    fn publish(&self, status: VpaStatus) -> Result<()> {
        let id = VpaId::new(&status.namespace, &status.name);
        self.statuses.lock().unwrap().insert(id, status);
        Ok(())
    }

    fn remove(&self, id: &VpaId) -> Result<()> {
        self.statuses.lock().unwrap().remove(id);
        Ok(())
    }
}

struct Harness {
    recommender: Recommender,
    input: InputSender,
    statuses: Arc<RecordingStatusWriter>,
}

fn harness(store: Arc<dyn CheckpointStore>) -> Harness {
    let (input, receiver) = input_channel(64);
    let metrics = RecommenderMetrics::new();
    let logger = StructuredLogger::new("test-node");
    let statuses = Arc::new(RecordingStatusWriter::default());
    let feeder = ClusterStateFeeder::new(receiver, store.clone(), metrics.clone(), logger.clone());
    let recommender = Recommender::new(
        RecommenderConfig::default(),
        feeder,
        CheckpointWriter::new(store),
        statuses.clone(),
        Arc::new(NoControllers),
        metrics,
        logger,
    )
    .unwrap();
    Harness {
        recommender,
        input,
        statuses,
    }
}

fn vpa_id() -> VpaId {
    VpaId::new("default", "web")
}

fn vpa_object(selector: &str) -> VpaObject {
    VpaObject {
        id: vpa_id(),
        selector: Some(selector.to_string()),
        update_mode: UpdateMode::Auto,
        resource_policy: None,
        target_ref: None,
        annotations: BTreeMap::new(),
        creation_time: t0(),
        api_version: "autoscaling.k8s.io/v1".to_string(),
    }
}

fn resources(cpu_millicores: u64, memory_bytes: u64) -> Resources {
    Resources::from([
        (ResourceName::Cpu, ResourceAmount::new(cpu_millicores)),
        (ResourceName::Memory, ResourceAmount::new(memory_bytes)),
    ])
}

fn pod(name: &str) -> PodSpec {
    PodSpec {
        id: PodId::new("default", name),
        labels: BTreeMap::from([("app".to_string(), "web".to_string())]),
        phase: PodPhase::Running,
        containers: vec![ContainerSpec {
            name: "app".to_string(),
            request: resources(500, 512 * MIB),
        }],
    }
}

fn container(pod_name: &str) -> ContainerId {
    ContainerId::new(PodId::new("default", pod_name), "app")
}

/// One snapshot per minute starting at t0
fn usage(pod_name: &str, minutes: i64) -> Vec<ContainerMetricsSnapshot> {
    (0..minutes)
        .map(|minute| ContainerMetricsSnapshot {
            id: container(pod_name),
            snapshot_time: t0() + Duration::minutes(minute),
            window_secs: 60,
            usage: resources(200 + (minute as u64 % 5) * 10, (300 + minute as u64) * MIB),
        })
        .collect()
}

fn send(input: &InputSender, event: InputEvent) {
    input.try_send(event).unwrap();
}

fn condition(status: &VpaStatus, condition_type: VpaConditionType) -> Option<&VpaCondition> {
    status
        .conditions
        .iter()
        .find(|c| c.condition_type == condition_type)
}

#[test]
fn test_end_to_end_recommendation() {
    let mut h = harness(Arc::new(InMemoryCheckpointStore::new()));
    send(&h.input, InputEvent::UpsertVpa(vpa_object("app=web")));
    send(&h.input, InputEvent::UpsertPod(pod("web-1")));
    send(&h.input, InputEvent::Metrics(usage("web-1", 30)));

    let now = t0() + Duration::hours(1);
    let summary = h.recommender.run_once(now);
    assert_eq!(summary.feed.events, 3);
    assert_eq!(summary.feed.samples_added, 60);
    assert_eq!(summary.vpas_processed, 1);
    assert_eq!(summary.recommendations, 1);
    assert_eq!(summary.vpa_errors, 0);

    let status = h.statuses.get(&vpa_id()).unwrap();
    assert_eq!(status.pod_count, 1);
    assert_eq!(status.containers_per_pod, 1);
    assert!(condition(&status, VpaConditionType::RecommendationProvided).unwrap().status);
    assert!(condition(&status, VpaConditionType::LowConfidence).unwrap().status);
    assert!(condition(&status, VpaConditionType::NoPodsMatched).is_none());
    assert!(condition(&status, VpaConditionType::FetchingHistory).is_none());
    assert!(condition(&status, VpaConditionType::ConfigUnsupported).is_none());

    let vpa = h.recommender.cluster().vpa(&vpa_id()).unwrap();
    let app = vpa.recommendation.as_ref().unwrap().container("app").unwrap().clone();
    for resource in ResourceName::ALL {
        assert!(app.lower_bound[&resource] <= app.target[&resource]);
        assert!(app.target[&resource] <= app.upper_bound[&resource]);
    }
    // Usage stays between 200m and 240m; with the margin the target lands above it
    let target_cpu = app.target[&ResourceName::Cpu].value();
    assert!((200..=320).contains(&target_cpu), "target cpu {target_cpu}");

    let rendered = &status.recommendation.unwrap().container_recommendations[0];
    assert_eq!(rendered.target[&ResourceName::Cpu], format!("{target_cpu}m"));
}

#[test]
fn test_feed_applies_pods_before_samples() {
    let mut h = harness(Arc::new(InMemoryCheckpointStore::new()));
    // Samples queued ahead of the pod they belong to are still accepted
    send(&h.input, InputEvent::Metrics(usage("web-1", 3)));
    send(&h.input, InputEvent::UpsertPod(pod("web-1")));
    send(&h.input, InputEvent::UpsertVpa(vpa_object("app=web")));

    let summary = h.recommender.run_once(t0() + Duration::hours(1));
    assert_eq!(summary.feed.vpas_upserted, 1);
    assert_eq!(summary.feed.pods_upserted, 1);
    assert_eq!(summary.feed.containers_upserted, 1);
    assert_eq!(summary.feed.samples_added, 6);
    assert_eq!(summary.feed.samples_discarded, 0);
}

#[test]
fn test_feed_discards_input_for_unknown_containers() {
    let mut h = harness(Arc::new(InMemoryCheckpointStore::new()));
    send(&h.input, InputEvent::UpsertPod(pod("web-1")));
    send(&h.input, InputEvent::Metrics(usage("missing", 2)));
    send(
        &h.input,
        InputEvent::UpsertContainer {
            id: container("missing"),
            request: resources(100, MIB),
        },
    );
    send(
        &h.input,
        InputEvent::Oom(vec![
            OomInfo {
                container: container("web-1"),
                timestamp: t0(),
                requested_memory: ResourceAmount::new(512 * MIB),
            },
            OomInfo {
                container: container("missing"),
                timestamp: t0(),
                requested_memory: ResourceAmount::new(512 * MIB),
            },
        ]),
    );

    let summary = h.recommender.run_once(t0() + Duration::minutes(5));
    assert_eq!(summary.feed.samples_discarded, 4);
    assert_eq!(summary.feed.containers_upserted, 1);
    assert_eq!(summary.feed.ooms_recorded, 1);
    assert_eq!(summary.feed.ooms_discarded, 1);
}

#[test]
fn test_vpa_without_pods() {
    let mut h = harness(Arc::new(InMemoryCheckpointStore::new()));
    send(&h.input, InputEvent::UpsertVpa(vpa_object("app=web")));
    let summary = h.recommender.run_once(t0());
    assert_eq!(summary.recommendations, 0);

    let status = h.statuses.get(&vpa_id()).unwrap();
    assert!(status.recommendation.is_none());
    assert!(condition(&status, VpaConditionType::NoPodsMatched).unwrap().status);
    let provided = condition(&status, VpaConditionType::RecommendationProvided).unwrap();
    assert!(!provided.status);
    assert_eq!(provided.reason, "NoPodsMatched");
    assert!(condition(&status, VpaConditionType::LowConfidence).is_none());
}

#[test]
fn test_invalid_selector_reported() {
    let mut h = harness(Arc::new(InMemoryCheckpointStore::new()));
    send(&h.input, InputEvent::UpsertVpa(vpa_object("env in (a")));
    send(&h.input, InputEvent::UpsertPod(pod("web-1")));
    send(&h.input, InputEvent::Metrics(usage("web-1", 3)));
    h.recommender.run_once(t0() + Duration::hours(1));

    let status = h.statuses.get(&vpa_id()).unwrap();
    let unsupported = condition(&status, VpaConditionType::ConfigUnsupported).unwrap();
    assert!(unsupported.status);
    assert_eq!(unsupported.reason, "InvalidSelector");
    assert!(status.recommendation.is_none());

    // Fixing the selector clears the condition
    send(&h.input, InputEvent::UpsertVpa(vpa_object("app=web")));
    h.recommender.run_once(t0() + Duration::hours(2));
    let status = h.statuses.get(&vpa_id()).unwrap();
    assert!(condition(&status, VpaConditionType::ConfigUnsupported).is_none());
    assert!(status.recommendation.is_some());
}

#[test]
fn test_conflicting_policy_reported_and_min_wins() {
    let mut h = harness(Arc::new(InMemoryCheckpointStore::new()));
    let mut object = vpa_object("app=web");
    object.resource_policy = Some(PodResourcePolicy {
        container_policies: vec![ContainerResourcePolicy {
            container_name: "app".to_string(),
            min_allowed: Resources::from([(ResourceName::Cpu, ResourceAmount::new(3000))]),
            max_allowed: Resources::from([(ResourceName::Cpu, ResourceAmount::new(1000))]),
            ..Default::default()
        }],
    });
    send(&h.input, InputEvent::UpsertVpa(object));
    send(&h.input, InputEvent::UpsertPod(pod("web-1")));
    send(&h.input, InputEvent::Metrics(usage("web-1", 10)));
    h.recommender.run_once(t0() + Duration::hours(1));

    let status = h.statuses.get(&vpa_id()).unwrap();
    let unsupported = condition(&status, VpaConditionType::ConfigUnsupported).unwrap();
    assert_eq!(unsupported.reason, "ConflictingPolicy");
    assert!(unsupported.message.contains("app: cpu"));

    let app = &status.recommendation.unwrap().container_recommendations[0];
    assert_eq!(app.target[&ResourceName::Cpu], "3000m");
    assert_eq!(app.upper_bound[&ResourceName::Cpu], "3000m");
}

#[test]
fn test_deleted_vpa_status_removed() {
    let mut h = harness(Arc::new(InMemoryCheckpointStore::new()));
    send(&h.input, InputEvent::UpsertVpa(vpa_object("app=web")));
    h.recommender.run_once(t0());
    assert!(h.statuses.get(&vpa_id()).is_some());

    send(&h.input, InputEvent::DeleteVpa(vpa_id()));
    let summary = h.recommender.run_once(t0() + Duration::minutes(1));
    assert_eq!(summary.feed.vpas_deleted, 1);
    assert!(h.statuses.get(&vpa_id()).is_none());
}

#[test]
fn test_checkpoints_survive_restart() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let mut first = harness(store.clone());
    send(&first.input, InputEvent::UpsertVpa(vpa_object("app=web")));
    send(&first.input, InputEvent::UpsertPod(pod("web-1")));
    send(&first.input, InputEvent::Metrics(usage("web-1", 30)));
    let summary = first.recommender.run_once(t0() + Duration::hours(1));
    assert_eq!(summary.checkpoints_loaded, Some(0));
    let written = summary.checkpoints_written.unwrap();
    assert_eq!((written.vpas, written.written, written.failed), (1, 1, 0));
    assert_eq!(store.list().unwrap().len(), 1);

    // A fresh process only knows the VPA; its history comes from the checkpoint
    let mut second = harness(store.clone());
    send(&second.input, InputEvent::UpsertVpa(vpa_object("app=web")));
    let summary = second.recommender.run_once(t0() + Duration::hours(2));
    assert_eq!(summary.checkpoints_loaded, Some(1));
    assert_eq!(summary.recommendations, 1);

    let status = second.statuses.get(&vpa_id()).unwrap();
    assert!(condition(&status, VpaConditionType::RecommendationProvided).unwrap().status);
    assert!(condition(&status, VpaConditionType::FetchingHistory).unwrap().status);
    assert!(condition(&status, VpaConditionType::NoPodsMatched).unwrap().status);
}

#[test]
fn test_orphaned_checkpoints_collected() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let state = AggregateContainerState::new(&AggregationsConfig::default(), t0());
    store
        .save(&VpaCheckpoint {
            namespace: "default".to_string(),
            vpa_name: "gone".to_string(),
            container_name: "app".to_string(),
            status: state.save_checkpoint(t0()),
        })
        .unwrap();

    let mut h = harness(store.clone());
    send(&h.input, InputEvent::UpsertVpa(vpa_object("app=web")));
    let summary = h.recommender.run_once(t0());
    assert_eq!(summary.checkpoints_loaded, Some(0));
    assert_eq!(summary.checkpoints_deleted, None);
    assert_eq!(store.list().unwrap().len(), 1);

    let gc_interval = h.recommender.config().checkpoint_gc_interval();
    let summary = h.recommender.run_once(t0() + gc_interval);
    assert_eq!(summary.checkpoints_deleted, Some(1));
    assert!(store.list().unwrap().is_empty());

    // The replay window is closed once checkpoint GC has run
    let summary = h.recommender.run_once(t0() + gc_interval + Duration::minutes(1));
    assert_eq!(summary.checkpoints_loaded, None);
}

#[test]
fn test_checkpoints_replayed_when_vpa_arrives_after_first_iteration() {
    let store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let mut first = harness(store.clone());
    send(&first.input, InputEvent::UpsertVpa(vpa_object("app=web")));
    send(&first.input, InputEvent::UpsertPod(pod("web-1")));
    send(&first.input, InputEvent::Metrics(usage("web-1", 30)));
    first.recommender.run_once(t0() + Duration::hours(1));
    assert_eq!(store.list().unwrap().len(), 1);

    // The restarted process ticks before any input has been pushed
    let mut second = harness(store.clone());
    let summary = second.recommender.run_once(t0() + Duration::hours(2));
    assert_eq!(summary.feed.events, 0);
    assert_eq!(summary.checkpoints_loaded, Some(0));
    assert_eq!(summary.checkpoints_deleted, None);
    assert_eq!(store.list().unwrap().len(), 1);

    send(&second.input, InputEvent::UpsertVpa(vpa_object("app=web")));
    let summary = second
        .recommender
        .run_once(t0() + Duration::hours(2) + Duration::minutes(1));
    assert_eq!(summary.checkpoints_loaded, Some(1));
    assert_eq!(summary.recommendations, 1);
    assert_eq!(store.list().unwrap().len(), 1);

    let status = second.statuses.get(&vpa_id()).unwrap();
    assert!(condition(&status, VpaConditionType::FetchingHistory).unwrap().status);

    // Everything found its VPA, so later iterations skip the replay
    let summary = second
        .recommender
        .run_once(t0() + Duration::hours(2) + Duration::minutes(2));
    assert_eq!(summary.checkpoints_loaded, None);
}

#[test]
fn test_maintenance_is_rate_limited() {
    let mut h = harness(Arc::new(InMemoryCheckpointStore::new()));
    send(&h.input, InputEvent::UpsertVpa(vpa_object("app=web")));
    let first = h.recommender.run_once(t0());
    assert!(first.gc.is_some());
    assert!(first.checkpoints_written.is_some());
    assert!(first.checkpoints_deleted.is_none());

    let second = h.recommender.run_once(t0() + Duration::seconds(30));
    assert!(second.gc.is_none());
    assert!(second.checkpoints_written.is_none());
    assert!(second.checkpoints_deleted.is_none());
    assert_eq!(second.checkpoints_loaded, None);

    let later = h.recommender.run_once(t0() + Duration::hours(1));
    assert!(later.gc.is_some());
    assert!(later.checkpoints_written.is_some());
    assert!(later.checkpoints_deleted.is_some());
}

#[test]
fn test_closed_input_reported() {
    let Harness {
        mut recommender,
        input,
        ..
    } = harness(Arc::new(InMemoryCheckpointStore::new()));
    drop(input);
    assert!(recommender.run_once(t0()).feed.input_closed);
}

#[test]
fn test_builder_requires_input_and_status_writer() {
    let (_input, receiver) = input_channel(4);
    let missing_writer = RecommenderLoopBuilder::new(RecommenderConfig::default())
        .input(receiver)
        .build();
    assert!(missing_writer.is_err());

    let missing_input = RecommenderLoopBuilder::new(RecommenderConfig::default())
        .status_writer(Arc::new(RecordingStatusWriter::default()))
        .build();
    assert!(missing_input.is_err());
}

#[tokio::test]
async fn test_loop_iteration_updates_health() {
    let (input, receiver) = input_channel(16);
    let health = HealthRegistry::with_recommender_components().await;
    let statuses = Arc::new(RecordingStatusWriter::default());
    let mut recommender_loop = RecommenderLoopBuilder::new(RecommenderConfig::default())
        .input(receiver)
        .status_writer(statuses.clone())
        .health(health.clone())
        .logger(StructuredLogger::new("test-node"))
        .build()
        .unwrap();

    assert!(!health.readiness().await.ready);
    input
        .send(InputEvent::UpsertVpa(vpa_object("app=web")))
        .await
        .unwrap();
    let summary = recommender_loop.run_iteration().await;
    assert_eq!(summary.vpas_processed, 1);

    let readiness = health.readiness().await;
    assert!(readiness.ready, "{:?}", readiness.reason);
    assert_eq!(
        health.component(components::FEEDER).await.unwrap().status,
        ComponentStatus::Healthy
    );
    assert!(statuses.get(&vpa_id()).is_some());
    assert_eq!(recommender_loop.recommender().cluster().vpas().len(), 1);
}

#[tokio::test]
async fn test_loop_stops_on_shutdown() {
    let (_input, receiver) = input_channel(16);
    let health = HealthRegistry::new();
    let recommender_loop = RecommenderLoopBuilder::new(RecommenderConfig::default())
        .input(receiver)
        .status_writer(Arc::new(RecordingStatusWriter::default()))
        .health(health.clone())
        .build()
        .unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = tokio::spawn(recommender_loop.run(shutdown_rx));
    // The first tick fires immediately
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while health.health().await.last_iteration.is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

struct UnavailableStore;

impl CheckpointStore for UnavailableStore {
    fn list(&self) -> Result<Vec<VpaCheckpoint>> {
        Err(anyhow::anyhow!("store offline"))
    }

    fn save(&self, _checkpoint: &VpaCheckpoint) -> Result<()> {
        Err(anyhow::anyhow!("store offline"))
    }

    fn delete(&self, _vpa: &VpaId, _container_name: &str) -> Result<()> {
        Err(anyhow::anyhow!("store offline"))
    }
}

#[test]
fn test_unavailable_checkpoint_store_degrades_health() {
    let health = tokio_test::block_on(HealthRegistry::with_recommender_components());
    let (_input, receiver) = input_channel(4);
    let mut recommender_loop = RecommenderLoopBuilder::new(RecommenderConfig::default())
        .input(receiver)
        .status_writer(Arc::new(RecordingStatusWriter::default()))
        .checkpoint_store(Arc::new(UnavailableStore))
        .health(health.clone())
        .build()
        .unwrap();

    let summary = tokio_test::block_on(recommender_loop.run_iteration());
    assert_eq!(summary.checkpoints_loaded, None);
    assert!(summary.checkpoint_errors >= 1);
    let store_health = tokio_test::block_on(health.component(components::CHECKPOINT_STORE)).unwrap();
    assert_eq!(store_health.status, ComponentStatus::Degraded);
    assert!(tokio_test::block_on(health.readiness()).ready);

    // Listing is retried on the next iteration
    let summary = tokio_test::block_on(recommender_loop.run_iteration());
    assert_eq!(summary.checkpoints_loaded, None);
    assert!(summary.checkpoint_errors >= 1);
}
