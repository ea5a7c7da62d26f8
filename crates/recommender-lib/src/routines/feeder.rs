//! Hand-off between input producers and the cluster state
//!
//! Watchers, metric pollers and OOM listeners push [`InputEvent`]s onto a
//! bounded channel. At the start of each iteration the feeder drains it and
//! applies the events in a fixed order: VPAs, then pods and containers,
//! then usage samples, then OOMs.

use crate::checkpoint::{CheckpointStore, VpaCheckpoint};
use crate::model::{ClusterState, ModelError};
use crate::models::{
    ContainerId, ContainerMetricsSnapshot, ContainerUsageSampleWithKey, OomInfo, PodId, PodSpec,
    Resources, VpaId, VpaObject,
};
use crate::observability::{RecommenderMetrics, StructuredLogger};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    UpsertVpa(VpaObject),
    DeleteVpa(VpaId),
    UpsertPod(PodSpec),
    DeletePod(PodId),
    UpsertContainer { id: ContainerId, request: Resources },
    Metrics(Vec<ContainerMetricsSnapshot>),
    Oom(Vec<OomInfo>),
}

pub type InputSender = mpsc::Sender<InputEvent>;
pub type InputReceiver = mpsc::Receiver<InputEvent>;

/// Bounded hand-off queue; producers see `try_send` fail when it is full
pub fn input_channel(capacity: usize) -> (InputSender, InputReceiver) {
    mpsc::channel(capacity.max(1))
}

/// What one drain applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub events: usize,
    pub vpas_upserted: usize,
    pub vpas_deleted: usize,
    pub pods_upserted: usize,
    pub pods_deleted: usize,
    pub containers_upserted: usize,
    pub samples_added: usize,
    pub samples_discarded: usize,
    pub ooms_recorded: usize,
    pub ooms_discarded: usize,
    /// Every producer has gone away
    pub input_closed: bool,
}

#[derive(Default)]
struct Batches {
    vpas: Vec<InputEvent>,
    pods: Vec<InputEvent>,
    samples: Vec<ContainerUsageSampleWithKey>,
    ooms: Vec<OomInfo>,
}

pub struct ClusterStateFeeder {
    input: InputReceiver,
    checkpoint_store: Arc<dyn CheckpointStore>,
    metrics: RecommenderMetrics,
    logger: StructuredLogger,
}

impl ClusterStateFeeder {
    pub fn new(
        input: InputReceiver,
        checkpoint_store: Arc<dyn CheckpointStore>,
        metrics: RecommenderMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            input,
            checkpoint_store,
            metrics,
            logger,
        }
    }

    /// Apply everything queued so far
    pub fn feed(&mut self, cluster: &mut ClusterState, now: DateTime<Utc>) -> FeedSummary {
        let mut summary = FeedSummary::default();
        let batches = self.drain(&mut summary);

        for event in batches.vpas {
            self.apply_vpa_event(cluster, event, &mut summary);
        }
        for event in batches.pods {
            self.apply_pod_event(cluster, event, now, &mut summary);
        }
        for sample in batches.samples {
            self.add_sample(cluster, sample, now, &mut summary);
        }
        for oom in batches.ooms {
            self.record_oom(cluster, oom, now, &mut summary);
        }
        summary
    }

    /// Everything in the checkpoint store
    pub fn list_checkpoints(&self) -> Result<Vec<VpaCheckpoint>> {
        self.checkpoint_store
            .list()
            .context("Failed to list checkpoints")
    }

    /// Restore the checkpoints of tracked VPAs and return how many were
    /// restored. Checkpoints of VPAs not seen yet stay in `pending`; broken
    /// ones are dropped.
    pub fn replay_checkpoints(
        &self,
        cluster: &mut ClusterState,
        pending: &mut Vec<VpaCheckpoint>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut loaded = 0;
        pending.retain(|checkpoint| match cluster.set_vpa_checkpoint(checkpoint, now) {
            Ok(()) => {
                loaded += 1;
                false
            }
            Err(ModelError::VpaNotFound(_)) => true,
            Err(e) => {
                self.logger.log_checkpoint_load_failed(&checkpoint.name(), &e);
                false
            }
        });
        debug!(loaded, pending = pending.len(), "Checkpoints restored");
        loaded
    }

    fn drain(&mut self, summary: &mut FeedSummary) -> Batches {
        let mut batches = Batches::default();
        loop {
            let event = match self.input.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    summary.input_closed = true;
                    break;
                }
            };
            summary.events += 1;
            match event {
                InputEvent::UpsertVpa(_) | InputEvent::DeleteVpa(_) => batches.vpas.push(event),
                InputEvent::UpsertPod(_)
                | InputEvent::DeletePod(_)
                | InputEvent::UpsertContainer { .. } => batches.pods.push(event),
                InputEvent::Metrics(snapshots) => batches
                    .samples
                    .extend(snapshots.into_iter().flat_map(ContainerMetricsSnapshot::into_samples)),
                InputEvent::Oom(ooms) => batches.ooms.extend(ooms),
            }
        }
        batches
    }

    fn apply_vpa_event(&self, cluster: &mut ClusterState, event: InputEvent, summary: &mut FeedSummary) {
        match event {
            InputEvent::UpsertVpa(object) => {
                // An unparsable selector still tracks the VPA; the error
                // surfaces as a condition
                if let Err(e) = cluster.add_or_update_vpa(&object) {
                    warn!(vpa = %object.id, error = %e, "VPA stored without a usable selector");
                }
                summary.vpas_upserted += 1;
            }
            InputEvent::DeleteVpa(id) => match cluster.delete_vpa(&id) {
                Ok(()) => summary.vpas_deleted += 1,
                Err(e) => debug!(vpa = %id, error = %e, "Delete of untracked VPA ignored"),
            },
            _ => {}
        }
    }

    fn apply_pod_event(
        &self,
        cluster: &mut ClusterState,
        event: InputEvent,
        now: DateTime<Utc>,
        summary: &mut FeedSummary,
    ) {
        match event {
            InputEvent::UpsertPod(pod) => {
                cluster.add_or_update_pod(&pod.id, &pod.labels, pod.phase, now);
                summary.pods_upserted += 1;
                for container in pod.containers {
                    let id = ContainerId::new(pod.id.clone(), container.name);
                    if cluster.add_or_update_container(&id, container.request, now).is_ok() {
                        summary.containers_upserted += 1;
                    }
                }
            }
            InputEvent::DeletePod(id) => {
                cluster.delete_pod(&id);
                summary.pods_deleted += 1;
            }
            InputEvent::UpsertContainer { id, request } => {
                match cluster.add_or_update_container(&id, request, now) {
                    Ok(()) => summary.containers_upserted += 1,
                    Err(e) => debug!(container = %id, error = %e, "Container of unknown pod ignored"),
                }
            }
            _ => {}
        }
    }

    fn add_sample(
        &self,
        cluster: &mut ClusterState,
        mut sample: ContainerUsageSampleWithKey,
        now: DateTime<Utc>,
        summary: &mut FeedSummary,
    ) {
        // Metric snapshots carry no request; use the container's current one
        if sample.sample.request.is_zero() {
            if let Some(request) = cluster
                .container(&sample.container)
                .and_then(|container| container.request.get(&sample.sample.resource))
            {
                sample.sample.request = *request;
            }
        }
        match cluster.add_sample(&sample, now) {
            Ok(()) => summary.samples_added += 1,
            Err(e) => {
                summary.samples_discarded += 1;
                self.metrics.inc_samples_discarded();
                self.logger
                    .log_sample_discarded(&sample.container, &e.to_string());
            }
        }
    }

    fn record_oom(&self, cluster: &mut ClusterState, oom: OomInfo, now: DateTime<Utc>, summary: &mut FeedSummary) {
        match cluster.record_oom(&oom.container, oom.timestamp, oom.requested_memory, now) {
            Ok(()) => {
                summary.ooms_recorded += 1;
                self.metrics.inc_ooms_recorded();
            }
            Err(e) => {
                summary.ooms_discarded += 1;
                self.metrics.inc_samples_discarded();
                self.logger.log_sample_discarded(&oom.container, &e.to_string());
            }
        }
    }
}
