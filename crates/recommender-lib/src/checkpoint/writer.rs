//! Periodic checkpoint writing and checkpoint garbage collection

use super::record::VpaCheckpoint;
use super::store::CheckpointStore;
use crate::model::{AggregateContainerState, ClusterState};
use crate::models::{ContainerUsageSample, ResourceName, VpaId};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one checkpoint pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub vpas: usize,
    pub written: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointWriter {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Write checkpoints for at most `max_vpas` VPAs, least recently
    /// checkpointed first. Failed records are logged and counted; the VPA
    /// is only marked as written when all of its records were saved.
    pub fn store_checkpoints(
        &self,
        cluster: &mut ClusterState,
        now: DateTime<Utc>,
        max_vpas: usize,
    ) -> WriteSummary {
        let mut order: Vec<(Option<DateTime<Utc>>, VpaId)> = cluster
            .vpas()
            .values()
            .map(|vpa| (vpa.checkpoint_written, vpa.id.clone()))
            .collect();
        order.sort();

        let mut summary = WriteSummary::default();
        for (_, vpa_id) in order.into_iter().take(max_vpas) {
            let states = match states_for_checkpoint(cluster, &vpa_id, now) {
                Ok(states) => states,
                Err(e) => {
                    warn!(vpa = %vpa_id, error = %e, "Cannot build checkpoint state");
                    summary.failed += 1;
                    continue;
                }
            };

            let mut failed = false;
            for (container_name, state) in states {
                let checkpoint = VpaCheckpoint {
                    namespace: vpa_id.namespace.clone(),
                    vpa_name: vpa_id.vpa_name.clone(),
                    container_name,
                    status: state.save_checkpoint(now),
                };
                match self.store.save(&checkpoint) {
                    Ok(()) => summary.written += 1,
                    Err(e) => {
                        warn!(checkpoint = %checkpoint.name(), error = %e, "Failed to save checkpoint");
                        summary.failed += 1;
                        failed = true;
                    }
                }
            }
            if !failed {
                if let Some(vpa) = cluster.vpa_mut(&vpa_id) {
                    vpa.checkpoint_written = Some(now);
                }
            }
            summary.vpas += 1;
        }
        summary
    }

    /// Delete stored checkpoints whose VPA is no longer tracked. Returns
    /// the number of deleted records.
    pub fn garbage_collect(&self, cluster: &ClusterState) -> Result<usize> {
        let mut deleted = 0;
        for checkpoint in self.store.list()? {
            let vpa_id = checkpoint.vpa_id();
            if cluster.vpa(&vpa_id).is_some() {
                continue;
            }
            match self.store.delete(&vpa_id, &checkpoint.container_name) {
                Ok(()) => {
                    debug!(checkpoint = %checkpoint.name(), "Deleted orphaned checkpoint");
                    deleted += 1;
                }
                Err(e) => warn!(checkpoint = %checkpoint.name(), error = %e, "Failed to delete checkpoint"),
            }
        }
        Ok(deleted)
    }
}

/// Merged per-container state of a VPA without the peaks of memory windows
/// that are still open, so a restored checkpoint never holds two peaks for
/// the same window
fn states_for_checkpoint(
    cluster: &ClusterState,
    vpa_id: &VpaId,
    now: DateTime<Utc>,
) -> crate::model::ModelResult<BTreeMap<String, AggregateContainerState>> {
    let mut states = cluster.aggregate_state_by_container_name(vpa_id, now)?;
    let Some(vpa) = cluster.vpa(vpa_id) else {
        return Ok(states);
    };
    for pod in cluster.pods().values() {
        for (name, container) in pod.containers() {
            if !vpa.uses_aggregation(container.aggregate_key()) {
                continue;
            }
            let (Some(state), Some((peak, window_end))) =
                (states.get_mut(name), container.open_window_peak(now))
            else {
                continue;
            };
            if peak.is_zero() {
                continue;
            }
            state.subtract_sample(&ContainerUsageSample {
                measure_start: window_end,
                usage: peak,
                request: container
                    .request
                    .get(&ResourceName::Memory)
                    .copied()
                    .unwrap_or_default(),
                resource: ResourceName::Memory,
            })?;
        }
    }
    Ok(states)
}
