//! One recommender iteration
//!
//! Refresh the cluster state from the input queue, compute and publish a
//! recommendation per VPA, then run the rate-limited maintenance tasks:
//! aggregate GC, checkpoint writing and checkpoint GC.

use super::feeder::{ClusterStateFeeder, FeedSummary};
use crate::checkpoint::{CheckpointWriter, VpaCheckpoint, WriteSummary};
use crate::config::RecommenderConfig;
use crate::estimator::PodResourceRecommender;
use crate::model::{
    resolve_container_policy, AggregateContainerState, ClusterState, ControllerFetcher, GcStats,
    ModelError, Vpa, VpaConditionType,
};
use crate::models::{ResourceName, VpaId};
use crate::observability::{RecommenderMetrics, StructuredLogger};
use crate::postprocess::{apply_post_processors, build_post_processors, SharedPostProcessor};
use crate::status::VpaStatus;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives the status of every VPA after each iteration
pub trait StatusWriter: Send + Sync {
    fn publish(&self, status: VpaStatus) -> Result<()>;

    /// The VPA is gone; drop its published status
    fn remove(&self, id: &VpaId) -> Result<()>;
}

/// What one iteration did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationSummary {
    pub feed: FeedSummary,
    /// Set on iterations that replayed checkpoints
    pub checkpoints_loaded: Option<usize>,
    pub vpas_processed: usize,
    pub recommendations: usize,
    pub vpa_errors: usize,
    pub gc: Option<GcStats>,
    pub checkpoints_written: Option<WriteSummary>,
    pub checkpoints_deleted: Option<usize>,
    pub checkpoint_errors: usize,
}

/// Conditions derived while computing a VPA's recommendation
#[derive(Debug, Default)]
struct RecommendationFacts {
    low_confidence: bool,
    fetching_history: bool,
    config_problem: Option<(&'static str, String)>,
}

pub struct Recommender {
    config: RecommenderConfig,
    cluster: ClusterState,
    feeder: ClusterStateFeeder,
    pod_recommender: PodResourceRecommender,
    post_processors: Vec<SharedPostProcessor>,
    checkpoint_writer: CheckpointWriter,
    status_writer: Arc<dyn StatusWriter>,
    controllers: Arc<dyn ControllerFetcher>,
    metrics: RecommenderMetrics,
    logger: StructuredLogger,
    /// Stored checkpoints whose VPA has not been seen yet; `None` until
    /// the store has been listed
    pending_checkpoints: Option<Vec<VpaCheckpoint>>,
    /// Closed by the first checkpoint GC
    replay_closed: bool,
    last_checkpoint: Option<DateTime<Utc>>,
    last_checkpoint_gc: Option<DateTime<Utc>>,
    published: BTreeSet<VpaId>,
}

impl Recommender {
    pub fn new(
        config: RecommenderConfig,
        feeder: ClusterStateFeeder,
        checkpoint_writer: CheckpointWriter,
        status_writer: Arc<dyn StatusWriter>,
        controllers: Arc<dyn ControllerFetcher>,
        metrics: RecommenderMetrics,
        logger: StructuredLogger,
    ) -> Result<Self> {
        config.validate()?;
        let aggregations = config
            .aggregations()
            .map_err(|e| anyhow!("Invalid histogram configuration: {e}"))?;
        Ok(Self {
            cluster: ClusterState::new(Arc::new(aggregations), config.gc_interval()),
            pod_recommender: PodResourceRecommender::from_config(&config),
            post_processors: build_post_processors(&config),
            config,
            feeder,
            checkpoint_writer,
            status_writer,
            controllers,
            metrics,
            logger,
            pending_checkpoints: None,
            replay_closed: false,
            last_checkpoint: None,
            last_checkpoint_gc: None,
            published: BTreeSet::new(),
        })
    }

    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    pub fn config(&self) -> &RecommenderConfig {
        &self.config
    }

    /// Run a full iteration at `now`. Per-VPA and I/O failures are logged
    /// and counted; they never abort the iteration.
    pub fn run_once(&mut self, now: DateTime<Utc>) -> IterationSummary {
        let mut summary = IterationSummary {
            feed: self.feeder.feed(&mut self.cluster, now),
            ..Default::default()
        };

        // Inputs may still be arriving, so checkpoint GC waits a full
        // interval before treating unknown VPAs as deleted
        if self.last_checkpoint_gc.is_none() {
            self.last_checkpoint_gc = Some(now);
        }
        self.replay_checkpoints(now, &mut summary);

        self.update_vpas(now, &mut summary);
        self.maintain(now, &mut summary);

        self.metrics.set_model_sizes(
            self.cluster.aggregates().len(),
            self.cluster.vpas().len(),
            self.cluster.pods().len(),
        );
        summary
    }

    /// Restore checkpoints of VPAs that became known since the last
    /// iteration. Runs until every stored checkpoint found its VPA or the
    /// first checkpoint GC closes the replay window.
    fn replay_checkpoints(&mut self, now: DateTime<Utc>, summary: &mut IterationSummary) {
        if self.replay_closed {
            return;
        }
        let mut pending = match self.pending_checkpoints.take() {
            Some(pending) => pending,
            None => match self.feeder.list_checkpoints() {
                Ok(listed) => listed,
                Err(e) => {
                    warn!(error = %e, "Checkpoints unavailable, retrying next iteration");
                    summary.checkpoint_errors += 1;
                    return;
                }
            },
        };
        summary.checkpoints_loaded =
            Some(self.feeder.replay_checkpoints(&mut self.cluster, &mut pending, now));
        if pending.is_empty() {
            self.replay_closed = true;
        } else {
            self.pending_checkpoints = Some(pending);
        }
    }

    fn update_vpas(&mut self, now: DateTime<Utc>, summary: &mut IterationSummary) {
        let ids: Vec<VpaId> = self.cluster.vpas().keys().cloned().collect();
        for id in &ids {
            summary.vpas_processed += 1;
            match self.update_vpa(id, now) {
                Ok(count) => summary.recommendations += count,
                Err(e) => {
                    summary.vpa_errors += 1;
                    self.metrics.inc_vpa_errors();
                    warn!(vpa = %id, error = %e, "Failed to update VPA");
                }
            }
        }
        self.metrics.add_recommendations(summary.recommendations);

        let live: BTreeSet<VpaId> = ids.into_iter().collect();
        for gone in self.published.difference(&live) {
            if let Err(e) = self.status_writer.remove(gone) {
                warn!(vpa = %gone, error = %e, "Failed to remove status of deleted VPA");
            }
        }
        self.published = live;
    }

    /// Compute, store and publish one VPA's recommendation. Returns the
    /// number of container recommendations.
    fn update_vpa(&mut self, id: &VpaId, now: DateTime<Utc>) -> Result<usize> {
        let states = self.cluster.recommendable_container_states(id, now)?;
        let vpa = self
            .cluster
            .vpa(id)
            .ok_or_else(|| ModelError::VpaNotFound(id.clone()))?;
        let facts = self.facts(vpa, &states);
        let recommendation = apply_post_processors(
            &self.post_processors,
            vpa,
            self.pod_recommender.recommend(&states),
        );
        for container in &recommendation.container_recommendations {
            self.logger.log_recommendation(id, container);
        }
        let count = recommendation.container_recommendations.len();

        self.cluster.update_recommendation(id, recommendation)?;
        if let Some(vpa) = self.cluster.vpa_mut(id) {
            apply_conditions(vpa, &facts, now);
        }
        if let Err(ModelError::RecommendationMissing { vpa, since }) =
            self.cluster.record_recommendation(id, now)
        {
            self.logger.log_recommendation_missing(&vpa, since);
        }

        let vpa = self
            .cluster
            .vpa(id)
            .ok_or_else(|| ModelError::VpaNotFound(id.clone()))?;
        self.status_writer
            .publish(VpaStatus::from_vpa(vpa, self.config.humanize_memory, now))?;
        Ok(count)
    }

    fn facts(&self, vpa: &Vpa, states: &BTreeMap<String, AggregateContainerState>) -> RecommendationFacts {
        let low_confidence = states
            .values()
            .any(|state| state.confidence() < self.config.low_confidence_threshold_days);

        let live_samples = vpa.aggregate_keys().any(|key| {
            self.cluster
                .aggregate(key)
                .is_some_and(|aggregate| aggregate.total_samples_count() > 0)
        });
        let fetching_history = !states.is_empty() && !live_samples;

        let config_problem = match &vpa.selector_error {
            Some(error) => Some(("InvalidSelector", error.clone())),
            None => conflicting_policies(vpa, states.keys())
                .map(|message| ("ConflictingPolicy", message)),
        };
        RecommendationFacts {
            low_confidence,
            fetching_history,
            config_problem,
        }
    }

    fn maintain(&mut self, now: DateTime<Utc>, summary: &mut IterationSummary) {
        if let Some(stats) = self
            .cluster
            .rate_limited_garbage_collect(now, self.controllers.as_ref())
        {
            self.metrics.add_aggregates_gc(stats.aggregates_removed);
            self.logger.log_garbage_collection(stats);
            summary.gc = Some(stats);
        }

        if due(self.last_checkpoint, now, self.config.checkpoint_interval()) {
            let written = self.checkpoint_writer.store_checkpoints(
                &mut self.cluster,
                now,
                self.config.max_checkpoints_per_run,
            );
            self.metrics.add_checkpoints_written(written.written);
            if written.vpas > 0 {
                self.logger.log_checkpoints_written(written);
            }
            summary.checkpoint_errors += written.failed;
            summary.checkpoints_written = Some(written);
            self.last_checkpoint = Some(now);
        }

        if due(self.last_checkpoint_gc, now, self.config.checkpoint_gc_interval()) {
            match self.checkpoint_writer.garbage_collect(&self.cluster) {
                Ok(deleted) => {
                    debug!(deleted, "Checkpoint garbage collection finished");
                    summary.checkpoints_deleted = Some(deleted);
                }
                Err(e) => {
                    warn!(error = %e, "Checkpoint garbage collection failed");
                    summary.checkpoint_errors += 1;
                }
            }
            self.last_checkpoint_gc = Some(now);
            if let Some(unclaimed) = self.pending_checkpoints.take() {
                debug!(unclaimed = unclaimed.len(), "Checkpoint replay closed");
            }
            self.replay_closed = true;
        }
    }
}

fn due(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    last.map_or(true, |last| now - last >= interval)
}

/// Describe containers whose policy sets a minimum above the maximum
fn conflicting_policies<'a>(vpa: &Vpa, containers: impl Iterator<Item = &'a String>) -> Option<String> {
    let conflicts: Vec<String> = containers
        .filter_map(|name| {
            let resources = resolve_container_policy(vpa.resource_policy.as_ref(), name)
                .conflicting_resources();
            if resources.is_empty() {
                return None;
            }
            let resources: Vec<&str> = resources.iter().map(ResourceName::as_str).collect();
            Some(format!("{name}: {}", resources.join(",")))
        })
        .collect();
    if conflicts.is_empty() {
        None
    } else {
        Some(format!("minAllowed is above maxAllowed for {}", conflicts.join("; ")))
    }
}

fn apply_conditions(vpa: &mut Vpa, facts: &RecommendationFacts, now: DateTime<Utc>) {
    vpa.update_conditions(vpa.pod_count > 0, now);
    let provided = vpa.has_recommendation();

    if provided && facts.low_confidence {
        vpa.conditions.set(
            VpaConditionType::LowConfidence,
            true,
            "LowConfidence",
            "Recommendation is based on a short usage history",
            now,
        );
    } else {
        vpa.conditions.remove(VpaConditionType::LowConfidence);
    }

    if provided && facts.fetching_history {
        vpa.conditions.set(
            VpaConditionType::FetchingHistory,
            true,
            "FetchingHistory",
            "Recommendation is based on checkpointed history only",
            now,
        );
    } else {
        vpa.conditions.remove(VpaConditionType::FetchingHistory);
    }

    match &facts.config_problem {
        Some((reason, message)) => {
            vpa.conditions
                .set(VpaConditionType::ConfigUnsupported, true, reason, message, now);
        }
        None => vpa.conditions.remove(VpaConditionType::ConfigUnsupported),
    }
}
