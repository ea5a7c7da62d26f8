//! Observability for the recommender
//!
//! Provides:
//! - Prometheus metrics (iteration latency, model sizes, input and output counters)
//! - Structured logging of recommender events with tracing

use crate::checkpoint::WriteSummary;
use crate::model::GcStats;
use crate::models::{ContainerId, RecommendedContainerResources, ResourceName, VpaId};
use chrono::{DateTime, Utc};
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Iteration latency buckets, in seconds
const ITERATION_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Registered once per process. `None` if registration failed, in which
/// case every recording is a no-op.
static GLOBAL_METRICS: OnceLock<Option<MetricsInner>> = OnceLock::new();

struct MetricsInner {
    iteration_latency_seconds: Histogram,
    aggregate_states: IntGauge,
    vpa_objects: IntGauge,
    pods: IntGauge,
    recommendations: IntCounter,
    samples_discarded: IntCounter,
    ooms_recorded: IntCounter,
    checkpoints_written: IntCounter,
    aggregates_gc: IntCounter,
    vpa_errors: IntCounter,
}

impl MetricsInner {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            iteration_latency_seconds: register_histogram!(
                "vpa_recommender_iteration_latency_seconds",
                "Time spent in one recommender iteration",
                ITERATION_LATENCY_BUCKETS.to_vec()
            )?,
            aggregate_states: register_int_gauge!(
                "vpa_recommender_aggregate_states",
                "Number of aggregate container states tracked"
            )?,
            vpa_objects: register_int_gauge!(
                "vpa_recommender_vpa_objects",
                "Number of VPA objects tracked"
            )?,
            pods: register_int_gauge!("vpa_recommender_pods", "Number of pods tracked")?,
            recommendations: register_int_counter!(
                "vpa_recommender_recommendations_total",
                "Container recommendations computed"
            )?,
            samples_discarded: register_int_counter!(
                "vpa_recommender_samples_discarded_total",
                "Usage samples and OOM events dropped as invalid, stale or unknown"
            )?,
            ooms_recorded: register_int_counter!(
                "vpa_recommender_ooms_recorded_total",
                "OOM events recorded as memory peaks"
            )?,
            checkpoints_written: register_int_counter!(
                "vpa_recommender_checkpoints_written_total",
                "Checkpoint records written to the store"
            )?,
            aggregates_gc: register_int_counter!(
                "vpa_recommender_aggregates_gc_total",
                "Aggregate container states removed by garbage collection"
            )?,
            vpa_errors: register_int_counter!(
                "vpa_recommender_vpa_errors_total",
                "Per-VPA failures during an iteration"
            )?,
        })
    }
}

/// Handle to the process-wide recommender metrics. Cheap to clone.
#[derive(Clone)]
pub struct RecommenderMetrics {
    inner: Option<&'static MetricsInner>,
}

impl Default for RecommenderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RecommenderMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecommenderMetrics")
            .field("registered", &self.inner.is_some())
            .finish()
    }
}

impl RecommenderMetrics {
    pub fn new() -> Self {
        let inner = GLOBAL_METRICS.get_or_init(|| match MetricsInner::register() {
            Ok(inner) => Some(inner),
            Err(e) => {
                warn!(error = %e, "Failed to register recommender metrics");
                None
            }
        });
        Self {
            inner: inner.as_ref(),
        }
    }

    fn with(&self, record: impl FnOnce(&MetricsInner)) {
        if let Some(inner) = self.inner {
            record(inner);
        }
    }

    pub fn observe_iteration_latency(&self, duration_secs: f64) {
        self.with(|m| m.iteration_latency_seconds.observe(duration_secs));
    }

    /// Publish the current size of the cluster model
    pub fn set_model_sizes(&self, aggregates: usize, vpas: usize, pods: usize) {
        self.with(|m| {
            m.aggregate_states.set(gauge_value(aggregates));
            m.vpa_objects.set(gauge_value(vpas));
            m.pods.set(gauge_value(pods));
        });
    }

    pub fn add_recommendations(&self, count: usize) {
        self.with(|m| m.recommendations.inc_by(count as u64));
    }

    pub fn inc_samples_discarded(&self) {
        self.with(|m| m.samples_discarded.inc());
    }

    pub fn inc_ooms_recorded(&self) {
        self.with(|m| m.ooms_recorded.inc());
    }

    pub fn add_checkpoints_written(&self, count: usize) {
        self.with(|m| m.checkpoints_written.inc_by(count as u64));
    }

    pub fn add_aggregates_gc(&self, count: usize) {
        self.with(|m| m.aggregates_gc.inc_by(count as u64));
    }

    pub fn inc_vpa_errors(&self) {
        self.with(|m| m.vpa_errors.inc());
    }
}

fn gauge_value(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// Structured logger for recommender events
///
/// Every event carries an `event` field and the name of the node the
/// recommender runs on, so log pipelines can filter without parsing messages.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_startup(&self, version: &str, interval_secs: u64) {
        info!(
            event = "recommender_started",
            node = %self.node_name,
            version = %version,
            interval_secs = interval_secs,
            "VPA recommender started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "recommender_shutdown",
            node = %self.node_name,
            reason = %reason,
            "VPA recommender shutting down"
        );
    }

    pub fn log_recommendation(&self, vpa: &VpaId, container: &RecommendedContainerResources) {
        let amount = |tier: &crate::models::Resources, resource| {
            tier.get(&resource).map(|a| a.value()).unwrap_or_default()
        };
        debug!(
            event = "recommendation_updated",
            node = %self.node_name,
            vpa = %vpa,
            container = %container.container_name,
            target_cpu_millicores = amount(&container.target, ResourceName::Cpu),
            target_memory_bytes = amount(&container.target, ResourceName::Memory),
            lower_cpu_millicores = amount(&container.lower_bound, ResourceName::Cpu),
            upper_cpu_millicores = amount(&container.upper_bound, ResourceName::Cpu),
            lower_memory_bytes = amount(&container.lower_bound, ResourceName::Memory),
            upper_memory_bytes = amount(&container.upper_bound, ResourceName::Memory),
            "Recommendation updated"
        );
    }

    pub fn log_recommendation_missing(&self, vpa: &VpaId, since: DateTime<Utc>) {
        warn!(
            event = "recommendation_missing",
            node = %self.node_name,
            vpa = %vpa,
            since = %since,
            "VPA has had no recommendation for too long"
        );
    }

    pub fn log_sample_discarded(&self, container: &ContainerId, reason: &str) {
        debug!(
            event = "sample_discarded",
            node = %self.node_name,
            container = %container,
            reason = %reason,
            "Input discarded"
        );
    }

    pub fn log_garbage_collection(&self, stats: GcStats) {
        info!(
            event = "aggregates_garbage_collected",
            node = %self.node_name,
            aggregates_removed = stats.aggregates_removed,
            label_sets_reclaimed = stats.label_sets_reclaimed,
            "Aggregate garbage collection finished"
        );
    }

    pub fn log_checkpoints_written(&self, summary: WriteSummary) {
        if summary.failed > 0 {
            warn!(
                event = "checkpoints_written",
                node = %self.node_name,
                vpas = summary.vpas,
                written = summary.written,
                failed = summary.failed,
                "Some checkpoints could not be written"
            );
        } else {
            info!(
                event = "checkpoints_written",
                node = %self.node_name,
                vpas = summary.vpas,
                written = summary.written,
                "Checkpoints written"
            );
        }
    }

    pub fn log_checkpoint_load_failed(&self, checkpoint: &str, error: &dyn std::fmt::Display) {
        warn!(
            event = "checkpoint_load_failed",
            node = %self.node_name,
            checkpoint = %checkpoint,
            error = %error,
            "Checkpoint could not be loaded, starting without it"
        );
    }
}
