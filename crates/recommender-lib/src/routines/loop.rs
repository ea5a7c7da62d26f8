//! Recommender main loop
//!
//! Runs one [`Recommender`] iteration per tick and reports the outcome to
//! the health registry and metrics. Shutdown is only observed between
//! iterations.

use super::feeder::{ClusterStateFeeder, InputReceiver};
use super::recommender::{IterationSummary, Recommender, StatusWriter};
use crate::checkpoint::{CheckpointStore, CheckpointWriter, InMemoryCheckpointStore};
use crate::config::RecommenderConfig;
use crate::health::{components, HealthRegistry};
use crate::model::{ControllerFetcher, NoControllers};
use crate::observability::{RecommenderMetrics, StructuredLogger};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

pub struct RecommenderLoop {
    recommender: Recommender,
    interval: Duration,
    health: HealthRegistry,
    metrics: RecommenderMetrics,
    logger: StructuredLogger,
}

impl RecommenderLoop {
    pub fn recommender(&self) -> &Recommender {
        &self.recommender
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Starting recommender loop");

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut iterations = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.run_iteration().await;
                    iterations += 1;
                    debug!(
                        iteration = iterations,
                        events = summary.feed.events,
                        vpas = summary.vpas_processed,
                        recommendations = summary.recommendations,
                        vpa_errors = summary.vpa_errors,
                        "Recommender iteration complete"
                    );
                }
                _ = shutdown.recv() => {
                    self.logger.log_shutdown("shutdown requested");
                    break;
                }
            }
        }
    }

    /// Run one iteration now and publish its outcome
    pub async fn run_iteration(&mut self) -> IterationSummary {
        let start = Instant::now();
        let now = Utc::now();
        let summary = self.recommender.run_once(now);
        self.metrics
            .observe_iteration_latency(start.elapsed().as_secs_f64());
        self.report_health(&summary).await;
        self.health.mark_iteration_complete(now).await;
        summary
    }

    async fn report_health(&self, summary: &IterationSummary) {
        if summary.feed.input_closed {
            self.health
                .set_unhealthy(components::FEEDER, "All input producers disconnected")
                .await;
        } else {
            self.health.set_healthy(components::FEEDER).await;
        }

        if summary.vpa_errors > 0 {
            self.health
                .set_degraded(
                    components::RECOMMENDER,
                    format!("{} of {} VPAs failed to update", summary.vpa_errors, summary.vpas_processed),
                )
                .await;
        } else {
            self.health.set_healthy(components::RECOMMENDER).await;
        }

        if summary.checkpoint_errors > 0 {
            self.health
                .set_degraded(
                    components::CHECKPOINT_STORE,
                    format!("{} checkpoint operations failed", summary.checkpoint_errors),
                )
                .await;
        } else {
            self.health.set_healthy(components::CHECKPOINT_STORE).await;
        }
    }
}

/// Builder for the recommender loop. The input queue and the status writer
/// are required; everything else has a default.
pub struct RecommenderLoopBuilder {
    config: RecommenderConfig,
    input: Option<InputReceiver>,
    status_writer: Option<Arc<dyn StatusWriter>>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    controllers: Option<Arc<dyn ControllerFetcher>>,
    health: Option<HealthRegistry>,
    metrics: Option<RecommenderMetrics>,
    logger: Option<StructuredLogger>,
}

impl RecommenderLoopBuilder {
    pub fn new(config: RecommenderConfig) -> Self {
        Self {
            config,
            input: None,
            status_writer: None,
            checkpoint_store: None,
            controllers: None,
            health: None,
            metrics: None,
            logger: None,
        }
    }

    pub fn input(mut self, input: InputReceiver) -> Self {
        self.input = Some(input);
        self
    }

    pub fn status_writer(mut self, writer: Arc<dyn StatusWriter>) -> Self {
        self.status_writer = Some(writer);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn controllers(mut self, controllers: Arc<dyn ControllerFetcher>) -> Self {
        self.controllers = Some(controllers);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn metrics(mut self, metrics: RecommenderMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<RecommenderLoop> {
        let input = self.input.ok_or_else(|| anyhow!("Input queue is required"))?;
        let status_writer = self
            .status_writer
            .ok_or_else(|| anyhow!("Status writer is required"))?;
        let checkpoint_store = self
            .checkpoint_store
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new()));
        let metrics = self.metrics.unwrap_or_default();
        let logger = self
            .logger
            .unwrap_or_else(|| StructuredLogger::new("unknown"));

        let feeder = ClusterStateFeeder::new(
            input,
            checkpoint_store.clone(),
            metrics.clone(),
            logger.clone(),
        );
        let interval = self.config.recommender_interval();
        let recommender = Recommender::new(
            self.config,
            feeder,
            CheckpointWriter::new(checkpoint_store),
            status_writer,
            self.controllers.unwrap_or_else(|| Arc::new(NoControllers)),
            metrics.clone(),
            logger.clone(),
        )?;

        Ok(RecommenderLoop {
            recommender,
            interval,
            health: self.health.unwrap_or_default(),
            metrics,
            logger,
        })
    }
}
