//! VPA recommender
//!
//! Keeps a model of container usage fed through its HTTP API and publishes
//! CPU and memory recommendations for every VPA object on a fixed cadence.

use anyhow::Result;
use recommender_lib::{
    health::HealthRegistry, input_channel, CheckpointStore, FileCheckpointStore,
    InMemoryCheckpointStore, RecommenderLoopBuilder, RecommenderMetrics, StructuredLogger,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vpa_recommender::{api, config::AppConfig, state};

const RECOMMENDER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = AppConfig::load()?;
    info!(node_name = %config.node_name, api_port = config.api_port, "Recommender configured");

    let health_registry = HealthRegistry::with_recommender_components().await;
    let metrics = RecommenderMetrics::new();
    let logger = StructuredLogger::new(&config.node_name);

    let checkpoint_store: Arc<dyn CheckpointStore> = match &config.checkpoint_dir {
        Some(dir) => Arc::new(FileCheckpointStore::new(dir)?),
        None => {
            info!("No checkpoint directory configured, keeping checkpoints in memory");
            Arc::new(InMemoryCheckpointStore::new())
        }
    };
    let (input, receiver) = input_channel(config.recommender.input_queue_capacity);
    let statuses = Arc::new(state::StatusStore::new());
    let controllers = Arc::new(state::ControllerRegistry::new());

    let recommender_loop = RecommenderLoopBuilder::new(config.recommender.clone())
        .input(receiver)
        .status_writer(statuses.clone())
        .checkpoint_store(checkpoint_store)
        .controllers(controllers.clone())
        .health(health_registry.clone())
        .metrics(metrics)
        .logger(logger.clone())
        .build()?;

    logger.log_startup(RECOMMENDER_VERSION, config.recommender.recommender_interval_secs);

    let (shutdown_tx, _) = broadcast::channel(1);
    let loop_handle = tokio::spawn(recommender_loop.run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(
        health_registry,
        input,
        statuses,
        controllers,
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, shutdown_tx.subscribe()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    // Observed by the loop between iterations
    let _ = shutdown_tx.send(());

    if let Err(e) = loop_handle.await {
        error!(error = %e, "Recommender loop panicked");
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server panicked"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
