//! Vertical Pod Autoscaler recommender library
//!
//! This crate provides:
//! - Decaying histograms of CPU usage and memory peaks
//! - The in-memory cluster model of pods, containers, aggregates and VPAs
//! - Estimators and post-processors turning usage history into recommendations
//! - Checkpointing of aggregated history
//! - The recommender iteration and its timed loop
//! - Health checks and observability

pub mod checkpoint;
pub mod config;
pub mod estimator;
pub mod health;
pub mod histogram;
pub mod model;
pub mod models;
pub mod observability;
pub mod postprocess;
pub mod routines;
pub mod status;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
pub use config::RecommenderConfig;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use model::{ControllerFetcher, ControllerKey};
pub use models::*;
pub use observability::{RecommenderMetrics, StructuredLogger};
pub use routines::{
    input_channel, InputEvent, InputSender, RecommenderLoop, RecommenderLoopBuilder, StatusWriter,
};
pub use status::VpaStatus;
