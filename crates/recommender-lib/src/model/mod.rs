//! In-memory model of the cluster
//!
//! Pods and their containers feed usage samples into aggregates keyed by
//! (namespace, container name, pod labels). VPAs select aggregates through
//! their label selector and carry the resulting recommendations. All of it
//! is owned by [`ClusterState`].

mod aggregate;
mod cluster;
mod config;
mod container;
mod controller;
mod labels;
mod policy;
mod selector;
mod vpa;


pub use aggregate::AggregateContainerState;
pub use cluster::{
    AggregateStateKey, ClusterState, GcStats, PodState, RECOMMENDATION_MISSING_MAX_MINUTES,
};
pub use config::{
    AggregationsConfig, DEFAULT_MEMORY_AGGREGATION_INTERVAL_COUNT, DEFAULT_OOM_BUMP_UP_RATIO,
    DEFAULT_OOM_MIN_BUMP_UP_BYTES,
};
pub use container::ContainerState;
pub use controller::{ControllerFetcher, ControllerKey, NoControllers};
pub use labels::{canonical_labels, LabelSet, LabelSetInterner, LabelSetKey};
pub use policy::{resolve_container_policy, ResolvedContainerPolicy, WILDCARD_CONTAINER_NAME};
pub use selector::{LabelSelector, Requirement};
pub use vpa::{Vpa, VpaCondition, VpaConditionType, VpaConditions};

use crate::histogram::HistogramError;
use crate::models::{ContainerId, PodId, ResourceName, VpaId};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("pod {0} is not tracked")]
    PodNotFound(PodId),

    #[error("container {0} is not tracked")]
    ContainerNotFound(ContainerId),

    #[error("VPA {0} is not tracked")]
    VpaNotFound(VpaId),

    #[error("sample for {container} discarded (invalid or out of order)")]
    SampleDiscarded { container: ContainerId },

    #[error("OOM event at {timestamp} is too old")]
    OomTooOld { timestamp: DateTime<Utc> },

    #[error("OOM sample at {timestamp} was rejected")]
    OomSampleRejected { timestamp: DateTime<Utc> },

    #[error("{0} samples cannot be subtracted")]
    UnsupportedSubtraction(ResourceName),

    #[error("checkpoint version {found:?} does not match {expected:?}")]
    CheckpointVersion { expected: String, found: String },

    #[error("invalid label selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("VPA {vpa} has had no recommendation since {since}")]
    RecommendationMissing { vpa: VpaId, since: DateTime<Utc> },

    #[error(transparent)]
    Histogram(#[from] HistogramError),
}

impl ModelError {
    /// Input referred to an object the cluster state does not know
    pub fn is_key_missing(&self) -> bool {
        matches!(
            self,
            ModelError::PodNotFound(_) | ModelError::ContainerNotFound(_) | ModelError::VpaNotFound(_)
        )
    }
}

pub type ModelResult<T> = Result<T, ModelError>;
