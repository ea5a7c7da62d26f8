//! Checkpoint record format
//!
//! One record per (VPA, container name). Bucket indices in the embedded
//! histograms are only meaningful for the layout they were written with, so
//! any layout change has to bump `CHECKPOINT_VERSION`.

use crate::histogram::HistogramCheckpoint;
use crate::models::VpaId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CHECKPOINT_VERSION: &str = "v3";

/// Saved state of one aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStatus {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_sample_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sample_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_samples_count: u64,
    pub cpu_histogram: HistogramCheckpoint,
    pub memory_histogram: HistogramCheckpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaCheckpoint {
    pub namespace: String,
    pub vpa_name: String,
    pub container_name: String,
    pub status: CheckpointStatus,
}

impl VpaCheckpoint {
    pub fn vpa_id(&self) -> VpaId {
        VpaId::new(&self.namespace, &self.vpa_name)
    }

    /// Object name, `<vpa>-<container>`
    pub fn name(&self) -> String {
        checkpoint_name(&self.vpa_name, &self.container_name)
    }
}

pub fn checkpoint_name(vpa_name: &str, container_name: &str) -> String {
    format!("{vpa_name}-{container_name}")
}
