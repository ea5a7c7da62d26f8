//! Persisted form of a histogram

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weight given to the heaviest bucket when a histogram is saved
pub const MAX_CHECKPOINT_WEIGHT: u32 = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramCheckpoint {
    /// Decay reference point; only set for decaying histograms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_timestamp: Option<DateTime<Utc>>,
    pub total_weight: f64,
    /// Bucket index to normalised weight. Indices are signed so that corrupt
    /// records can be detected instead of failing to parse.
    #[serde(default)]
    pub bucket_weights: BTreeMap<i64, u32>,
}
