//! Workload controller lookup

use serde::{Deserialize, Serialize};

/// Identifies a workload controller (Deployment, StatefulSet, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerKey {
    pub namespace: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub api_version: String,
}

/// Resolves a controller to the top-most controller owning it, if the
/// controller still exists
pub trait ControllerFetcher: Send + Sync {
    fn find_top_most_controller(&self, key: &ControllerKey) -> Option<ControllerKey>;
}

/// Fetcher for setups without controller information: nothing resolves
#[derive(Debug, Default, Clone, Copy)]
pub struct NoControllers;

impl ControllerFetcher for NoControllers {
    fn find_top_most_controller(&self, _key: &ControllerKey) -> Option<ControllerKey> {
        None
    }
}
