//! Shared stores between the recommender loop and the HTTP API

use anyhow::Result;
use dashmap::DashMap;
use recommender_lib::routines::StatusWriter;
use recommender_lib::{ControllerFetcher, ControllerKey, VpaId, VpaStatus};
use serde::{Deserialize, Serialize};

/// Latest published status per VPA
#[derive(Debug, Default)]
pub struct StatusStore {
    statuses: DashMap<VpaId, VpaStatus>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &VpaId) -> Option<VpaStatus> {
        self.statuses.get(id).map(|entry| entry.value().clone())
    }

    /// All statuses ordered by namespace and name
    pub fn list(&self) -> Vec<VpaStatus> {
        let mut statuses: Vec<VpaStatus> = self
            .statuses
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        statuses.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        statuses
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

impl StatusWriter for StatusStore {
    fn publish(&self, status: VpaStatus) -> Result<()> {
        let id = VpaId::new(&status.namespace, &status.name);
        self.statuses.insert(id, status);
        Ok(())
    }

    fn remove(&self, id: &VpaId) -> Result<()> {
        self.statuses.remove(id);
        Ok(())
    }
}

/// Owner of a registered controller, in the same namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerOwner {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub api_version: String,
}

/// Body of a controller registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRegistration {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub owner: Option<ControllerOwner>,
}

/// Controllers known to exist, with their owners
#[derive(Debug, Default)]
pub struct ControllerRegistry {
    controllers: DashMap<(String, String, String), ControllerRegistration>,
}

/// Owner chains longer than this are treated as cycles
const MAX_OWNER_DEPTH: usize = 16;

impl ControllerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, namespace: &str, kind: &str, name: &str, registration: ControllerRegistration) {
        self.controllers
            .insert(registry_key(namespace, kind, name), registration);
    }

    /// Returns false if the controller was not registered
    pub fn remove(&self, namespace: &str, kind: &str, name: &str) -> bool {
        self.controllers
            .remove(&registry_key(namespace, kind, name))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }
}

fn registry_key(namespace: &str, kind: &str, name: &str) -> (String, String, String) {
    (namespace.to_string(), kind.to_string(), name.to_string())
}

impl ControllerFetcher for ControllerRegistry {
    fn find_top_most_controller(&self, key: &ControllerKey) -> Option<ControllerKey> {
        let mut current = key.clone();
        let mut registration = self
            .controllers
            .get(&registry_key(&key.namespace, &key.kind, &key.name))?
            .value()
            .clone();
        current.api_version = registration.api_version.clone();

        for _ in 0..MAX_OWNER_DEPTH {
            let Some(owner) = registration.owner.clone() else {
                return Some(current);
            };
            let Some(owner_registration) = self
                .controllers
                .get(&registry_key(&current.namespace, &owner.kind, &owner.name))
                .map(|entry| entry.value().clone())
            else {
                // The owner is gone; the controller itself is the top
                return Some(current);
            };
            current = ControllerKey {
                namespace: current.namespace.clone(),
                kind: owner.kind,
                name: owner.name,
                api_version: owner_registration.api_version.clone(),
            };
            registration = owner_registration;
        }
        Some(current)
    }
}
