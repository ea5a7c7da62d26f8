//! Checkpoint persistence
//!
//! `FileCheckpointStore` keeps one JSON document per checkpoint in a
//! directory and replaces files atomically through a temp file.
//! `InMemoryCheckpointStore` backs tests and runs without a directory.

use super::record::{checkpoint_name, VpaCheckpoint};
use crate::models::VpaId;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const CHECKPOINT_EXTENSION: &str = "json";

pub trait CheckpointStore: Send + Sync {
    /// All readable checkpoints. Unreadable records are skipped.
    fn list(&self) -> Result<Vec<VpaCheckpoint>>;

    /// Create or replace the checkpoint for its (VPA, container)
    fn save(&self, checkpoint: &VpaCheckpoint) -> Result<()>;

    /// Delete a checkpoint. Deleting a missing one is not an error.
    fn delete(&self, vpa: &VpaId, container_name: &str) -> Result<()>;
}

pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint directory {:?}", dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, vpa: &VpaId, container_name: &str) -> PathBuf {
        let name = checkpoint_name(&vpa.vpa_name, container_name);
        self.dir
            .join(format!("{}_{}.{}", vpa.namespace, name, CHECKPOINT_EXTENSION))
    }

    fn read(path: &Path) -> Result<VpaCheckpoint> {
        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read checkpoint {:?}", path))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse checkpoint {:?}", path))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn list(&self) -> Result<Vec<VpaCheckpoint>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list checkpoint directory {:?}", self.dir))?;

        let mut checkpoints = Vec::new();
        for entry in entries {
            let path = entry.context("Failed to read directory entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXTENSION) {
                continue;
            }
            match Self::read(&path) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        checkpoints.sort_by(|a, b| {
            (&a.namespace, &a.vpa_name, &a.container_name)
                .cmp(&(&b.namespace, &b.vpa_name, &b.container_name))
        });
        Ok(checkpoints)
    }

    fn save(&self, checkpoint: &VpaCheckpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.vpa_id(), &checkpoint.container_name);
        let json = serde_json::to_vec_pretty(checkpoint).context("Failed to serialize checkpoint")?;

        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
        file.write_all(&json).context("Failed to write checkpoint")?;
        file.sync_all().context("Failed to sync checkpoint file")?;

        std::fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;
        debug!(path = %path.display(), "Checkpoint saved");
        Ok(())
    }

    fn delete(&self, vpa: &VpaId, container_name: &str) -> Result<()> {
        let path = self.path_for(vpa, container_name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete checkpoint {:?}", path)),
        }
    }
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    records: Mutex<BTreeMap<(VpaId, String), VpaCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(VpaId, String), VpaCheckpoint>>> {
        self.records
            .lock()
            .map_err(|_| anyhow!("checkpoint store lock poisoned"))
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn list(&self) -> Result<Vec<VpaCheckpoint>> {
        Ok(self.records()?.values().cloned().collect())
    }

    fn save(&self, checkpoint: &VpaCheckpoint) -> Result<()> {
        self.records()?.insert(
            (checkpoint.vpa_id(), checkpoint.container_name.clone()),
            checkpoint.clone(),
        );
        Ok(())
    }

    fn delete(&self, vpa: &VpaId, container_name: &str) -> Result<()> {
        self.records()?
            .remove(&(vpa.clone(), container_name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStatus, CHECKPOINT_VERSION};
    use crate::histogram::HistogramCheckpoint;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn checkpoint(vpa: &str, container: &str, samples: u64) -> VpaCheckpoint {
        VpaCheckpoint {
            namespace: "default".to_string(),
            vpa_name: vpa.to_string(),
            container_name: container.to_string(),
            status: CheckpointStatus {
                version: CHECKPOINT_VERSION.to_string(),
                last_update_time: Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
                first_sample_start: None,
                last_sample_start: None,
                total_samples_count: samples,
                cpu_histogram: HistogramCheckpoint::default(),
                memory_histogram: HistogramCheckpoint::default(),
            },
        }
    }

    #[test]
    fn test_file_store_save_and_list() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();

        store.save(&checkpoint("web", "app", 3)).unwrap();
        store.save(&checkpoint("web", "sidecar", 1)).unwrap();
        store.save(&checkpoint("web", "app", 7)).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].container_name, "app");
        assert_eq!(listed[0].status.total_samples_count, 7);
        assert!(!dir.path().join("default_web-app.tmp").exists());
    }

    #[test]
    fn test_file_store_skips_unreadable_records() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        store.save(&checkpoint("web", "app", 3)).unwrap();
        std::fs::write(dir.path().join("default_broken-app.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].vpa_name, "web");
    }

    #[test]
    fn test_file_store_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path()).unwrap();
        let vpa = VpaId::new("default", "web");
        store.save(&checkpoint("web", "app", 3)).unwrap();

        store.delete(&vpa, "app").unwrap();
        assert!(store.list().unwrap().is_empty());
        // Already gone
        store.delete(&vpa, "app").unwrap();
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        FileCheckpointStore::new(dir.path())
            .unwrap()
            .save(&checkpoint("web", "app", 5))
            .unwrap();

        let reopened = FileCheckpointStore::new(dir.path()).unwrap();
        assert_eq!(reopened.list().unwrap(), vec![checkpoint("web", "app", 5)]);
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryCheckpointStore::new();
        store.save(&checkpoint("web", "app", 1)).unwrap();
        store.save(&checkpoint("db", "app", 2)).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);

        store.delete(&VpaId::new("default", "db"), "app").unwrap();
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].vpa_name, "web");
    }
}
