//! Durable record of completed stages for one cluster.
//!
//! One TOML file per installation. Every mutation rewrites the file through
//! a temporary sibling, fsyncs it and renames it into place, so a reader
//! after a crash sees exactly the writes that returned.

use crate::request::InstallRequest;
use crate::stage::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Current on-disk format version.
pub const STATE_FILE_VERSION: u32 = 1;
/// Marker set once every stage of `create` completed.
pub const INSTALL_COMPLETE_MARKER: &str = "cluster-install-complete";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("{path:?} belongs to cluster '{found}', not '{expected}'")]
    ClusterMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("checkpoint for stage '{0}' already recorded")]
    AlreadyRecorded(String),

    #[error("failed to encode checkpoint file: {0}")]
    Encode(String),
}

/// A completed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Checkpoint {
    pub fn now(metadata: BTreeMap<String, String>) -> Self {
        Self {
            completed_at: Utc::now(),
            metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    cluster_name: String,
    #[serde(default)]
    markers: BTreeMap<String, bool>,
    #[serde(default)]
    checks: BTreeMap<String, Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flags: Option<InstallRequest>,
}

impl StateFile {
    fn empty(cluster_name: &str) -> Self {
        Self {
            version: STATE_FILE_VERSION,
            cluster_name: cluster_name.to_string(),
            markers: BTreeMap::new(),
            checks: BTreeMap::new(),
            flags: None,
        }
    }
}

/// Checkpoint store backed by `<cluster-dir>/k1-state.toml`.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    state: StateFile,
}

impl CheckpointStore {
    /// Open the store for `cluster_name`. A missing file is an empty store;
    /// an unreadable or unparsable one is an error.
    pub fn open(path: impl Into<PathBuf>, cluster_name: &str) -> Result<Self, CheckpointError> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(content) => {
                let state: StateFile =
                    toml::from_str(&content).map_err(|e| CheckpointError::Corrupt {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                if state.version != STATE_FILE_VERSION {
                    return Err(CheckpointError::Corrupt {
                        path,
                        reason: format!(
                            "unsupported version {} (expected {})",
                            state.version, STATE_FILE_VERSION
                        ),
                    });
                }
                if state.cluster_name != cluster_name {
                    return Err(CheckpointError::ClusterMismatch {
                        path,
                        expected: cluster_name.to_string(),
                        found: state.cluster_name,
                    });
                }
                tracing::debug!(
                    "[CheckpointStore] Loaded {} checkpoints from {:?}",
                    state.checks.len(),
                    path
                );
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateFile::empty(cluster_name),
            Err(source) => return Err(CheckpointError::Read { path, source }),
        };
        Ok(Self { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cluster_name(&self) -> &str {
        &self.state.cluster_name
    }

    /// Look up a dot-separated key: `checks.<stage-id>` or `markers.<name>`.
    pub fn get(&self, key: &str) -> Option<String> {
        let (section, name) = key.split_once('.')?;
        match section {
            "checks" => self
                .state
                .checks
                .get(name)
                .map(|c| c.completed_at.to_rfc3339()),
            "markers" => self.state.markers.get(name).map(|m| m.to_string()),
            _ => None,
        }
    }

    pub fn checkpoint(&self, stage: StageId) -> Option<&Checkpoint> {
        self.state.checks.get(stage.as_str())
    }

    pub fn is_checkpointed(&self, stage: StageId) -> bool {
        self.state.checks.contains_key(stage.as_str())
    }

    /// All checkpoints keyed by stage id.
    pub fn checks(&self) -> &BTreeMap<String, Checkpoint> {
        &self.state.checks
    }

    /// Record a completed stage. Durable before returning.
    pub fn set(&mut self, stage: StageId, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        if self.state.checks.contains_key(stage.as_str()) {
            return Err(CheckpointError::AlreadyRecorded(stage.to_string()));
        }
        self.state
            .checks
            .insert(stage.as_str().to_string(), checkpoint);
        if let Err(e) = self.flush() {
            self.state.checks.remove(stage.as_str());
            return Err(e);
        }
        tracing::debug!("[CheckpointStore] Recorded checks.{}", stage);
        Ok(())
    }

    pub fn has_marker(&self, name: &str) -> bool {
        self.state.markers.get(name).copied().unwrap_or(false)
    }

    pub fn set_marker(&mut self, name: &str) -> Result<(), CheckpointError> {
        self.state.markers.insert(name.to_string(), true);
        self.flush()
    }

    /// The request recorded by the last `create`.
    pub fn flags(&self) -> Option<&InstallRequest> {
        self.state.flags.as_ref()
    }

    pub fn save_flags(&mut self, request: &InstallRequest) -> Result<(), CheckpointError> {
        if self.state.flags.as_ref() == Some(request) {
            return Ok(());
        }
        self.state.flags = Some(request.clone());
        self.flush()
    }

    /// Drop the checkpoint of a reverted stage so a later destroy skips it.
    pub fn remove(&mut self, stage: StageId) -> Result<(), CheckpointError> {
        if self.state.checks.remove(stage.as_str()).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    /// Forget everything and delete the file.
    pub fn clear_all(&mut self) -> Result<(), CheckpointError> {
        self.state = StateFile::empty(&self.state.cluster_name);
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CheckpointError::Write {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        tracing::info!("[CheckpointStore] Cleared {:?}", self.path);
        Ok(())
    }

    /// Write the whole state: temp file, fsync, rename, fsync directory.
    pub fn flush(&self) -> Result<(), CheckpointError> {
        let content = toml::to_string_pretty(&self.state)
            .map_err(|e| CheckpointError::Encode(e.to_string()))?;
        let write_err = |source| CheckpointError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(write_err)?;
            file.write_all(content.as_bytes()).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(write_err)?;

        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
                tracing::warn!("[CheckpointStore] Failed to sync {:?}: {}", parent, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("k1-state.toml"), "kfirst").unwrap();
        assert!(store.checks().is_empty());
        assert!(!store.has_marker(INSTALL_COMPLETE_MARKER));
    }

    #[test]
    fn test_set_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k1-state.toml");
        let mut store = CheckpointStore::open(&path, "kfirst").unwrap();
        store
            .set(
                StageId::STATE_STORE_CREATE,
                Checkpoint::now(meta(&[("bucket", "k1-state-store-abc")])),
            )
            .unwrap();

        let reopened = CheckpointStore::open(&path, "kfirst").unwrap();
        let checkpoint = reopened.checkpoint(StageId::STATE_STORE_CREATE).unwrap();
        assert_eq!(checkpoint.metadata["bucket"], "k1-state-store-abc");
        assert!(reopened.get("checks.state-store-create").is_some());
        assert!(reopened.get("checks.vault-ready").is_none());
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn test_checkpoints_are_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::open(dir.path().join("s.toml"), "kfirst").unwrap();
        store
            .set(StageId::VALIDATE_FLAGS, Checkpoint::now(BTreeMap::new()))
            .unwrap();
        let again = store.set(StageId::VALIDATE_FLAGS, Checkpoint::now(BTreeMap::new()));
        assert!(matches!(again, Err(CheckpointError::AlreadyRecorded(_))));
    }

    #[test]
    fn test_corrupt_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k1-state.toml");
        std::fs::write(&path, "version = [not toml").unwrap();
        let err = CheckpointStore::open(&path, "kfirst").unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[test]
    fn test_cluster_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k1-state.toml");
        let mut store = CheckpointStore::open(&path, "one").unwrap();
        store.set_marker(INSTALL_COMPLETE_MARKER).unwrap();
        let err = CheckpointStore::open(&path, "two").unwrap_err();
        assert!(matches!(err, CheckpointError::ClusterMismatch { .. }));
    }

    #[test]
    fn test_clear_all_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k1-state.toml");
        let mut store = CheckpointStore::open(&path, "kfirst").unwrap();
        store.set_marker(INSTALL_COMPLETE_MARKER).unwrap();
        assert!(path.exists());
        store.clear_all().unwrap();
        assert!(!path.exists());
        assert!(!store.has_marker(INSTALL_COMPLETE_MARKER));
    }
}
