//! C6 — Resumable-transfer checkpoint persistence.
//!
//! A checkpoint records per-file transfer progress for one export job so a
//! crashed or cancelled run can resume instead of restarting every file.
//! Saves are atomic (write-temp, rename) with a `.backup` copy kept from the
//! prior save, and a corrupted primary file falls back to the backup before
//! giving up and starting fresh.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint at {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
}

/// Progress for a single file within the job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileProgress {
    pub file_name: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub completed: bool,
}

impl FileProgress {
    pub fn is_resumable(&self) -> bool {
        !self.completed && self.bytes_transferred > 0 && self.bytes_transferred < self.total_bytes
    }
}

/// Persisted state for one export job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub job_id: String,
    pub vm_path: String,
    pub provider: String,
    pub format: String,
    pub output_dir: PathBuf,
    pub lease_id: Option<String>,
    pub files: HashMap<String, FileProgress>,
}

const SCHEMA_VERSION: u32 = 1;

impl Checkpoint {
    pub fn new(
        job_id: impl Into<String>,
        vm_path: impl Into<String>,
        provider: impl Into<String>,
        format: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            job_id: job_id.into(),
            vm_path: vm_path.into(),
            provider: provider.into(),
            format: format.into(),
            output_dir: output_dir.into(),
            lease_id: None,
            files: HashMap::new(),
        }
    }

    pub fn record_progress(&mut self, file_name: &str, bytes_transferred: u64, total_bytes: u64) {
        let entry = self
            .files
            .entry(file_name.to_string())
            .or_insert_with(|| FileProgress {
                file_name: file_name.to_string(),
                bytes_transferred: 0,
                total_bytes,
                completed: false,
            });
        entry.bytes_transferred = bytes_transferred;
        entry.total_bytes = total_bytes;
        entry.completed = bytes_transferred >= total_bytes;
    }

    pub fn mark_complete(&mut self, file_name: &str) {
        if let Some(entry) = self.files.get_mut(file_name) {
            entry.completed = true;
            entry.bytes_transferred = entry.total_bytes;
        }
    }

    pub fn all_complete(&self) -> bool {
        !self.files.is_empty() && self.files.values().all(|f| f.completed)
    }

    pub fn resume_offset(&self, file_name: &str) -> u64 {
        self.files
            .get(file_name)
            .filter(|f| f.is_resumable())
            .map(|f| f.bytes_transferred)
            .unwrap_or(0)
    }

    /// Human-readable summary: `"N/M files, B bytes"`, `N` completed files
    /// out of `M` tracked, `B` bytes transferred across all of them.
    pub fn get_progress(&self) -> String {
        let total_files = self.files.len();
        let completed_files = self.files.values().filter(|f| f.completed).count();
        let bytes: u64 = self.files.values().map(|f| f.bytes_transferred).sum();
        format!("{completed_files}/{total_files} files, {bytes} bytes")
    }
}

/// Loads, saves, and recovers a checkpoint file at a fixed path.
pub struct CheckpointStore {
    path: PathBuf,
    enabled: bool,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            enabled: true,
        }
    }

    /// A store that never touches disk — `save`/`delete` are no-ops and
    /// `load_with_recovery` always returns `None`. Used when the job disables
    /// checkpointing entirely (`ExportOptions::enable_checkpoints = false`).
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            enabled: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn backup_path(&self) -> PathBuf {
        self.path.with_extension("json.backup")
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    fn load_from(path: &Path) -> Result<Checkpoint, CheckpointError> {
        let content = std::fs::read_to_string(path).map_err(|e| CheckpointError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn load(&self) -> Result<Checkpoint, CheckpointError> {
        Self::load_from(&self.path)
    }

    /// Loads the checkpoint, recovering from the backup copy if the primary
    /// is corrupt, and returning `None` (not an error) if neither exists or
    /// both are unreadable — the caller starts a fresh job in that case.
    pub fn load_with_recovery(&self) -> Option<Checkpoint> {
        if !self.enabled {
            return None;
        }
        if self.path.exists() {
            match Self::load_from(&self.path) {
                Ok(checkpoint) => return Some(checkpoint),
                Err(CheckpointError::Corrupt { message, .. }) => {
                    warn!(path = ?self.path, message, "checkpoint corrupt, trying backup");
                }
                Err(err) => {
                    warn!(path = ?self.path, %err, "checkpoint unreadable, trying backup");
                }
            }
        }

        let backup = self.backup_path();
        if backup.exists() {
            match Self::load_from(&backup) {
                Ok(checkpoint) => {
                    warn!(path = ?backup, "recovered checkpoint from backup");
                    return Some(checkpoint);
                }
                Err(err) => {
                    warn!(path = ?backup, %err, "backup also unreadable, starting fresh");
                }
            }
        }

        None
    }

    /// Atomically persist `checkpoint`: back up the existing primary (best
    /// effort), write to a temp file, then rename over the primary.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if !self.enabled {
            return Ok(());
        }
        if self.path.exists() {
            if let Err(err) = std::fs::copy(&self.path, self.backup_path()) {
                warn!(path = ?self.path, %err, "failed to back up checkpoint before save");
            }
        }

        let temp = self.temp_path();
        let content = serde_json::to_string_pretty(checkpoint).map_err(|e| {
            CheckpointError::Corrupt {
                path: self.path.clone(),
                message: e.to_string(),
            }
        })?;
        std::fs::write(&temp, content).map_err(|e| CheckpointError::Io {
            path: temp.clone(),
            source: e,
        })?;
        std::fs::rename(&temp, &self.path).map_err(|e| CheckpointError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(())
    }

    /// Remove the checkpoint and its backup after a successful export.
    pub fn delete(&self) -> Result<(), CheckpointError> {
        if !self.enabled {
            return Ok(());
        }
        for path in [&self.path, &self.backup_path()] {
            if path.exists() {
                std::fs::remove_file(path).map_err(|e| CheckpointError::Io {
                    path: path.clone(),
                    source: e,
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        let mut checkpoint = Checkpoint::new("job-1", "/dc/vm/demo", "vms", "ovf", "/tmp/out");
        checkpoint.record_progress("disk-0.vmdk", 512, 1024);
        store.save(&checkpoint).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn recovers_from_backup_when_primary_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let store = CheckpointStore::new(&path);
        let mut checkpoint = Checkpoint::new("job-1", "/dc/vm/demo", "vms", "ovf", "/tmp/out");
        checkpoint.record_progress("disk-0.vmdk", 1024, 1024);
        store.save(&checkpoint).unwrap();

        // A second, successful save leaves the first snapshot as the backup.
        checkpoint.record_progress("disk-1.vmdk", 256, 1024);
        store.save(&checkpoint).unwrap();

        std::fs::write(&path, "{not valid json").unwrap();

        let recovered = store.load_with_recovery().unwrap();
        assert!(recovered.files.contains_key("disk-0.vmdk"));
    }

    #[test]
    fn missing_checkpoint_recovers_to_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        assert!(store.load_with_recovery().is_none());
    }

    #[test]
    fn resume_offset_tracks_partial_progress() {
        let mut checkpoint = Checkpoint::new("job-1", "/dc/vm/demo", "vms", "ovf", "/tmp/out");
        checkpoint.record_progress("disk-0.vmdk", 512, 1024);
        assert_eq!(checkpoint.resume_offset("disk-0.vmdk"), 512);
        checkpoint.mark_complete("disk-0.vmdk");
        assert_eq!(checkpoint.resume_offset("disk-0.vmdk"), 0);
    }

    #[test]
    fn all_complete_requires_nonempty_and_all_done() {
        let mut checkpoint = Checkpoint::new("job-1", "/dc/vm/demo", "vms", "ovf", "/tmp/out");
        assert!(!checkpoint.all_complete());
        checkpoint.record_progress("disk-0.vmdk", 1024, 1024);
        assert!(checkpoint.all_complete());
    }

    #[test]
    fn delete_removes_primary_and_backup() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        let checkpoint = Checkpoint::new("job-1", "/dc/vm/demo", "vms", "ovf", "/tmp/out");
        store.save(&checkpoint).unwrap();
        store.save(&checkpoint).unwrap();
        store.delete().unwrap();
        assert!(!store.path().exists());
        assert!(!store.backup_path().exists());
    }

    #[test]
    fn disabled_store_never_touches_disk() {
        let store = CheckpointStore::disabled();
        let checkpoint = Checkpoint::new("job-1", "/dc/vm/demo", "vms", "ovf", "/tmp/out");
        store.save(&checkpoint).unwrap();
        assert!(store.load_with_recovery().is_none());
        store.delete().unwrap();
    }

    #[test]
    fn get_progress_formats_n_of_m_files_and_bytes() {
        let mut checkpoint = Checkpoint::new("job-1", "/dc/vm/demo", "vms", "ovf", "/tmp/out");
        assert_eq!(checkpoint.get_progress(), "0/0 files, 0 bytes");
        checkpoint.record_progress("disk-0.vmdk", 512, 1024);
        checkpoint.record_progress("disk-1.vmdk", 1024, 1024);
        checkpoint.mark_complete("disk-1.vmdk");
        assert_eq!(checkpoint.get_progress(), "1/2 files, 1536 bytes");
    }
}
