//! Per-task directory storage.
//!
//! `{data_dir}/{task_id}/task.json` is the authoritative record;
//! `{data_dir}/{task_id}/scan_native.nessus` is the exported scan file once it
//! exists. Every write to `task.json` is serialized by an OS-level exclusive
//! file lock covering open -> read -> validate -> write -> fsync -> close, so
//! the admin CLI and the worker can run concurrently against the same
//! directory.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Result, ScanforgeError};
use crate::model::{Task, UpdateTask};
use crate::state_machine;

const TASK_FILE: &str = "task.json";
const EXPORT_FILE: &str = "scan_native.nessus";

/// Owns the on-disk task directory tree. The worker is the only mutator of
/// `status`, timestamps, validation fields, and `nessus_scan_id`; admission
/// mutates a task exactly once, at creation.
#[derive(Clone)]
pub struct TaskStore {
    data_dir: PathBuf,
}

impl TaskStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into() }
    }

    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.data_dir.join(task_id)
    }

    pub fn task_json_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(TASK_FILE)
    }

    pub fn export_path(&self, task_id: &str) -> PathBuf {
        self.task_dir(task_id).join(EXPORT_FILE)
    }

    pub fn export_exists(&self, task_id: &str) -> bool {
        self.export_path(task_id).exists()
    }

    /// Writes a brand-new `task.json`. Called exactly once by admission.
    pub async fn create(&self, task: &Task) -> Result<()> {
        let dir = self.task_dir(&task.task_id);
        let task = task.clone();
        tokio::task::spawn_blocking(move || create_blocking(&dir, &task))
            .await
            .map_err(|e| ScanforgeError::Storage(e.to_string()))?
    }

    /// Reads `task.json` directly (used by `get_status` and the worker).
    ///
    /// Readers may race a writer; a short window of an absent or partially
    /// written file is tolerated by retrying once.
    pub async fn read(&self, task_id: &str) -> Result<Task> {
        let path = self.task_json_path(task_id);
        let once = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || read_blocking(&path))
                .await
                .map_err(|e| ScanforgeError::Storage(e.to_string()))?
        };
        match once {
            Ok(task) => Ok(task),
            Err(_) => tokio::task::spawn_blocking(move || read_blocking(&path))
                .await
                .map_err(|e| ScanforgeError::Storage(e.to_string()))?,
        }
    }

    /// Applies a partial [`UpdateTask`] under the exclusive file lock,
    /// enforcing the state machine when `update.status` is set. This is the
    /// single mutation path used after task creation.
    pub async fn update(&self, task_id: &str, update: UpdateTask) -> Result<Task> {
        let path = self.task_json_path(task_id);
        tokio::task::spawn_blocking(move || update_blocking(&path, update))
            .await
            .map_err(|e| ScanforgeError::Storage(e.to_string()))?
    }

    /// Writes the exported scan bytes to `scan_native.nessus`.
    pub async fn write_export(&self, task_id: &str, bytes: Vec<u8>) -> Result<PathBuf> {
        let path = self.export_path(task_id);
        tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .map_err(|e| ScanforgeError::Storage(e.to_string()))?;
            file.write_all(&bytes).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
            file.sync_all().map_err(|e| ScanforgeError::Storage(e.to_string()))?;
            Ok(path)
        })
        .await
        .map_err(|e| ScanforgeError::Storage(e.to_string()))?
    }

    /// Reads the exported scan bytes back from `scan_native.nessus`, for
    /// `get_results` (spec §4.1).
    pub async fn read_export(&self, task_id: &str) -> Result<Vec<u8>> {
        let path = self.export_path(task_id);
        tokio::task::spawn_blocking(move || std::fs::read(&path).map_err(|e| ScanforgeError::Storage(e.to_string())))
            .await
            .map_err(|e| ScanforgeError::Storage(e.to_string()))?
    }

    /// Lists every task directory currently on disk. Used by housekeeping
    /// and `list_tasks`.
    pub async fn list_task_ids(&self) -> Result<Vec<String>> {
        let dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut ids = Vec::new();
            for entry in std::fs::read_dir(&dir).map_err(|e| ScanforgeError::Storage(e.to_string()))? {
                let entry = entry.map_err(|e| ScanforgeError::Storage(e.to_string()))?;
                if entry.path().join(TASK_FILE).exists() {
                    if let Some(name) = entry.file_name().to_str() {
                        ids.push(name.to_string());
                    }
                }
            }
            Ok(ids)
        })
        .await
        .map_err(|e| ScanforgeError::Storage(e.to_string()))?
    }

    /// Deletes a task's entire directory. Used by housekeeping.
    pub async fn delete(&self, task_id: &str) -> Result<()> {
        let dir = self.task_dir(task_id);
        tokio::task::spawn_blocking(move || -> Result<()> {
            if dir.exists() {
                std::fs::remove_dir_all(&dir).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| ScanforgeError::Storage(e.to_string()))?
    }
}

fn create_blocking(dir: &Path, task: &Task) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
    let path = dir.join(TASK_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| ScanforgeError::Storage(e.to_string()))?;
    // Fails loudly rather than silently degrading when the lock cannot be acquired.
    file.lock_exclusive().map_err(|e| ScanforgeError::Storage(format!("lock failed: {e}")))?;
    let result = (|| {
        let json = serde_json::to_vec_pretty(task).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        file.set_len(0).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        file.write_all(&json).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        file.sync_all().map_err(|e| ScanforgeError::Storage(e.to_string()))
    })();
    FileExt::unlock(&file).ok();
    result
}

fn read_blocking(path: &Path) -> Result<Task> {
    let mut file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| ScanforgeError::Storage(e.to_string()))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
    serde_json::from_str(&contents).map_err(|e| ScanforgeError::Storage(e.to_string()))
}

fn update_blocking(path: &Path, update: UpdateTask) -> Result<Task> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| ScanforgeError::Storage(e.to_string()))?;
    file.lock_exclusive().map_err(|e| ScanforgeError::Storage(format!("lock failed: {e}")))?;

    let result = (|| -> Result<Task> {
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        let mut task: Task = serde_json::from_str(&contents).map_err(|e| ScanforgeError::Storage(e.to_string()))?;

        if let Some(new_status) = update.status {
            state_machine::validate_transition(task.status, new_status)?;
            if state_machine::is_metadata_only_update(task.status, new_status) && update.started_at.is_some() {
                return Err(ScanforgeError::InvalidArgument(
                    "metadata-only RUNNING update must not backdate started_at".to_string(),
                ));
            }
            task.status = new_status;
        }
        if let Some(v) = update.scanner_instance_id {
            task.scanner_instance_id = Some(v);
        }
        if let Some(v) = update.nessus_scan_id {
            task.nessus_scan_id = Some(v);
        }
        if let Some(v) = update.progress {
            task.progress = Some(v);
        }
        if let Some(v) = update.started_at {
            if task.started_at.is_none() {
                task.started_at = Some(v);
            }
        }
        if let Some(v) = update.completed_at {
            task.completed_at = Some(v);
        }
        if let Some(v) = update.error_message {
            task.error_message = Some(v);
        }
        if let Some(v) = update.validation_stats {
            task.validation_stats = Some(v);
        }
        if let Some(v) = update.validation_warnings {
            task.validation_warnings = v;
        }
        if let Some(v) = update.authentication_status {
            task.authentication_status = Some(v);
        }

        let json = serde_json::to_vec_pretty(&task).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        file.set_len(0).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        file.write_all(&json).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        file.sync_all().map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        Ok(task)
    })();

    FileExt::unlock(&file).ok();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScanPayload, ScanType, TaskStatus};
    use chrono::Utc;

    fn sample_task(id: &str) -> Task {
        Task::new(
            id.to_string(),
            "trace-1".to_string(),
            ScanType::Untrusted,
            "nessus".to_string(),
            "nessus".to_string(),
            ScanPayload {
                targets: "10.0.0.1".to_string(),
                name: "t1".to_string(),
                description: None,
                credentials: None,
                schema_profile: None,
                custom_fields: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn create_then_read_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());
        let task = sample_task("task-1");
        store.create(&task).await.unwrap();

        let read = store.read("task-1").await.unwrap();
        assert_eq!(read.task_id, "task-1");
        assert_eq!(read.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn update_enforces_state_machine() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());
        store.create(&sample_task("task-2")).await.unwrap();

        let to_completed = UpdateTask {
            status: Some(TaskStatus::Completed),
            ..Default::default()
        };
        let err = store.update("task-2", to_completed).await.unwrap_err();
        assert!(matches!(err, ScanforgeError::StateTransition { .. }));

        let to_running = UpdateTask {
            status: Some(TaskStatus::Running),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        let task = store.update("task-2", to_running).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn metadata_only_running_update_does_not_backdate_started_at() {
        let tmp = tempfile::tempdir().unwrap();
        let store = TaskStore::new(tmp.path());
        store.create(&sample_task("task-3")).await.unwrap();
        store
            .update(
                "task-3",
                UpdateTask {
                    status: Some(TaskStatus::Running),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = store.read("task-3").await.unwrap().started_at.unwrap();

        store
            .update(
                "task-3",
                UpdateTask {
                    status: Some(TaskStatus::Running),
                    progress: Some(42),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let after = store.read("task-3").await.unwrap();
        assert_eq!(after.started_at.unwrap(), first);
        assert_eq!(after.progress, Some(42));
    }
}
