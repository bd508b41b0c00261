//! Housekeeping (spec §4.12, C13): periodic TTL expiry and stale-RUNNING
//! detection.
//!
//! Runs on the same `task.json` mutation path as everything else (the file
//! lock and state machine in `TaskStore::update`), so it can never race the
//! worker into an illegal transition — a task that the worker has already
//! moved to a terminal state while a housekeeping pass was mid-flight simply
//! has its stale-RUNNING update rejected by the state machine and is
//! skipped for this pass.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scanforge_core::error::Result;
use scanforge_core::model::{Task, TaskStatus, UpdateTask};
use scanforge_core::task_store::TaskStore;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct HousekeepingOptions {
    pub completed_ttl: Duration,
    pub failed_ttl: Duration,
    pub stale_running_threshold: Duration,
    pub sweep_interval: Duration,
}

pub struct Housekeeper {
    task_store: TaskStore,
    registry: Arc<Registry>,
    options: HousekeepingOptions,
    metrics: Arc<Metrics>,
}

impl Housekeeper {
    pub fn new(task_store: TaskStore, registry: Arc<Registry>, options: HousekeepingOptions, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self { task_store, registry, options, metrics })
    }

    /// Runs `sweep` on `options.sweep_interval` until `cancel` is signalled.
    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "housekeeping sweep failed");
                    }
                }
            }
        }
    }

    /// One full pass over every task directory: marks stale RUNNING tasks as
    /// TIMEOUT, then deletes terminal tasks past their TTL.
    pub async fn sweep(&self) -> Result<()> {
        let task_ids = self.task_store.list_task_ids().await?;
        let now = Utc::now();
        let mut stale_marked = 0usize;
        let mut deleted = 0usize;

        for task_id in task_ids {
            let task = match self.task_store.read(&task_id).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "skipping unreadable task during housekeeping");
                    continue;
                }
            };

            if task.status == TaskStatus::Running {
                if self.is_stale(&task, now) {
                    self.mark_stale(&task_id, &task).await;
                    stale_marked += 1;
                }
                continue;
            }

            if task.status.is_terminal() && self.past_ttl(&task, now) {
                if let Err(e) = self.task_store.delete(&task_id).await {
                    warn!(task_id = %task_id, error = %e, "failed to delete expired task directory");
                    continue;
                }
                self.metrics.ttl_deletions_total.inc();
                deleted += 1;
            }
        }

        if stale_marked > 0 || deleted > 0 {
            info!(stale_marked, deleted, "housekeeping sweep complete");
        }
        Ok(())
    }

    fn is_stale(&self, task: &Task, now: chrono::DateTime<Utc>) -> bool {
        let Some(started_at) = task.started_at else { return false };
        let age = now.signed_duration_since(started_at).to_std().unwrap_or_default();
        age >= self.options.stale_running_threshold
    }

    fn past_ttl(&self, task: &Task, now: chrono::DateTime<Utc>) -> bool {
        let Some(completed_at) = task.completed_at else { return false };
        let age = now.signed_duration_since(completed_at).to_std().unwrap_or_default();
        let ttl = match task.status {
            TaskStatus::Completed => self.options.completed_ttl,
            TaskStatus::Failed | TaskStatus::Timeout => self.options.failed_ttl,
            _ => return false,
        };
        age >= ttl
    }

    /// Best-effort remote stop/delete against the task's scanner instance,
    /// then transitions RUNNING -> TIMEOUT. The remote call failing never
    /// blocks the local transition: an orphaned scan on the vendor side is a
    /// vendor-side cleanup problem, not a reason to leave the task stuck.
    async fn mark_stale(&self, task_id: &str, task: &Task) {
        if let (Some(instance_id), Some(scan_id)) = (&task.scanner_instance_id, &task.nessus_scan_id) {
            if let Some(adapter) = self.registry.adapter_by_instance_id(instance_id) {
                let _ = adapter.stop_scan(scan_id).await;
                let _ = adapter.delete_scan(scan_id).await;
                adapter.close().await;
            }
        }

        let update = UpdateTask {
            status: Some(TaskStatus::Timeout),
            error_message: Some("stale".to_string()),
            completed_at: Some(Utc::now()),
            ..Default::default()
        };
        match self.task_store.update(task_id, update).await {
            Ok(_) => {
                self.metrics.scans_total.with_label_values(&[scan_type_label(task), "timeout"]).inc();
            }
            Err(e) => {
                // The worker beat housekeeping to a terminal transition in
                // the time between `read` and `update`; nothing to do.
                warn!(task_id = %task_id, error = %e, "stale transition rejected, task already moved on");
            }
        }
    }
}

fn scan_type_label(task: &Task) -> &'static str {
    match task.scan_type {
        scanforge_core::model::ScanType::Untrusted => "untrusted",
        scanforge_core::model::ScanType::Authenticated => "authenticated",
        scanforge_core::model::ScanType::AuthenticatedPrivileged => "authenticated_privileged",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerOptions;
    use scanforge_core::model::{ScanPayload, ScanType, ScannerConfig};

    fn empty_registry() -> Arc<Registry> {
        Registry::from_config(&ScannerConfig::default(), BreakerOptions::default()).unwrap()
    }

    fn sample_task(task_id: &str) -> Task {
        Task::new(
            task_id.to_string(),
            "trace-1".to_string(),
            ScanType::Untrusted,
            "nessus".to_string(),
            "nessus".to_string(),
            ScanPayload {
                targets: "10.0.0.1".to_string(),
                name: "t".to_string(),
                description: None,
                credentials: None,
                schema_profile: None,
                custom_fields: None,
            },
            Utc::now(),
        )
    }

    fn options() -> HousekeepingOptions {
        HousekeepingOptions {
            completed_ttl: Duration::from_secs(3600),
            failed_ttl: Duration::from_secs(7200),
            stale_running_threshold: Duration::from_millis(20),
            sweep_interval: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn stale_running_task_is_marked_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let task_store = TaskStore::new(tmp.path());
        task_store.create(&sample_task("t1")).await.unwrap();
        task_store
            .update("t1", UpdateTask { status: Some(TaskStatus::Running), started_at: Some(Utc::now()), ..Default::default() })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        let housekeeper = Housekeeper::new(task_store.clone(), empty_registry(), options(), Metrics::new().unwrap());
        housekeeper.sweep().await.unwrap();

        let task = task_store.read("t1").await.unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
        assert_eq!(task.error_message.as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn expired_completed_task_directory_is_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        let task_store = TaskStore::new(tmp.path());
        task_store.create(&sample_task("t2")).await.unwrap();
        task_store
            .update("t2", UpdateTask { status: Some(TaskStatus::Running), started_at: Some(Utc::now()), ..Default::default() })
            .await
            .unwrap();
        task_store
            .update(
                "t2",
                UpdateTask {
                    status: Some(TaskStatus::Completed),
                    completed_at: Some(Utc::now() - chrono::Duration::seconds(7200)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut opts = options();
        opts.completed_ttl = Duration::from_secs(1);
        let housekeeper = Housekeeper::new(task_store.clone(), empty_registry(), opts, Metrics::new().unwrap());
        housekeeper.sweep().await.unwrap();

        assert!(task_store.read("t2").await.is_err());
    }

    #[tokio::test]
    async fn fresh_running_task_is_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let task_store = TaskStore::new(tmp.path());
        task_store.create(&sample_task("t3")).await.unwrap();
        task_store
            .update("t3", UpdateTask { status: Some(TaskStatus::Running), started_at: Some(Utc::now()), ..Default::default() })
            .await
            .unwrap();

        let mut opts = options();
        opts.stale_running_threshold = Duration::from_secs(3600);
        let housekeeper = Housekeeper::new(task_store.clone(), empty_registry(), opts, Metrics::new().unwrap());
        housekeeper.sweep().await.unwrap();

        let task = task_store.read("t3").await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }
}
