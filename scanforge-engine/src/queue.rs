//! Pool-partitioned FIFO queues plus per-pool dead-letter queue.
//!
//! Two KV structures per pool:
//! - `{pool}:queue` — a list; producers `LPUSH`, the worker `BRPOP`s (or the
//!   multi-list variant to await several pools at once).
//! - `{pool}:queue:dead` — a sorted set scored by Unix timestamp; members are
//!   queue entries augmented with `error` and `failed_at`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scanforge_core::error::{Result, ScanforgeError};
use scanforge_core::kv::KvStore;
use scanforge_core::model::QueueEntry;

fn queue_key(pool: &str) -> String {
    format!("{pool}:queue")
}

fn dlq_key(pool: &str) -> String {
    format!("{pool}:queue:dead")
}

/// Owns the pool-partitioned queues. Holds no in-memory state of its own —
/// every operation is a thin, atomic KV call, so multiple server/worker
/// processes can share one queue manager safely.
#[derive(Clone)]
pub struct QueueManager {
    kv: Arc<dyn KvStore>,
}

impl QueueManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// `LPUSH` a new entry onto `{pool}:queue`, returning the resulting depth.
    pub async fn enqueue(&self, pool: &str, entry: &QueueEntry) -> Result<i64> {
        let json = serde_json::to_string(entry).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        self.kv.lpush(&queue_key(pool), &json).await
    }

    /// `BRPOP` on a single pool's queue.
    pub async fn dequeue(&self, pool: &str, timeout: Duration) -> Result<Option<QueueEntry>> {
        let keys = vec![queue_key(pool)];
        let popped = self.kv.brpop(&keys, timeout).await?;
        decode_popped(popped)
    }

    /// A single blocking multi-key pop across several pools: a round-robin of
    /// per-pool `BRPOP` calls would break fairness under load, so this issues
    /// one atomic multi-key pop instead. Returns the pool name the entry came
    /// from alongside the entry itself.
    pub async fn dequeue_any(&self, pools: &[String], timeout: Duration) -> Result<Option<(String, QueueEntry)>> {
        if pools.is_empty() {
            return Ok(None);
        }
        let keys: Vec<String> = pools.iter().map(|p| queue_key(p)).collect();
        let Some((key, raw)) = self.kv.brpop(&keys, timeout).await? else {
            return Ok(None);
        };
        let pool = key.strip_suffix(":queue").unwrap_or(&key).to_string();
        let entry: QueueEntry = serde_json::from_str(&raw).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        Ok(Some((pool, entry)))
    }

    /// Moves an entry to the dead-letter queue, always stamping `error` and
    /// `failed_at` first. This is the system's replacement for ack/nack:
    /// workers never re-queue failed entries onto the main list.
    pub async fn move_to_dlq(&self, pool: &str, mut entry: QueueEntry, error: String) -> Result<()> {
        let now = Utc::now();
        entry.error = Some(error);
        entry.failed_at = Some(now);
        let json = serde_json::to_string(&entry).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        self.kv.zadd(&dlq_key(pool), &json, now.timestamp() as f64).await
    }

    pub async fn get_depth(&self, pool: &str) -> Result<i64> {
        self.kv.llen(&queue_key(pool)).await
    }

    pub async fn get_dlq_size(&self, pool: &str) -> Result<i64> {
        self.kv.zcard(&dlq_key(pool)).await
    }

    /// Lists dead-letter entries for a pool, most recently failed first
    /// (used by the admin CLI's `list-dlq`/`inspect-dlq`).
    pub async fn list_dlq(&self, pool: &str, limit: usize) -> Result<Vec<QueueEntry>> {
        let raw = self.kv.zrange_with_scores(&dlq_key(pool), 0, -1).await?;
        let mut entries: Vec<QueueEntry> = raw
            .into_iter()
            .filter_map(|(member, _)| serde_json::from_str(&member).ok())
            .collect();
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }

    /// Moves a DLQ entry for `task_id` back onto `{pool}:queue`, clearing
    /// `error`/`failed_at`.
    pub async fn retry_from_dlq(&self, pool: &str, task_id: &str) -> Result<bool> {
        let raw = self.kv.zrange_with_scores(&dlq_key(pool), 0, -1).await?;
        for (member, _) in raw {
            let Ok(mut entry) = serde_json::from_str::<QueueEntry>(&member) else {
                continue;
            };
            if entry.task_id == task_id {
                self.kv.zrem(&dlq_key(pool), &member).await?;
                entry.error = None;
                entry.failed_at = None;
                self.enqueue(pool, &entry).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Removes every entry from a pool's DLQ.
    pub async fn purge_dlq(&self, pool: &str) -> Result<usize> {
        let raw = self.kv.zrange_with_scores(&dlq_key(pool), 0, -1).await?;
        let count = raw.len();
        for (member, _) in raw {
            self.kv.zrem(&dlq_key(pool), &member).await?;
        }
        Ok(count)
    }
}

fn decode_popped(popped: Option<(String, String)>) -> Result<Option<QueueEntry>> {
    match popped {
        None => Ok(None),
        Some((_, raw)) => {
            let entry = serde_json::from_str(&raw).map_err(|e| ScanforgeError::Storage(e.to_string()))?;
            Ok(Some(entry))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanforge_core::kv::MemoryKvStore;
    use scanforge_core::model::{ScanPayload, ScanType};

    fn sample_entry(task_id: &str) -> QueueEntry {
        QueueEntry {
            task_id: task_id.to_string(),
            trace_id: "trace".to_string(),
            scanner_pool: "nessus".to_string(),
            scan_type: ScanType::Untrusted,
            scanner_instance_id: None,
            payload: ScanPayload {
                targets: "10.0.0.1".to_string(),
                name: "n".to_string(),
                description: None,
                credentials: None,
                schema_profile: None,
                custom_fields: None,
            },
            error: None,
            failed_at: None,
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_preserves_fifo_order() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let qm = QueueManager::new(kv);
        qm.enqueue("nessus", &sample_entry("t1")).await.unwrap();
        qm.enqueue("nessus", &sample_entry("t2")).await.unwrap();

        let first = qm.dequeue("nessus", Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(first.task_id, "t1");
        let second = qm.dequeue("nessus", Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(second.task_id, "t2");
    }

    #[tokio::test]
    async fn dequeue_any_spans_multiple_pools() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let qm = QueueManager::new(kv);
        qm.enqueue("nessus_dmz", &sample_entry("dmz-1")).await.unwrap();

        let (pool, entry) = qm
            .dequeue_any(&["nessus".to_string(), "nessus_dmz".to_string()], Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool, "nessus_dmz");
        assert_eq!(entry.task_id, "dmz-1");
    }

    #[tokio::test]
    async fn move_to_dlq_stamps_error_and_failed_at() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let qm = QueueManager::new(kv);
        qm.move_to_dlq("nessus", sample_entry("t1"), "boom".to_string()).await.unwrap();

        assert_eq!(qm.get_dlq_size("nessus").await.unwrap(), 1);
        let entries = qm.list_dlq("nessus", 10).await.unwrap();
        assert_eq!(entries[0].error.as_deref(), Some("boom"));
        assert!(entries[0].failed_at.is_some());
    }

    #[tokio::test]
    async fn retry_from_dlq_clears_error_and_requeues() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let qm = QueueManager::new(kv);
        qm.move_to_dlq("nessus", sample_entry("t1"), "boom".to_string()).await.unwrap();

        let retried = qm.retry_from_dlq("nessus", "t1").await.unwrap();
        assert!(retried);
        assert_eq!(qm.get_dlq_size("nessus").await.unwrap(), 0);
        assert_eq!(qm.get_depth("nessus").await.unwrap(), 1);

        let entry = qm.dequeue("nessus", Duration::from_millis(50)).await.unwrap().unwrap();
        assert!(entry.error.is_none());
    }
}
