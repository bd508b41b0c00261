//! Idempotency cache.
//!
//! Two distinct dedup paths:
//!
//! - **Silent dedup**: no explicit `idempotency_key`. The fingerprint of the
//!   whole body (scan_type, normalized targets, name, description,
//!   canonicalized credentials) maps to a `task_id`. A second identical
//!   submission returns the same task, no side effects.
//! - **Explicit key**: the caller's `idempotency_key` maps to a `task_id`
//!   *and* a stored body hash. A second submission under the same key with a
//!   diverging body is a `Conflict`, distinct from silent dedup.
//!
//! Passwords are part of what gets hashed for authenticated scans, but only
//! the resulting hex digest is ever stored or logged — never the raw body.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::kv::KvStore;
use crate::model::{Credentials, ScanType};

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, Value> = std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), canonicalize(v));
            }
            let obj: serde_json::Map<String, Value> = sorted.into_iter().collect();
            Value::Object(obj)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn normalize_targets(targets: &str) -> String {
    targets
        .split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

/// Inputs that determine whether two submissions are "the same request" for
/// deduplication purposes.
pub struct FingerprintInput<'a> {
    pub scan_type: ScanType,
    pub targets: &'a str,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub credentials: Option<&'a Credentials>,
    pub idempotency_key: Option<&'a str>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn body_json(input: &FingerprintInput<'_>) -> Value {
    let credentials_json = input.credentials.map(|c| {
        json!({
            "ssh_username": c.ssh_username,
            "ssh_password": c.ssh_password,
            "elevate_privileges_with": format!("{:?}", c.elevate_privileges_with),
            "escalation_account": c.escalation_account,
            "escalation_password": c.escalation_password,
        })
    });

    json!({
        "scan_type": format!("{:?}", input.scan_type),
        "targets": normalize_targets(input.targets),
        "name": input.name,
        "description": input.description,
        "credentials": credentials_json,
    })
}

/// Hash of the request body alone, independent of any `idempotency_key`.
/// Used both as the silent-dedup fingerprint and as the stored body hash for
/// explicit-key conflict detection.
pub fn body_hash(input: &FingerprintInput<'_>) -> String {
    let canonical = canonicalize(&body_json(input));
    let bytes = serde_json::to_vec(&canonical).expect("canonical json never fails to serialize");
    sha256_hex(&bytes)
}

/// The fingerprint used as the silent-dedup cache key: the body hash, with
/// the presence of an explicit key folded in so that keyed and unkeyed
/// submissions of the same body never collide.
pub fn fingerprint(input: &FingerprintInput<'_>) -> String {
    let raw = json!({
        "body": body_hash(input),
        "has_idempotency_key": input.idempotency_key.is_some(),
    });
    sha256_hex(serde_json::to_vec(&raw).expect("canonical json never fails to serialize").as_slice())
}

/// The outcome of looking up (or storing) an idempotency record.
pub enum IdempotencyOutcome {
    /// No prior submission with this fingerprint: caller should proceed.
    Fresh,
    /// A prior submission exists with this fingerprint: caller should return
    /// its `task_id` without side effects.
    Duplicate { task_id: String },
    /// An explicit `idempotency_key` was reused with a different body.
    Conflict,
}

/// Admission-path owner of idempotency records: owned by admission, expire
/// by TTL, and are never eagerly deleted on task completion.
pub struct IdempotencyCache {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn explicit_key_record(key: &str) -> String {
        format!("idemp:key:{key}")
    }

    fn explicit_key_body(key: &str) -> String {
        format!("idemp:key:{key}:body")
    }

    fn fingerprint_record(fp: &str) -> String {
        format!("idemp:fp:{fp}")
    }

    /// Looks up an existing task for this submission, reserving `task_id` if
    /// none exists yet.
    pub async fn check_and_reserve(
        &self,
        input: &FingerprintInput<'_>,
        task_id_if_fresh: &str,
    ) -> Result<IdempotencyOutcome> {
        let current_body_hash = body_hash(input);

        if let Some(key) = input.idempotency_key {
            let record_key = Self::explicit_key_record(key);
            let reserved = self.kv.setnx_ex(&record_key, task_id_if_fresh, self.ttl).await?;
            if reserved {
                self.kv
                    .setnx_ex(&Self::explicit_key_body(key), &current_body_hash, self.ttl)
                    .await?;
                return Ok(IdempotencyOutcome::Fresh);
            }

            let stored_body = self.kv.get(&Self::explicit_key_body(key)).await?;
            return match stored_body {
                Some(stored) if stored == current_body_hash => {
                    let task_id = self.kv.get(&record_key).await?.unwrap_or_else(|| task_id_if_fresh.to_string());
                    Ok(IdempotencyOutcome::Duplicate { task_id })
                }
                Some(_) => Ok(IdempotencyOutcome::Conflict),
                None => Ok(IdempotencyOutcome::Fresh),
            };
        }

        let fp = Self::fingerprint_record(&fingerprint(input));
        let reserved = self.kv.setnx_ex(&fp, task_id_if_fresh, self.ttl).await?;
        if reserved {
            Ok(IdempotencyOutcome::Fresh)
        } else {
            match self.kv.get(&fp).await? {
                Some(task_id) => Ok(IdempotencyOutcome::Duplicate { task_id }),
                None => Ok(IdempotencyOutcome::Fresh),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[test]
    fn fingerprint_is_stable_under_repeated_calls() {
        let a = FingerprintInput {
            scan_type: ScanType::Untrusted,
            targets: "10.0.0.1, 10.0.0.2",
            name: "scan-a",
            description: None,
            credentials: None,
            idempotency_key: None,
        };
        assert_eq!(fingerprint(&a), fingerprint(&a));
    }

    #[test]
    fn targets_normalization_ignores_whitespace_and_case() {
        let a = FingerprintInput {
            scan_type: ScanType::Untrusted,
            targets: "10.0.0.1,HOST.example.com",
            name: "n",
            description: None,
            credentials: None,
            idempotency_key: None,
        };
        let b = FingerprintInput {
            scan_type: ScanType::Untrusted,
            targets: " 10.0.0.1 , host.example.com ",
            name: "n",
            description: None,
            credentials: None,
            idempotency_key: None,
        };
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[tokio::test]
    async fn duplicate_submission_returns_existing_task_id() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let cache = IdempotencyCache::new(kv, Duration::from_secs(60));
        let input = FingerprintInput {
            scan_type: ScanType::Untrusted,
            targets: "10.0.0.1",
            name: "n",
            description: None,
            credentials: None,
            idempotency_key: None,
        };

        let first = cache.check_and_reserve(&input, "task-1").await.unwrap();
        assert!(matches!(first, IdempotencyOutcome::Fresh));

        let second = cache.check_and_reserve(&input, "task-2").await.unwrap();
        match second {
            IdempotencyOutcome::Duplicate { task_id } => assert_eq!(task_id, "task-1"),
            _ => panic!("expected duplicate"),
        }
    }

    #[tokio::test]
    async fn conflicting_body_under_same_explicit_key_is_rejected() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let cache = IdempotencyCache::new(kv, Duration::from_secs(60));
        let a = FingerprintInput {
            scan_type: ScanType::Untrusted,
            targets: "10.0.0.1",
            name: "n",
            description: None,
            credentials: None,
            idempotency_key: Some("k"),
        };
        cache.check_and_reserve(&a, "task-1").await.unwrap();

        let b = FingerprintInput {
            scan_type: ScanType::Untrusted,
            targets: "10.0.0.2",
            name: "n",
            description: None,
            credentials: None,
            idempotency_key: Some("k"),
        };
        let outcome = cache.check_and_reserve(&b, "task-2").await.unwrap();
        assert!(matches!(outcome, IdempotencyOutcome::Conflict));
    }

    #[tokio::test]
    async fn matching_body_under_same_explicit_key_is_duplicate() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let cache = IdempotencyCache::new(kv, Duration::from_secs(60));
        let a = FingerprintInput {
            scan_type: ScanType::Untrusted,
            targets: "10.0.0.1",
            name: "n",
            description: None,
            credentials: None,
            idempotency_key: Some("k"),
        };
        cache.check_and_reserve(&a, "task-1").await.unwrap();
        let outcome = cache.check_and_reserve(&a, "task-2").await.unwrap();
        match outcome {
            IdempotencyOutcome::Duplicate { task_id } => assert_eq!(task_id, "task-1"),
            _ => panic!("expected duplicate"),
        }
    }
}
