//! The KV/queue client: a thin wrapper over a Redis-compatible store exposing
//! exactly the primitives the rest of the system needs — lists, sorted sets,
//! SETNX-with-TTL strings, and counters.
//!
//! [`RedisKvStore`] is the production backend. [`MemoryKvStore`] is a
//! single-process, in-memory stand-in used by tests, paired alongside it the
//! same way `scanforge-engine::adapter` pairs a live adapter with a mock one.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;

use crate::error::{Result, ScanforgeError};

/// A single blocking multi-key pop is required so that `dequeue_any` does not
/// break fairness by polling pools in turn.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn lpush(&self, key: &str, value: &str) -> Result<i64>;

    /// Blocking pop across one or more lists; returns `(key, value)` of
    /// whichever list produced an entry first, or `None` on timeout.
    async fn brpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>>;

    async fn llen(&self, key: &str) -> Result<i64>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zrange_with_scores(&self, key: &str, start: isize, stop: isize) -> Result<Vec<(String, f64)>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;
    async fn zcard(&self, key: &str) -> Result<i64>;

    /// `SETNX key value EX ttl`. Returns `true` if the key was set (i.e. it
    /// did not already exist).
    async fn setnx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn del(&self, key: &str) -> Result<()>;

    async fn incr(&self, key: &str) -> Result<i64>;
    async fn decr(&self, key: &str) -> Result<i64>;

    async fn ping(&self) -> Result<()>;
}

/// Production backend: a `redis`-backed connection manager. Cloning is cheap
/// and all clones share the underlying multiplexed connection, matching the
/// pack's `RedisBackend` (`pmcp-tasks::store::redis`).
#[derive(Clone)]
pub struct RedisKvStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| ScanforgeError::Storage(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| ScanforgeError::Storage(format!("failed to connect to redis: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.lpush(key, value)
            .await
            .map_err(|e| ScanforgeError::Storage(e.to_string()))
    }

    async fn brpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let mut conn = self.conn.clone();
        let result: Option<(String, String)> = conn
            .brpop(keys, timeout.as_secs_f64())
            .await
            .map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        Ok(result)
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(|e| ScanforgeError::Storage(e.to_string()))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zadd(key, member, score)
            .await
            .map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn zrange_with_scores(&self, key: &str, start: isize, stop: isize) -> Result<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        conn.zrange_withscores(key, start, stop)
            .await
            .map_err(|e| ScanforgeError::Storage(e.to_string()))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zrem(key, member)
            .await
            .map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.zcard(key).await.map_err(|e| ScanforgeError::Storage(e.to_string()))
    }

    async fn setnx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        Ok(set)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| ScanforgeError::Storage(e.to_string()))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.incr(key, 1).await.map_err(|e| ScanforgeError::Storage(e.to_string()))
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.decr(key, 1).await.map_err(|e| ScanforgeError::Storage(e.to_string()))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| ScanforgeError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    sorted_sets: HashMap<String, BTreeMap<String, f64>>,
    strings: HashMap<String, (String, Option<std::time::Instant>)>,
    counters: HashMap<String, i64>,
}

/// In-memory `KvStore` used by tests and by local development without a
/// running Redis. `brpop` polls at a fixed interval rather than truly
/// blocking, which is acceptable for the small, timeout-bounded waits the
/// tests exercise.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    state: std::sync::Arc<Mutex<MemoryState>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        let mut st = self.state.lock();
        let list = st.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        Ok(list.len() as i64)
    }

    async fn brpop(&self, keys: &[String], timeout: Duration) -> Result<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut st = self.state.lock();
                for key in keys {
                    if let Some(list) = st.lists.get_mut(key) {
                        if let Some(value) = list.pop_back() {
                            return Ok(Some((key.clone(), value)));
                        }
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        Ok(self.state.lock().lists.get(key).map(|l| l.len() as i64).unwrap_or(0))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.state
            .lock()
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_with_scores(&self, key: &str, start: isize, stop: isize) -> Result<Vec<(String, f64)>> {
        let st = self.state.lock();
        let Some(set) = st.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<(String, f64)> = set.iter().map(|(k, v)| (k.clone(), *v)).collect();
        entries.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        Ok(slice_range(entries, start, stop))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(set) = self.state.lock().sorted_sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .sorted_sets
            .get(key)
            .map(|s| s.len() as i64)
            .unwrap_or(0))
    }

    async fn setnx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut st = self.state.lock();
        if let Some((_, expiry)) = st.strings.get(key) {
            if expiry.map(|e| e > std::time::Instant::now()).unwrap_or(true) {
                return Ok(false);
            }
        }
        st.strings
            .insert(key.to_string(), (value.to_string(), Some(std::time::Instant::now() + ttl)));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let st = self.state.lock();
        Ok(st.strings.get(key).and_then(|(v, expiry)| {
            if expiry.map(|e| e > std::time::Instant::now()).unwrap_or(true) {
                Some(v.clone())
            } else {
                None
            }
        }))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.state.lock().strings.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut st = self.state.lock();
        let counter = st.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut st = self.state.lock();
        let counter = st.counters.entry(key.to_string()).or_insert(0);
        *counter -= 1;
        Ok(*counter)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

fn slice_range<T>(mut v: Vec<T>, start: isize, stop: isize) -> Vec<T> {
    let len = v.len() as isize;
    if len == 0 {
        return Vec::new();
    }
    let norm = |i: isize| -> isize {
        if i < 0 {
            (len + i).max(0)
        } else {
            i.min(len - 1).max(0)
        }
    };
    let s = norm(start);
    let e = norm(stop);
    if s > e || s >= len {
        return Vec::new();
    }
    v.truncate((e + 1) as usize);
    v.split_off(s as usize)
}
