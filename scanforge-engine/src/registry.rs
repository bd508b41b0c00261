//! Scanner registry (spec §4.7, C6): pool -> instance mapping, least-loaded
//! selection, and hot reload.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use scanforge_core::error::{Result, ScanforgeError};
use scanforge_core::model::ScannerConfig;

use crate::adapter::{NessusAdapter, ScannerAdapter};
use crate::breaker::{BreakerOptions, CircuitBreaker};

struct InstanceEntry {
    instance_id: String,
    pool: String,
    url: String,
    enabled: bool,
    max_concurrent_scans: usize,
    active_scans: usize,
    /// Monotonic counter, bumped on every `acquire`; used to break ties
    /// between equally-utilized instances by least-recently-used (spec
    /// §4.7).
    last_acquired_seq: u64,
    adapter: Arc<dyn ScannerAdapter>,
    breaker: Arc<CircuitBreaker>,
}

/// Opaque key identifying a selected instance, returned by
/// `get_available_scanner` and required by `acquire`/`release`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceKey(pub String);

struct RegistryState {
    instances: HashMap<String, InstanceEntry>,
    acquire_seq: u64,
}

/// Process-global only by convention of how the caller wires it — the
/// registry itself is an ordinary injected value, never a module-scope
/// singleton, so tests can instantiate independent instances (spec §9).
pub struct Registry {
    state: Mutex<RegistryState>,
    breaker_options: BreakerOptions,
}

impl Registry {
    pub fn from_config(config: &ScannerConfig, breaker_options: BreakerOptions) -> Result<Arc<Self>> {
        let mut instances = HashMap::new();
        for (pool, pool_instances) in &config.pools {
            for inst in pool_instances {
                let adapter: Arc<dyn ScannerAdapter> =
                    Arc::new(NessusAdapter::new(inst.url.clone(), inst.username.clone(), inst.password.clone())?);
                instances.insert(
                    inst.instance_id.clone(),
                    InstanceEntry {
                        instance_id: inst.instance_id.clone(),
                        pool: pool.clone(),
                        url: inst.url.clone(),
                        enabled: inst.enabled,
                        max_concurrent_scans: inst.max_concurrent_scans,
                        active_scans: 0,
                        last_acquired_seq: 0,
                        adapter,
                        breaker: CircuitBreaker::new(breaker_options),
                    },
                );
            }
        }
        Ok(Arc::new(Self {
            state: Mutex::new(RegistryState { instances, acquire_seq: 0 }),
            breaker_options,
        }))
    }

    /// Selects the enabled instance in `pool` with the smallest
    /// `active_scans/max_concurrent_scans` ratio, ties broken by
    /// least-recently-acquired. `None` when every instance is at capacity or
    /// the pool has none enabled.
    ///
    /// When `required_instance` is set, admission demanded that specific
    /// instance (spec §9 open question: "must", resolved as the stricter
    /// reading) — only that instance is considered.
    pub fn get_available_scanner(
        &self,
        pool: &str,
        required_instance: Option<&str>,
    ) -> Option<(Arc<dyn ScannerAdapter>, Arc<CircuitBreaker>, InstanceKey)> {
        let mut state = self.state.lock();
        let candidate_id = {
            let mut best: Option<(&String, f64, u64)> = None;
            for entry in state.instances.values() {
                if entry.pool != pool || !entry.enabled {
                    continue;
                }
                if let Some(required) = required_instance {
                    if entry.instance_id != required {
                        continue;
                    }
                }
                if entry.active_scans >= entry.max_concurrent_scans {
                    continue;
                }
                let utilization = entry.active_scans as f64 / entry.max_concurrent_scans.max(1) as f64;
                let better = match &best {
                    None => true,
                    Some((_, best_util, best_seq)) => {
                        utilization < *best_util || (utilization == *best_util && entry.last_acquired_seq < *best_seq)
                    }
                };
                if better {
                    best = Some((&entry.instance_id, utilization, entry.last_acquired_seq));
                }
            }
            best.map(|(id, _, _)| id.clone())
        }?;

        state.acquire_seq += 1;
        let seq = state.acquire_seq;
        let entry = state.instances.get_mut(&candidate_id)?;
        entry.active_scans += 1;
        entry.last_acquired_seq = seq;
        Some((entry.adapter.clone(), entry.breaker.clone(), InstanceKey(candidate_id)))
    }

    /// Increments the live counter without selection; paired with `release`
    /// by the worker on every exit path (spec §4.7).
    pub fn acquire(&self, key: &InstanceKey) -> Result<()> {
        let mut state = self.state.lock();
        state.acquire_seq += 1;
        let seq = state.acquire_seq;
        let entry = state
            .instances
            .get_mut(&key.0)
            .ok_or_else(|| ScanforgeError::NotFound(format!("scanner instance {}", key.0)))?;
        entry.active_scans += 1;
        entry.last_acquired_seq = seq;
        Ok(())
    }

    pub fn release(&self, key: &InstanceKey) {
        let mut state = self.state.lock();
        if let Some(entry) = state.instances.get_mut(&key.0) {
            entry.active_scans = entry.active_scans.saturating_sub(1);
        }
    }

    pub fn get_pool_capacity(&self, pool: &str) -> usize {
        self.state
            .lock()
            .instances
            .values()
            .filter(|e| e.pool == pool && e.enabled)
            .map(|e| e.max_concurrent_scans)
            .sum()
    }

    pub fn get_pool_active(&self, pool: &str) -> usize {
        self.state.lock().instances.values().filter(|e| e.pool == pool).map(|e| e.active_scans).sum()
    }

    pub fn pools_with_spare_capacity(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut pools: HashMap<String, (usize, usize)> = HashMap::new();
        for entry in state.instances.values() {
            if !entry.enabled {
                continue;
            }
            let slot = pools.entry(entry.pool.clone()).or_insert((0, 0));
            slot.0 += entry.active_scans;
            slot.1 += entry.max_concurrent_scans;
        }
        pools.into_iter().filter(|(_, (active, cap))| active < cap).map(|(pool, _)| pool).collect()
    }

    pub fn instance_breaker(&self, key: &InstanceKey) -> Option<Arc<CircuitBreaker>> {
        self.state.lock().instances.get(&key.0).map(|e| e.breaker.clone())
    }

    /// Looks up an instance's adapter directly by id, without acquiring a
    /// capacity slot. Used by housekeeping to issue best-effort
    /// `stop_scan`/`delete_scan` calls against a stale task's scanner.
    pub fn adapter_by_instance_id(&self, instance_id: &str) -> Option<Arc<dyn ScannerAdapter>> {
        self.state.lock().instances.get(instance_id).map(|e| e.adapter.clone())
    }

    /// Per-pool totals plus per-instance breakdown (spec §4.1
    /// `get_pool_status`).
    pub fn get_pool_status(&self, pool: &str) -> PoolStatus {
        let state = self.state.lock();
        let mut instances = Vec::new();
        let mut capacity = 0;
        let mut active = 0;
        for entry in state.instances.values().filter(|e| e.pool == pool) {
            if entry.enabled {
                capacity += entry.max_concurrent_scans;
            }
            active += entry.active_scans;
            instances.push(InstanceStatus {
                instance_id: entry.instance_id.clone(),
                url: entry.url.clone(),
                enabled: entry.enabled,
                active_scans: entry.active_scans,
                max_concurrent_scans: entry.max_concurrent_scans,
            });
        }
        PoolStatus { pool: pool.to_string(), capacity, active_scans: active, instances }
    }

    pub fn list_pools(&self) -> Vec<String> {
        let mut pools: Vec<String> = self.state.lock().instances.values().map(|e| e.pool.clone()).collect();
        pools.sort();
        pools.dedup();
        pools
    }

    /// Per-instance snapshot used to refresh the `scanner_*`/`circuit_state`
    /// gauges on every `/metrics` scrape (spec §6.2).
    pub fn instance_snapshots(&self) -> Vec<InstanceSnapshot> {
        self.state
            .lock()
            .instances
            .values()
            .map(|e| InstanceSnapshot {
                instance_id: e.instance_id.clone(),
                pool: e.pool.clone(),
                active_scans: e.active_scans,
                max_concurrent_scans: e.max_concurrent_scans,
                breaker_state: e.breaker.state(),
            })
            .collect()
    }

    /// Re-reads configuration and mutates the registry in place without
    /// interrupting in-flight acquisitions: existing instance entries are
    /// updated (enabled/capacity/url/credentials), unknown new instances are
    /// added, and instances absent from the new config are disabled rather
    /// than removed so any task still holding their key can still `release`
    /// cleanly (spec §4.7, §9 "Hot-reload").
    pub fn reload(&self, config: &ScannerConfig) -> Result<()> {
        let mut state = self.state.lock();
        let mut seen = std::collections::HashSet::new();
        for (pool, pool_instances) in &config.pools {
            for inst in pool_instances {
                seen.insert(inst.instance_id.clone());
                if let Some(entry) = state.instances.get_mut(&inst.instance_id) {
                    entry.pool = pool.clone();
                    entry.url = inst.url.clone();
                    entry.enabled = inst.enabled;
                    entry.max_concurrent_scans = inst.max_concurrent_scans;
                } else {
                    let adapter: Arc<dyn ScannerAdapter> =
                        Arc::new(NessusAdapter::new(inst.url.clone(), inst.username.clone(), inst.password.clone())?);
                    state.instances.insert(
                        inst.instance_id.clone(),
                        InstanceEntry {
                            instance_id: inst.instance_id.clone(),
                            pool: pool.clone(),
                            url: inst.url.clone(),
                            enabled: inst.enabled,
                            max_concurrent_scans: inst.max_concurrent_scans,
                            active_scans: 0,
                            last_acquired_seq: 0,
                            adapter,
                            breaker: CircuitBreaker::new(self.breaker_options),
                        },
                    );
                }
            }
        }
        for (id, entry) in state.instances.iter_mut() {
            if !seen.contains(id) {
                entry.enabled = false;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub pool: String,
    pub active_scans: usize,
    pub max_concurrent_scans: usize,
    pub breaker_state: crate::breaker::BreakerState,
}

#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub instance_id: String,
    pub url: String,
    pub enabled: bool,
    pub active_scans: usize,
    pub max_concurrent_scans: usize,
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub pool: String,
    pub capacity: usize,
    pub active_scans: usize,
    pub instances: Vec<InstanceStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanforge_core::model::ScannerInstanceConfig;

    fn config_with_two_instances() -> ScannerConfig {
        let mut pools = HashMap::new();
        pools.insert(
            "nessus".to_string(),
            vec![
                ScannerInstanceConfig {
                    instance_id: "a".to_string(),
                    url: "https://a".to_string(),
                    username: "u".to_string(),
                    password: "p".to_string(),
                    enabled: true,
                    max_concurrent_scans: 1,
                },
                ScannerInstanceConfig {
                    instance_id: "b".to_string(),
                    url: "https://b".to_string(),
                    username: "u".to_string(),
                    password: "p".to_string(),
                    enabled: true,
                    max_concurrent_scans: 1,
                },
            ],
        );
        ScannerConfig { pools, default_pool: Some("nessus".to_string()) }
    }

    #[test]
    fn selects_least_loaded_instance_and_respects_capacity() {
        let registry = Registry::from_config(&config_with_two_instances(), BreakerOptions::default()).unwrap();
        let (_, _, key1) = registry.get_available_scanner("nessus", None).unwrap();
        let (_, _, key2) = registry.get_available_scanner("nessus", None).unwrap();
        assert_ne!(key1.0, key2.0);
        assert!(registry.get_available_scanner("nessus", None).is_none());

        registry.release(&key1);
        let (_, _, key3) = registry.get_available_scanner("nessus", None).unwrap();
        assert_eq!(key3.0, key1.0);
    }

    #[test]
    fn required_instance_restricts_selection() {
        let registry = Registry::from_config(&config_with_two_instances(), BreakerOptions::default()).unwrap();
        let (_, _, key) = registry.get_available_scanner("nessus", Some("b")).unwrap();
        assert_eq!(key.0, "b");
    }

    #[test]
    fn reload_disables_removed_instances_without_dropping_them() {
        let registry = Registry::from_config(&config_with_two_instances(), BreakerOptions::default()).unwrap();
        let mut pools = HashMap::new();
        pools.insert(
            "nessus".to_string(),
            vec![ScannerInstanceConfig {
                instance_id: "a".to_string(),
                url: "https://a".to_string(),
                username: "u".to_string(),
                password: "p".to_string(),
                enabled: true,
                max_concurrent_scans: 1,
            }],
        );
        let reduced = ScannerConfig { pools, default_pool: Some("nessus".to_string()) };
        registry.reload(&reduced).unwrap();

        assert_eq!(registry.get_pool_capacity("nessus"), 1);
    }
}
