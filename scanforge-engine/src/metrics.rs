//! Prometheus metric registry (spec §6.2).
//!
//! One process-wide [`Metrics`] instance is constructed at startup and
//! injected into the queue manager, registry, worker, and validator call
//! sites named in spec §6.2, rather than kept as a module-scope singleton
//! (spec §9, "Global mutable state").

use std::sync::Arc;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use scanforge_core::error::{Result, ScanforgeError};

pub struct Metrics {
    registry: Registry,
    pub scans_total: IntCounterVec,
    pub active_scans: IntGauge,
    pub pool_queue_depth: IntGaugeVec,
    pub pool_dlq_depth: IntGaugeVec,
    pub scanner_active_scans: IntGaugeVec,
    pub scanner_capacity: IntGaugeVec,
    pub scanner_utilization_pct: prometheus::GaugeVec,
    pub task_duration_seconds: HistogramVec,
    pub validation_total: IntCounterVec,
    pub validation_failures_total: IntCounterVec,
    pub auth_failures_total: IntCounterVec,
    pub circuit_state: IntGaugeVec,
    pub ttl_deletions_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let scans_total = IntCounterVec::new(
            Opts::new("scans_total", "Total scans admitted, by scan_type and terminal status"),
            &["scan_type", "status"],
        )
        .map_err(prom_err)?;
        let active_scans = IntGauge::new("active_scans", "Scans currently RUNNING across all pools").map_err(prom_err)?;
        let pool_queue_depth =
            IntGaugeVec::new(Opts::new("pool_queue_depth", "Entries waiting in a pool's FIFO queue"), &["pool"]).map_err(prom_err)?;
        let pool_dlq_depth =
            IntGaugeVec::new(Opts::new("pool_dlq_depth", "Entries in a pool's dead-letter queue"), &["pool"]).map_err(prom_err)?;
        let scanner_active_scans = IntGaugeVec::new(
            Opts::new("scanner_active_scans", "Active scans held by a scanner instance"),
            &["instance"],
        )
        .map_err(prom_err)?;
        let scanner_capacity =
            IntGaugeVec::new(Opts::new("scanner_capacity", "Configured max_concurrent_scans for an instance"), &["instance"])
                .map_err(prom_err)?;
        let scanner_utilization_pct = prometheus::GaugeVec::new(
            Opts::new("scanner_utilization_pct", "active_scans / max_concurrent_scans * 100 for an instance"),
            &["instance"],
        )
        .map_err(prom_err)?;
        let task_duration_seconds = HistogramVec::new(
            HistogramOpts::new("task_duration_seconds", "Wall-clock seconds from RUNNING to a terminal state")
                .buckets(vec![1.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 14400.0, 43200.0, 86400.0]),
            &["scan_type"],
        )
        .map_err(prom_err)?;
        let validation_total =
            IntCounterVec::new(Opts::new("validation_total", "Validator runs, by pool and outcome"), &["pool", "result"]).map_err(prom_err)?;
        let validation_failures_total = IntCounterVec::new(
            Opts::new("validation_failures_total", "Validator-reported warnings, by pool and reason"),
            &["pool", "reason"],
        )
        .map_err(prom_err)?;
        let auth_failures_total = IntCounterVec::new(
            Opts::new("auth_failures_total", "Authenticated scans whose authentication_status is failed"),
            &["pool", "scan_type"],
        )
        .map_err(prom_err)?;
        let circuit_state = IntGaugeVec::new(
            Opts::new("circuit_state", "0=CLOSED, 1=OPEN, 2=HALF_OPEN for a scanner instance"),
            &["instance"],
        )
        .map_err(prom_err)?;
        let ttl_deletions_total =
            IntCounter::new("ttl_deletions_total", "Task directories deleted by housekeeping's TTL sweep").map_err(prom_err)?;

        for collector in [
            Box::new(scans_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(active_scans.clone()),
            Box::new(pool_queue_depth.clone()),
            Box::new(pool_dlq_depth.clone()),
            Box::new(scanner_active_scans.clone()),
            Box::new(scanner_capacity.clone()),
            Box::new(scanner_utilization_pct.clone()),
            Box::new(task_duration_seconds.clone()),
            Box::new(validation_total.clone()),
            Box::new(validation_failures_total.clone()),
            Box::new(auth_failures_total.clone()),
            Box::new(circuit_state.clone()),
            Box::new(ttl_deletions_total.clone()),
        ] {
            registry.register(collector).map_err(prom_err)?;
        }

        Ok(Arc::new(Self {
            registry,
            scans_total,
            active_scans,
            pool_queue_depth,
            pool_dlq_depth,
            scanner_active_scans,
            scanner_capacity,
            scanner_utilization_pct,
            task_duration_seconds,
            validation_total,
            validation_failures_total,
            auth_failures_total,
            circuit_state,
            ttl_deletions_total,
        }))
    }

    pub fn task_duration_timer(&self, scan_type: &str) -> Histogram {
        self.task_duration_seconds.with_label_values(&[scan_type])
    }

    /// Recomputes every gauge family from the registry's and queue manager's
    /// current state. These are point-in-time values (not incrementally
    /// maintained counters), so they're refreshed on every `/metrics` scrape
    /// rather than updated at each mutation site (spec §6.2).
    pub async fn refresh_gauges(&self, registry: &crate::registry::Registry, queue: &crate::queue::QueueManager) {
        for snapshot in registry.instance_snapshots() {
            self.scanner_active_scans.with_label_values(&[&snapshot.instance_id]).set(snapshot.active_scans as i64);
            self.scanner_capacity.with_label_values(&[&snapshot.instance_id]).set(snapshot.max_concurrent_scans as i64);
            let utilization = if snapshot.max_concurrent_scans > 0 {
                snapshot.active_scans as f64 / snapshot.max_concurrent_scans as f64 * 100.0
            } else {
                0.0
            };
            self.scanner_utilization_pct.with_label_values(&[&snapshot.instance_id]).set(utilization);
            self.circuit_state.with_label_values(&[&snapshot.instance_id]).set(snapshot.breaker_state.as_metric_value());
        }

        for pool in registry.list_pools() {
            if let Ok(depth) = queue.get_depth(&pool).await {
                self.pool_queue_depth.with_label_values(&[&pool]).set(depth);
            }
            if let Ok(dlq_depth) = queue.get_dlq_size(&pool).await {
                self.pool_dlq_depth.with_label_values(&[&pool]).set(dlq_depth);
            }
        }
    }

    /// Renders the current snapshot in Prometheus text exposition format for
    /// the `GET /metrics` handler.
    pub fn gather(&self) -> Result<Vec<u8>> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer).map_err(prom_err)?;
        Ok(buffer)
    }
}

fn prom_err(e: impl std::fmt::Display) -> ScanforgeError {
    ScanforgeError::Storage(format!("metrics error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_produces_non_empty_exposition_text() {
        let metrics = Metrics::new().unwrap();
        metrics.active_scans.set(3);
        metrics.scans_total.with_label_values(&["untrusted", "completed"]).inc();
        let text = String::from_utf8(metrics.gather().unwrap()).unwrap();
        assert!(text.contains("active_scans 3"));
        assert!(text.contains("scans_total"));
    }

    #[tokio::test]
    async fn refresh_gauges_reflects_registry_and_queue_state() {
        use crate::breaker::BreakerOptions;
        use crate::queue::QueueManager;
        use crate::registry::Registry;
        use scanforge_core::kv::{KvStore, MemoryKvStore};
        use scanforge_core::model::{QueueEntry, ScanPayload, ScanType, ScannerConfig, ScannerInstanceConfig};
        use std::collections::HashMap;
        use std::sync::Arc;

        let mut pools = HashMap::new();
        pools.insert(
            "nessus".to_string(),
            vec![ScannerInstanceConfig {
                instance_id: "a".to_string(),
                url: "https://a".to_string(),
                username: "u".to_string(),
                password: "p".to_string(),
                enabled: true,
                max_concurrent_scans: 2,
            }],
        );
        let config = ScannerConfig { pools, default_pool: Some("nessus".to_string()) };
        let registry = Registry::from_config(&config, BreakerOptions::default()).unwrap();
        let _held = registry.get_available_scanner("nessus", None).unwrap();

        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let queue = QueueManager::new(kv);
        queue
            .enqueue(
                "nessus",
                &QueueEntry {
                    task_id: "t1".to_string(),
                    trace_id: "tr".to_string(),
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
                },
            )
            .await
            .unwrap();

        let metrics = Metrics::new().unwrap();
        metrics.refresh_gauges(&registry, &queue).await;

        let text = String::from_utf8(metrics.gather().unwrap()).unwrap();
        assert!(text.contains("scanner_active_scans{instance=\"a\"} 1"));
        assert!(text.contains("scanner_capacity{instance=\"a\"} 2"));
        assert!(text.contains("pool_queue_depth{pool=\"nessus\"} 1"));
    }
}
