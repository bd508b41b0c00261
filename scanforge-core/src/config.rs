//! Environment-driven runtime configuration.
//!
//! A plain struct with sensible defaults, constructed once at startup and
//! passed down by reference.

use std::path::PathBuf;
use std::time::Duration;

/// Process-wide configuration read from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub kv_url: String,
    pub data_dir: PathBuf,
    pub default_pool: String,
    pub idempotency_ttl: Duration,
    pub completed_ttl: Duration,
    pub failed_ttl: Duration,
    pub stale_running_threshold: Duration,
    pub housekeeping_interval: Duration,
    pub scan_ceiling: Duration,
    pub poll_interval: Duration,
    pub shutdown_deadline: Duration,
    pub log_level: String,
    pub scanner_config_path: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            kv_url: "redis://127.0.0.1:6379".to_string(),
            data_dir: PathBuf::from("./data/tasks"),
            default_pool: "nessus".to_string(),
            idempotency_ttl: Duration::from_secs(48 * 3600),
            completed_ttl: Duration::from_secs(7 * 24 * 3600),
            failed_ttl: Duration::from_secs(30 * 24 * 3600),
            stale_running_threshold: Duration::from_secs(24 * 3600),
            housekeeping_interval: Duration::from_secs(3600),
            scan_ceiling: Duration::from_secs(24 * 3600),
            poll_interval: Duration::from_secs(30),
            shutdown_deadline: Duration::from_secs(24 * 3600),
            log_level: "info".to_string(),
            scanner_config_path: PathBuf::from("./scanners.yaml"),
        }
    }
}

impl ServiceConfig {
    /// Loads configuration from the environment, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SCANFORGE_KV_URL") {
            cfg.kv_url = v;
        }
        if let Ok(v) = std::env::var("SCANFORGE_DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SCANFORGE_DEFAULT_POOL") {
            cfg.default_pool = v;
        }
        if let Ok(v) = std::env::var("SCANFORGE_IDEMPOTENCY_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.idempotency_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("SCANFORGE_COMPLETED_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.completed_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("SCANFORGE_FAILED_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.failed_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("SCANFORGE_STALE_RUNNING_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.stale_running_threshold = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("SCANFORGE_HOUSEKEEPING_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                cfg.housekeeping_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = std::env::var("SCANFORGE_LOG_LEVEL") {
            cfg.log_level = v;
        }
        if let Ok(v) = std::env::var("SCANFORGE_SCANNER_CONFIG") {
            cfg.scanner_config_path = PathBuf::from(v);
        }

        cfg
    }
}
