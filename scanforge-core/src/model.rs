//! The central data model: `Task` and everything it is made of.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the three scan variants a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Untrusted,
    Authenticated,
    AuthenticatedPrivileged,
}

impl ScanType {
    pub fn requires_credentials(self) -> bool {
        !matches!(self, ScanType::Untrusted)
    }
}

/// Privilege-escalation mode for authenticated scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElevationMethod {
    Nothing,
    Sudo,
    Su,
}

/// Legal `Task.status` values and their transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TaskStatus {
    /// Terminal states never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout)
    }
}

/// SSH credential block carried by authenticated scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub ssh_username: String,
    pub ssh_password: String,
    pub elevate_privileges_with: ElevationMethod,
    pub escalation_account: Option<String>,
    pub escalation_password: Option<String>,
}

/// Named field projection applied to the result stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaProfile {
    Minimal,
    Summary,
    Brief,
    Full,
}

impl Default for SchemaProfile {
    fn default() -> Self {
        SchemaProfile::Brief
    }
}

/// Submission parameters, stored verbatim on the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanPayload {
    pub targets: String,
    pub name: String,
    pub description: Option<String>,
    pub credentials: Option<Credentials>,
    pub schema_profile: Option<SchemaProfile>,
    pub custom_fields: Option<Vec<String>>,
}

/// Outcome of the validator's authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationStatus {
    Success,
    Partial,
    Failed,
    NotApplicable,
}

/// Per-severity vulnerability counts, used in `results_summary`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeverityHistogram {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    pub info: u64,
}

/// Reasons the validator may attach to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationWarning {
    AuthFailed,
    XmlInvalid,
    EmptyScan,
    FileNotFound,
    Other,
}

/// Validation metadata written into `task.json` by the validator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationStats {
    pub hosts_scanned: u64,
    pub total_vulnerabilities: u64,
    pub severity: SeverityHistogram,
}

/// The central entity: one per submission, one JSON document per task
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub trace_id: String,
    pub scan_type: ScanType,
    pub scanner_pool: String,
    pub scanner_instance_id: Option<String>,
    pub scanner_type: String,
    pub status: TaskStatus,
    pub payload: ScanPayload,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub nessus_scan_id: Option<String>,
    pub progress: Option<u8>,
    pub error_message: Option<String>,
    pub validation_stats: Option<ValidationStats>,
    pub validation_warnings: Vec<ValidationWarning>,
    pub authentication_status: Option<AuthenticationStatus>,
}

impl Task {
    pub fn new(
        task_id: String,
        trace_id: String,
        scan_type: ScanType,
        scanner_pool: String,
        scanner_type: String,
        payload: ScanPayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            trace_id,
            scan_type,
            scanner_pool,
            scanner_instance_id: None,
            scanner_type,
            status: TaskStatus::Queued,
            payload,
            created_at,
            started_at: None,
            completed_at: None,
            nessus_scan_id: None,
            progress: None,
            error_message: None,
            validation_stats: None,
            validation_warnings: Vec::new(),
            authentication_status: None,
        }
    }
}

/// Partial update to an existing task: every field defaults to "leave
/// unchanged". This is the only mutation vector the state machine accepts
/// after creation.
#[derive(Debug, Clone, Default)]
pub struct UpdateTask {
    pub status: Option<TaskStatus>,
    pub scanner_instance_id: Option<String>,
    pub nessus_scan_id: Option<String>,
    pub progress: Option<u8>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub validation_stats: Option<ValidationStats>,
    pub validation_warnings: Option<Vec<ValidationWarning>>,
    pub authentication_status: Option<AuthenticationStatus>,
}

/// An opaque record carrying enough context for the worker to process a
/// dequeued task without re-reading `task.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: String,
    pub trace_id: String,
    pub scanner_pool: String,
    pub scan_type: ScanType,
    pub scanner_instance_id: Option<String>,
    pub payload: ScanPayload,
    /// Populated only once the entry is moved to the dead-letter queue.
    pub error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// A single configured scanner endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerInstanceConfig {
    pub instance_id: String,
    pub url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub max_concurrent_scans: usize,
}

fn default_true() -> bool {
    true
}

/// Top-level scanner configuration: `pool_name -> [instance, ...]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub pools: HashMap<String, Vec<ScannerInstanceConfig>>,
    #[serde(default)]
    pub default_pool: Option<String>,
}
