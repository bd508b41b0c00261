//! Scanner adapter trait and implementations (spec §4.6/§6.3, C5).
//!
//! `ScannerAdapter` is the uniform interface the worker drives regardless of
//! vendor. [`NessusAdapter`] talks to a real Nessus-class HTTP API over
//! `reqwest`; [`MockAdapter`] is a deterministic in-process stand-in used by
//! engine tests and the worker's own test suite, mirroring the teacher's
//! split between its live scanning path and `formatter`'s pure functions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use scanforge_core::error::{Result, ScanforgeError};
use scanforge_core::model::{Credentials, ElevationMethod};

/// Vendor-neutral scan status, already mapped per spec §4.6's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl AdapterStatus {
    /// Maps a raw vendor status string (spec §6.3: `pending`, `running`,
    /// `paused`, `completed`, `canceled`, `stopped`, `aborted`) onto the
    /// adapter's four-value status. `paused` folds into `running`;
    /// `canceled`/`stopped`/`aborted` fold into `failed` (spec §4.6).
    pub fn from_vendor_status(raw: &str) -> Self {
        match raw {
            "pending" => AdapterStatus::Queued,
            "running" | "paused" => AdapterStatus::Running,
            "completed" => AdapterStatus::Completed,
            "canceled" | "stopped" | "aborted" => AdapterStatus::Failed,
            _ => AdapterStatus::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanStatusReport {
    pub status: AdapterStatus,
    pub progress: u8,
    pub uuid: Option<String>,
}

/// Parameters for `create_scan` (spec §4.6/§6.3): targets, a display name,
/// and, for authenticated variants, an SSH credential block.
#[derive(Debug, Clone)]
pub struct CreateScanRequest {
    pub targets: String,
    pub name: String,
    pub credentials: Option<Credentials>,
}

/// The operations every scanner backend must expose. Every method is
/// cancel-safe: dropping the future must not leave the scanner in an
/// inconsistent local state, since the circuit breaker and the worker's
/// `tokio::select!` loop may abandon a call mid-flight.
#[async_trait]
pub trait ScannerAdapter: Send + Sync {
    /// Idempotent: subsequent calls after a successful one are no-ops.
    async fn authenticate(&self) -> Result<()>;

    async fn create_scan(&self, request: &CreateScanRequest) -> Result<String>;

    async fn launch_scan(&self, scan_id: &str) -> Result<String>;

    async fn get_status(&self, scan_id: &str) -> Result<ScanStatusReport>;

    /// Requests an export, polls until ready (bounded internally to a few
    /// minutes), then downloads the bytes.
    async fn export_results(&self, scan_id: &str) -> Result<Vec<u8>>;

    async fn stop_scan(&self, scan_id: &str) -> Result<bool>;

    async fn delete_scan(&self, scan_id: &str) -> Result<bool>;

    /// Releases underlying HTTP resources. Called unconditionally by the
    /// worker's per-task `try`/`finally` equivalent.
    async fn close(&self);
}

fn elevation_method_str(method: ElevationMethod) -> &'static str {
    match method {
        ElevationMethod::Nothing => "Nothing",
        ElevationMethod::Sudo => "sudo",
        ElevationMethod::Su => "su",
    }
}

struct NessusSession {
    token: Option<String>,
}

/// Production adapter for a Nessus-class HTTP API (spec §6.3). Self-signed
/// certificates are accepted, matching the spec's "Credential transport is
/// HTTPS; self-signed certificates are accepted".
pub struct NessusAdapter {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    session: RwLock<NessusSession>,
}

impl NessusAdapter {
    pub fn new(base_url: String, username: String, password: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ScanforgeError::Scanner(format!("failed to build http client: {e}")))?;
        Ok(Self {
            base_url,
            username,
            password,
            client,
            session: RwLock::new(NessusSession { token: None }),
        })
    }

    fn token(&self) -> Option<String> {
        self.session.read().token.clone()
    }

    async fn authenticate_uncached(&self) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/session", self.base_url))
            .json(&serde_json::json!({ "username": self.username, "password": self.password }))
            .send()
            .await
            .map_err(|e| ScanforgeError::Scanner(format!("authentication request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(ScanforgeError::Scanner(format!("authentication failed with status {}", resp.status())));
        }

        #[derive(serde::Deserialize)]
        struct SessionResponse {
            token: String,
        }
        let body: SessionResponse = resp
            .json()
            .await
            .map_err(|e| ScanforgeError::Scanner(format!("malformed session response: {e}")))?;
        Ok(body.token)
    }

    /// Re-authenticates exactly once on a 401, per spec §4.6 ("idempotent
    /// re-authentication on one 401" — the only retry the adapter performs
    /// internally).
    async fn request_with_reauth(
        &self,
        build: impl Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        self.authenticate().await?;
        let token = self.token().ok_or_else(|| ScanforgeError::Scanner("no session token".to_string()))?;
        let resp = build(&self.client, &token)
            .send()
            .await
            .map_err(|e| ScanforgeError::Scanner(e.to_string()))?;

        if resp.status().as_u16() == 401 {
            let fresh = self.authenticate_uncached().await?;
            self.session.write().token = Some(fresh.clone());
            let retried = build(&self.client, &fresh).send().await.map_err(|e| ScanforgeError::Scanner(e.to_string()))?;
            return Ok(retried);
        }
        Ok(resp)
    }
}

#[async_trait]
impl ScannerAdapter for NessusAdapter {
    async fn authenticate(&self) -> Result<()> {
        if self.token().is_some() {
            return Ok(());
        }
        let token = self.authenticate_uncached().await?;
        self.session.write().token = Some(token);
        Ok(())
    }

    async fn create_scan(&self, request: &CreateScanRequest) -> Result<String> {
        let mut settings = serde_json::json!({
            "name": request.name,
            "text_targets": request.targets,
        });
        if let Some(creds) = &request.credentials {
            settings["ssh_username"] = serde_json::Value::String(creds.ssh_username.clone());
            settings["ssh_password"] = serde_json::Value::String(creds.ssh_password.clone());
            settings["elevate_privileges_with"] =
                serde_json::Value::String(elevation_method_str(creds.elevate_privileges_with).to_string());
            if let Some(account) = &creds.escalation_account {
                settings["escalation_account"] = serde_json::Value::String(account.clone());
            }
            if let Some(password) = &creds.escalation_password {
                settings["escalation_password"] = serde_json::Value::String(password.clone());
            }
        }
        let body = serde_json::json!({ "uuid": "advanced-policy-template", "settings": settings });

        let resp = self
            .request_with_reauth(|client, token| {
                client
                    .post(format!("{}/scans", self.base_url))
                    .header("X-Cookie", format!("token={token}"))
                    .json(&body)
            })
            .await?;

        if !resp.status().is_success() {
            return Err(ScanforgeError::Scanner(format!("create_scan failed with status {}", resp.status())));
        }

        #[derive(serde::Deserialize)]
        struct CreateResponse {
            scan: ScanId,
        }
        #[derive(serde::Deserialize)]
        struct ScanId {
            id: serde_json::Value,
        }
        let body: CreateResponse = resp.json().await.map_err(|e| ScanforgeError::Scanner(e.to_string()))?;
        Ok(body.scan.id.to_string())
    }

    async fn launch_scan(&self, scan_id: &str) -> Result<String> {
        let resp = self
            .request_with_reauth(|client, token| {
                client
                    .post(format!("{}/scans/{}/launch", self.base_url, scan_id))
                    .header("X-Cookie", format!("token={token}"))
            })
            .await?;

        if !resp.status().is_success() {
            return Err(ScanforgeError::Scanner(format!("launch_scan failed with status {}", resp.status())));
        }

        #[derive(serde::Deserialize)]
        struct LaunchResponse {
            scan_uuid: String,
        }
        let body: LaunchResponse = resp.json().await.map_err(|e| ScanforgeError::Scanner(e.to_string()))?;
        Ok(body.scan_uuid)
    }

    async fn get_status(&self, scan_id: &str) -> Result<ScanStatusReport> {
        let resp = self
            .request_with_reauth(|client, token| {
                client
                    .get(format!("{}/scans/{}", self.base_url, scan_id))
                    .header("X-Cookie", format!("token={token}"))
            })
            .await?;

        if !resp.status().is_success() {
            return Err(ScanforgeError::Scanner(format!("get_status failed with status {}", resp.status())));
        }

        #[derive(serde::Deserialize)]
        struct StatusResponse {
            info: StatusInfo,
        }
        #[derive(serde::Deserialize)]
        struct StatusInfo {
            status: String,
            #[serde(default)]
            progress: Option<f64>,
            #[serde(default)]
            uuid: Option<String>,
        }
        let body: StatusResponse = resp.json().await.map_err(|e| ScanforgeError::Scanner(e.to_string()))?;
        Ok(ScanStatusReport {
            status: AdapterStatus::from_vendor_status(&body.info.status),
            progress: body.info.progress.unwrap_or(0.0).clamp(0.0, 100.0) as u8,
            uuid: body.info.uuid,
        })
    }

    async fn export_results(&self, scan_id: &str) -> Result<Vec<u8>> {
        let resp = self
            .request_with_reauth(|client, token| {
                client
                    .post(format!("{}/scans/{}/export", self.base_url, scan_id))
                    .header("X-Cookie", format!("token={token}"))
                    .json(&serde_json::json!({ "format": "nessus" }))
            })
            .await?;
        if !resp.status().is_success() {
            return Err(ScanforgeError::Scanner(format!("export request failed with status {}", resp.status())));
        }

        #[derive(serde::Deserialize)]
        struct ExportResponse {
            file: serde_json::Value,
        }
        let export: ExportResponse = resp.json().await.map_err(|e| ScanforgeError::Scanner(e.to_string()))?;
        let file_id = export.file.to_string();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5 * 60);
        loop {
            let status_resp = self
                .request_with_reauth(|client, token| {
                    client
                        .get(format!("{}/scans/{}/export/{}/status", self.base_url, scan_id, file_id))
                        .header("X-Cookie", format!("token={token}"))
                })
                .await?;
            #[derive(serde::Deserialize)]
            struct ExportStatus {
                status: String,
            }
            let status: ExportStatus = status_resp.json().await.map_err(|e| ScanforgeError::Scanner(e.to_string()))?;
            if status.status == "ready" {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScanforgeError::Timeout(format!("export of scan {scan_id} did not become ready")));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        let download = self
            .request_with_reauth(|client, token| {
                client
                    .get(format!("{}/scans/{}/export/{}/download", self.base_url, scan_id, file_id))
                    .header("X-Cookie", format!("token={token}"))
            })
            .await?;
        let bytes = download.bytes().await.map_err(|e| ScanforgeError::Scanner(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn stop_scan(&self, scan_id: &str) -> Result<bool> {
        let resp = self
            .request_with_reauth(|client, token| {
                client
                    .post(format!("{}/scans/{}/stop", self.base_url, scan_id))
                    .header("X-Cookie", format!("token={token}"))
            })
            .await;
        Ok(resp.map(|r| r.status().is_success()).unwrap_or(false))
    }

    async fn delete_scan(&self, scan_id: &str) -> Result<bool> {
        let resp = self
            .request_with_reauth(|client, token| {
                client
                    .delete(format!("{}/scans/{}", self.base_url, scan_id))
                    .header("X-Cookie", format!("token={token}"))
            })
            .await;
        Ok(resp.map(|r| r.status().is_success()).unwrap_or(false))
    }

    async fn close(&self) {
        self.session.write().token = None;
    }
}

/// Deterministic test double. Scripted via [`MockAdapter::set_script`]:
/// each call to `get_status` advances through a preconfigured list of
/// reports, looping on the last entry once exhausted.
pub struct MockAdapter {
    inner: Arc<RwLock<MockState>>,
}

struct MockState {
    fail_create: bool,
    fail_get_status: bool,
    statuses: Vec<AdapterStatus>,
    cursor: usize,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MockState {
                fail_create: false,
                fail_get_status: false,
                statuses: vec![AdapterStatus::Running, AdapterStatus::Completed],
                cursor: 0,
            })),
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.inner.write().fail_create = fail;
    }

    pub fn set_fail_get_status(&self, fail: bool) {
        self.inner.write().fail_get_status = fail;
    }

    pub fn set_status_script(&self, statuses: Vec<AdapterStatus>) {
        let mut inner = self.inner.write();
        inner.statuses = statuses;
        inner.cursor = 0;
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScannerAdapter for MockAdapter {
    async fn authenticate(&self) -> Result<()> {
        Ok(())
    }

    async fn create_scan(&self, _request: &CreateScanRequest) -> Result<String> {
        if self.inner.read().fail_create {
            return Err(ScanforgeError::Scanner("mock create_scan failure".to_string()));
        }
        Ok("mock-scan-1".to_string())
    }

    async fn launch_scan(&self, _scan_id: &str) -> Result<String> {
        Ok("mock-uuid-1".to_string())
    }

    async fn get_status(&self, _scan_id: &str) -> Result<ScanStatusReport> {
        let mut inner = self.inner.write();
        if inner.fail_get_status {
            return Err(ScanforgeError::Scanner("mock get_status failure".to_string()));
        }
        let idx = inner.cursor.min(inner.statuses.len() - 1);
        let status = inner.statuses[idx];
        if inner.cursor < inner.statuses.len() - 1 {
            inner.cursor += 1;
        }
        Ok(ScanStatusReport { status, progress: if status == AdapterStatus::Completed { 100 } else { 50 }, uuid: Some("mock-uuid-1".to_string()) })
    }

    async fn export_results(&self, _scan_id: &str) -> Result<Vec<u8>> {
        Ok(b"<NessusClientData_v2></NessusClientData_v2>".to_vec())
    }

    async fn stop_scan(&self, _scan_id: &str) -> Result<bool> {
        Ok(true)
    }

    async fn delete_scan(&self, _scan_id: &str) -> Result<bool> {
        Ok(true)
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_status_mapping_matches_spec_table() {
        assert_eq!(AdapterStatus::from_vendor_status("pending"), AdapterStatus::Queued);
        assert_eq!(AdapterStatus::from_vendor_status("paused"), AdapterStatus::Running);
        assert_eq!(AdapterStatus::from_vendor_status("running"), AdapterStatus::Running);
        assert_eq!(AdapterStatus::from_vendor_status("completed"), AdapterStatus::Completed);
        assert_eq!(AdapterStatus::from_vendor_status("canceled"), AdapterStatus::Failed);
        assert_eq!(AdapterStatus::from_vendor_status("stopped"), AdapterStatus::Failed);
        assert_eq!(AdapterStatus::from_vendor_status("aborted"), AdapterStatus::Failed);
    }

    #[tokio::test]
    async fn mock_adapter_walks_its_status_script() {
        let mock = MockAdapter::new();
        mock.set_status_script(vec![AdapterStatus::Running, AdapterStatus::Running, AdapterStatus::Completed]);
        assert_eq!(mock.get_status("s").await.unwrap().status, AdapterStatus::Running);
        assert_eq!(mock.get_status("s").await.unwrap().status, AdapterStatus::Running);
        assert_eq!(mock.get_status("s").await.unwrap().status, AdapterStatus::Completed);
        assert_eq!(mock.get_status("s").await.unwrap().status, AdapterStatus::Completed);
    }

    #[tokio::test]
    async fn mock_adapter_can_be_scripted_to_fail() {
        let mock = MockAdapter::new();
        mock.set_fail_create(true);
        let req = CreateScanRequest { targets: "10.0.0.1".to_string(), name: "n".to_string(), credentials: None };
        assert!(mock.create_scan(&req).await.is_err());
    }
}
