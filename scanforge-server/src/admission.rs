//! Admission surface (spec §4.1, C8): the RPC/HTTP handlers callers drive to
//! submit scans, poll status, fetch results, and introspect pools/queues.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use scanforge_core::error::ScanforgeError;
use scanforge_core::idempotency::{FingerprintInput, IdempotencyOutcome};
use scanforge_core::model::{
    Credentials, ElevationMethod, QueueEntry, ScanPayload, ScanType, SchemaProfile, Task, TaskStatus,
};
use scanforge_core::{ids, target_filter, validation};
use scanforge_engine::result_pipeline;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitUntrustedScanRequest {
    pub targets: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub scanner_pool: Option<String>,
    #[serde(default)]
    pub scanner_instance_id: Option<String>,
    #[serde(default)]
    pub schema_profile: Option<SchemaProfile>,
    #[serde(default)]
    pub custom_fields: Option<Vec<String>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitAuthenticatedScanRequest {
    pub targets: String,
    pub name: String,
    pub credentials: Credentials,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub scanner_pool: Option<String>,
    #[serde(default)]
    pub scanner_instance_id: Option<String>,
    #[serde(default)]
    pub schema_profile: Option<SchemaProfile>,
    #[serde(default)]
    pub custom_fields: Option<Vec<String>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitScanResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub duplicate: bool,
}

pub async fn submit_untrusted_scan(
    State(state): State<AppState>,
    Json(req): Json<SubmitUntrustedScanRequest>,
) -> Result<Json<SubmitScanResponse>, ApiError> {
    let task = submit(
        &state,
        ScanType::Untrusted,
        req.targets,
        req.name,
        req.description,
        None,
        req.scanner_pool,
        req.scanner_instance_id,
        req.schema_profile,
        req.custom_fields,
        req.idempotency_key,
    )
    .await?;
    Ok(Json(task))
}

pub async fn submit_authenticated_scan(
    State(state): State<AppState>,
    Json(req): Json<SubmitAuthenticatedScanRequest>,
) -> Result<Json<SubmitScanResponse>, ApiError> {
    // Escalation beyond `Nothing` is what distinguishes the "privileged"
    // variant from plain authenticated (spec §4.2's two authenticated scan
    // types share one submission shape differing only by elevation method).
    let scan_type = if req.credentials.elevate_privileges_with == ElevationMethod::Nothing {
        ScanType::Authenticated
    } else {
        ScanType::AuthenticatedPrivileged
    };

    let task = submit(
        &state,
        scan_type,
        req.targets,
        req.name,
        req.description,
        Some(req.credentials),
        req.scanner_pool,
        req.scanner_instance_id,
        req.schema_profile,
        req.custom_fields,
        req.idempotency_key,
    )
    .await?;
    Ok(Json(task))
}

#[allow(clippy::too_many_arguments)]
async fn submit(
    state: &AppState,
    scan_type: ScanType,
    targets: String,
    name: String,
    description: Option<String>,
    credentials: Option<Credentials>,
    scanner_pool: Option<String>,
    scanner_instance_id: Option<String>,
    schema_profile: Option<SchemaProfile>,
    custom_fields: Option<Vec<String>>,
    idempotency_key: Option<String>,
) -> scanforge_core::error::Result<SubmitScanResponse> {
    validation::validate_targets(&targets)?;
    validation::validate_name(&name)?;
    validation::validate_credentials(scan_type, credentials.as_ref())?;

    let pool = scanner_pool.unwrap_or_else(|| state.config.default_pool.clone());
    if !state.registry.list_pools().contains(&pool) {
        return Err(ScanforgeError::NotFound(format!("scanner_pool {pool}")));
    }
    if let Some(instance_id) = &scanner_instance_id {
        let known = state.registry.get_pool_status(&pool).instances.iter().any(|i| &i.instance_id == instance_id);
        if !known {
            return Err(ScanforgeError::NotFound(format!(
                "scanner_instance_id {instance_id} in pool {pool}"
            )));
        }
    }

    let fingerprint_input = FingerprintInput {
        scan_type,
        targets: &targets,
        name: &name,
        description: description.as_deref(),
        credentials: credentials.as_ref(),
        idempotency_key: idempotency_key.as_deref(),
    };

    let candidate_task_id = ids::new_task_id(&pool);
    let outcome = state.idempotency.check_and_reserve(&fingerprint_input, &candidate_task_id).await?;

    match outcome {
        IdempotencyOutcome::Conflict => Err(ScanforgeError::Conflict(
            "idempotency_key reused with a different request body".to_string(),
        )),
        IdempotencyOutcome::Duplicate { task_id } => {
            let task = state.task_store.read(&task_id).await?;
            Ok(SubmitScanResponse { task_id: task.task_id, status: task.status, duplicate: true })
        }
        IdempotencyOutcome::Fresh => {
            let payload = ScanPayload {
                targets,
                name,
                description,
                credentials,
                schema_profile,
                custom_fields,
            };
            let trace_id = ids::new_trace_id();
            let mut task = Task::new(candidate_task_id.clone(), trace_id.clone(), scan_type, pool.clone(), "nessus".to_string(), payload.clone(), Utc::now());
            if let Some(instance_id) = scanner_instance_id.clone() {
                task.scanner_instance_id = Some(instance_id);
            }
            state.task_store.create(&task).await?;

            let entry = QueueEntry {
                task_id: candidate_task_id.clone(),
                trace_id,
                scanner_pool: pool.clone(),
                scan_type,
                scanner_instance_id,
                payload,
                error: None,
                failed_at: None,
            };
            state.queue.enqueue(&pool, &entry).await?;

            Ok(SubmitScanResponse { task_id: candidate_task_id, status: TaskStatus::Queued, duplicate: false })
        }
    }
}

pub async fn get_status(State(state): State<AppState>, Path(task_id): Path<String>) -> Result<Json<Value>, ApiError> {
    let task = state.task_store.read(&task_id).await.map_err(to_not_found(&task_id))?;
    let results_summary = task.validation_stats.as_ref().map(result_pipeline::compute_results_summary);
    Ok(Json(json!({
        "task_id": task.task_id,
        "trace_id": task.trace_id,
        "status": task.status,
        "scan_type": task.scan_type,
        "scanner_pool": task.scanner_pool,
        "scanner_instance_id": task.scanner_instance_id,
        "targets": task.payload.targets,
        "name": task.payload.name,
        "progress": task.progress,
        "created_at": task.created_at,
        "started_at": task.started_at,
        "completed_at": task.completed_at,
        "error_message": task.error_message,
        "authentication_status": task.authentication_status,
        "validation_warnings": task.validation_warnings,
        "results_summary": results_summary,
    })))
}

#[derive(Debug, Deserialize)]
pub struct GetResultsQuery {
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub schema_profile: Option<SchemaProfile>,
    #[serde(default)]
    pub custom_fields: Option<String>,
    #[serde(flatten)]
    pub filters: HashMap<String, String>,
}

fn default_page_size() -> u32 {
    40
}

const RESERVED_QUERY_KEYS: &[&str] = &["page", "page_size", "schema_profile", "custom_fields"];

pub async fn get_results(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<GetResultsQuery>,
) -> Result<String, ApiError> {
    let task = state.task_store.read(&task_id).await.map_err(to_not_found(&task_id))?;
    if task.status != TaskStatus::Completed {
        return Err(ScanforgeError::Conflict(format!("results are not available until the task completes (status={:?})", task.status)).into());
    }

    let bytes = state.task_store.read_export(&task_id).await?;
    let profile = query.schema_profile.or(task.payload.schema_profile).unwrap_or_default();
    let custom_fields: Option<Vec<String>> = query
        .custom_fields
        .as_deref()
        .map(|s| s.split(',').map(|f| f.trim().to_string()).collect())
        .or_else(|| task.payload.custom_fields.clone());

    let filters: HashMap<String, String> =
        query.filters.into_iter().filter(|(k, _)| !RESERVED_QUERY_KEYS.contains(&k.as_str())).collect();

    let lines = result_pipeline::get_results(
        &task,
        &bytes,
        query.page,
        query.page_size,
        profile,
        custom_fields.as_deref(),
        &filters,
        task.validation_stats.as_ref(),
    )?;
    Ok(lines.join("\n"))
}

pub async fn list_scanners(State(state): State<AppState>) -> Json<Value> {
    let pools = state.registry.list_pools();
    let statuses: Vec<Value> = pools
        .iter()
        .map(|pool| {
            let status = state.registry.get_pool_status(pool);
            json!({
                "pool": status.pool,
                "capacity": status.capacity,
                "active_scans": status.active_scans,
                "instances": status.instances.iter().map(|i| json!({
                    "instance_id": i.instance_id,
                    "url": i.url,
                    "enabled": i.enabled,
                    "active_scans": i.active_scans,
                    "max_concurrent_scans": i.max_concurrent_scans,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    Json(json!({ "scanners": statuses }))
}

pub async fn list_pools(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "pools": state.registry.list_pools() }))
}

pub async fn get_pool_status(State(state): State<AppState>, Path(pool): Path<String>) -> Json<Value> {
    let status = state.registry.get_pool_status(&pool);
    Json(json!({
        "pool": status.pool,
        "capacity": status.capacity,
        "active_scans": status.active_scans,
        "instances": status.instances,
    }))
}

pub async fn get_queue_status(State(state): State<AppState>, Path(pool): Path<String>) -> Result<Json<Value>, ApiError> {
    let depth = state.queue.get_depth(&pool).await?;
    let dlq_size = state.queue.get_dlq_size(&pool).await?;
    Ok(Json(json!({ "pool": pool, "queue_depth": depth, "dlq_depth": dlq_size })))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub scanner_pool: Option<String>,
    #[serde(default)]
    pub target_filter: Option<String>,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    100
}

pub async fn list_tasks(State(state): State<AppState>, Query(query): Query<ListTasksQuery>) -> Result<Json<Value>, ApiError> {
    let ids = state.task_store.list_task_ids().await?;
    let mut matched = Vec::new();

    for task_id in ids {
        if matched.len() >= query.limit {
            break;
        }
        let Ok(task) = state.task_store.read(&task_id).await else { continue };

        if let Some(status) = query.status {
            if task.status != status {
                continue;
            }
        }
        if let Some(pool) = &query.scanner_pool {
            if &task.scanner_pool != pool {
                continue;
            }
        }
        if let Some(filter) = &query.target_filter {
            if !target_filter::targets_match(&task.payload.targets, filter) {
                continue;
            }
        }
        matched.push(json!({
            "task_id": task.task_id,
            "status": task.status,
            "scan_type": task.scan_type,
            "scanner_pool": task.scanner_pool,
            "created_at": task.created_at,
        }));
    }

    Ok(Json(json!({ "tasks": matched })))
}

fn to_not_found(task_id: &str) -> impl Fn(ScanforgeError) -> ApiError + '_ {
    move |_| ApiError(ScanforgeError::NotFound(format!("task {task_id}")))
}

pub async fn health(State(state): State<AppState>) -> (axum::http::StatusCode, Json<Value>) {
    let redis_healthy = state.kv.ping().await.is_ok();

    let sentinel = state.config.data_dir.join(".health_probe");
    let filesystem_healthy = std::fs::create_dir_all(&state.config.data_dir).is_ok()
        && std::fs::write(&sentinel, b"ok").is_ok()
        && std::fs::remove_file(&sentinel).is_ok();

    let status = if redis_healthy && filesystem_healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "redis_healthy": redis_healthy, "filesystem_healthy": filesystem_healthy })))
}

pub async fn metrics(State(state): State<AppState>) -> Result<(axum::http::HeaderMap, Vec<u8>), ApiError> {
    state.metrics.refresh_gauges(&state.registry, &state.queue).await;
    let body = state.metrics.gather()?;
    let mut headers = axum::http::HeaderMap::new();
    headers.insert(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4".parse().unwrap());
    Ok((headers, body))
}
