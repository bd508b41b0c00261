//! Axum router wiring: the admission surface plus the ops endpoints
//! (`/health`, `/metrics`) every instance exposes regardless of scan_type.

use axum::routing::{get, post};
use axum::Router;

use crate::admission;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(admission::health))
        .route("/metrics", get(admission::metrics))
        .route("/tools/submit_untrusted_scan", post(admission::submit_untrusted_scan))
        .route("/tools/submit_authenticated_scan", post(admission::submit_authenticated_scan))
        .route("/tools/get_status/:task_id", get(admission::get_status))
        .route("/tools/get_results/:task_id", get(admission::get_results))
        .route("/tools/list_scanners", get(admission::list_scanners))
        .route("/tools/list_pools", get(admission::list_pools))
        .route("/tools/get_pool_status/:pool", get(admission::get_pool_status))
        .route("/tools/get_queue_status/:pool", get(admission::get_queue_status))
        .route("/tools/list_tasks", get(admission::list_tasks))
        .with_state(state)
}
