//! Maps the shared error taxonomy onto HTTP status codes for the admission
//! surface (spec §8).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use scanforge_core::error::ScanforgeError;
use serde_json::json;

pub struct ApiError(pub ScanforgeError);

impl From<ScanforgeError> for ApiError {
    fn from(e: ScanforgeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ScanforgeError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ScanforgeError::NotFound(_) => StatusCode::NOT_FOUND,
            ScanforgeError::Conflict(_) => StatusCode::CONFLICT,
            ScanforgeError::StateTransition { .. } => StatusCode::CONFLICT,
            ScanforgeError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ScanforgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ScanforgeError::Scanner(_) => StatusCode::BAD_GATEWAY,
            ScanforgeError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
