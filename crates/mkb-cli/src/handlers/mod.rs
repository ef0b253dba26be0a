//! Request handlers, grouped by feature.

pub mod chat;
pub mod files;
pub mod plan;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::serve_cmd::AppError;

/// `?user_id=` (or `?tenant_id=`) on tenant-scoped GET/DELETE routes.
#[derive(Debug, Default, Deserialize)]
pub struct TenantQuery {
    #[serde(default, alias = "user_id")]
    pub tenant_id: String,
}

/// Unwrap a JSON body, turning axum's rejection into our error shape.
pub(crate) fn parse_json<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(AppError::new(
            rejection.status(),
            format!("Invalid request format: {}", rejection.body_text()),
        )),
    }
}

pub async fn health() -> axum::response::Response {
    Json(serde_json::json!({
        "status": "ok",
        "time": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}
