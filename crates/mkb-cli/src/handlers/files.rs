//! Tenant file upload, listing, download, deletion, and processing status.

use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, Query, State};
use axum::response::{IntoResponse, Redirect};
use serde_json::json;

use mkb_core::files::KbCleanup;

use super::TenantQuery;
use crate::serve_cmd::{AppError, AppState};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

struct PendingFile {
    name: String,
    content_type: String,
    body: Vec<u8>,
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), format!("Failed to parse form: {}", err.body_text()))
}

fn require_tenant(tenant_id: &str) -> Result<(), AppError> {
    if tenant_id.trim().is_empty() {
        return Err(AppError::bad_request("tenant_id is required"));
    }
    Ok(())
}

/// `POST /upload`: multipart form with a `user_id` (or `tenant_id`) field
/// and one or more `file` parts.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<axum::response::Response, AppError> {
    let mut tenant_id = String::new();
    let mut pending = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let field_name = field.name().map(str::to_owned);
        match field_name.as_deref() {
            Some("user_id" | "tenant_id") => {
                tenant_id = field.text().await.map_err(multipart_error)?;
            }
            Some("file") => {
                let name = field.file_name().unwrap_or_default().to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or(DEFAULT_CONTENT_TYPE)
                    .to_string();
                let body = field.bytes().await.map_err(multipart_error)?.to_vec();
                pending.push(PendingFile {
                    name,
                    content_type,
                    body,
                });
            }
            _ => {}
        }
    }

    require_tenant(&tenant_id)?;
    if pending.is_empty() {
        return Err(AppError::bad_request("No file uploaded"));
    }
    tracing::info!(tenant_id = %tenant_id, count = pending.len(), "upload request");

    let mut uploaded = Vec::with_capacity(pending.len());
    for file in pending {
        let stored = state
            .files
            .upload_file(&tenant_id, &file.name, file.body, &file.content_type)
            .await?;
        uploaded.push(stored);
    }

    Ok(Json(json!({
        "message": "Files uploaded successfully",
        "files": uploaded,
    }))
    .into_response())
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
) -> Result<axum::response::Response, AppError> {
    require_tenant(&query.tenant_id)?;
    let files = state.files.list_files(&query.tenant_id).await?;
    Ok(Json(json!({
        "files": files,
        "user_id": query.tenant_id,
    }))
    .into_response())
}

/// Redirects to a short-lived signed URL for the stored object.
pub async fn download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(query): Query<TenantQuery>,
) -> Result<axum::response::Response, AppError> {
    require_tenant(&query.tenant_id)?;
    let url = state.files.download_url(&query.tenant_id, &filename).await?;
    Ok(Redirect::temporary(&url).into_response())
}

pub async fn delete(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    Query(query): Query<TenantQuery>,
) -> Result<axum::response::Response, AppError> {
    require_tenant(&query.tenant_id)?;
    let outcome = state.files.delete_file(&query.tenant_id, &filename).await?;

    let mut body = json!({
        "message": outcome.message(),
        "key": outcome.key,
        "doc_id": outcome.doc_id,
        "user_id": query.tenant_id,
    });
    if let KbCleanup::LookupFailed(detail) | KbCleanup::DeleteFailed(detail) = &outcome.kb {
        body["warning"] = json!(detail);
    }
    Ok(Json(body).into_response())
}

pub async fn document_status(
    State(state): State<AppState>,
    Query(query): Query<TenantQuery>,
) -> Result<axum::response::Response, AppError> {
    require_tenant(&query.tenant_id)?;
    let status = state.files.document_status(&query.tenant_id).await?;
    Ok(Json(json!({
        "document_status": status,
        "user_id": query.tenant_id,
    }))
    .into_response())
}
