//! Destination API handlers, including artifact browsing

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::Response,
    Extension, Json,
};
use tokio_util::io::ReaderStream;

use dbvault_core::{ArtifactInfo, Destination, DestinationInput};

use crate::{AppError, AppState, AuthContext, Role, SuccessResponse, MAX_PAGE_LIMIT};

use super::targets::TestConnectionResponse;

/// GET /automation/destinations
pub async fn list_destinations(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Destination>>, AppError> {
    auth.require(Role::Read)?;
    Ok(Json(state.engine.store().list_destinations()?))
}

/// POST /automation/destinations
pub async fn create_destination(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<DestinationInput>,
) -> Result<Json<Destination>, AppError> {
    auth.require(Role::Configure)?;
    Ok(Json(state.engine.store().create_destination(input)?))
}

/// GET /automation/destinations/:id
pub async fn get_destination(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Destination>, AppError> {
    auth.require(Role::Read)?;
    let destination = state
        .engine
        .store()
        .get_destination(&id)?
        .ok_or_else(|| AppError::not_found("Destination not found"))?;
    Ok(Json(destination))
}

/// PUT /automation/destinations/:id
pub async fn update_destination(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(input): Json<DestinationInput>,
) -> Result<Json<Destination>, AppError> {
    auth.require(Role::Configure)?;
    let destination = state.engine.store().update_destination(&id, input)?;
    // A stale client would keep using the old config/credentials
    state.engine.invalidate_adapter(&id);
    Ok(Json(destination))
}

/// DELETE /automation/destinations/:id
pub async fn delete_destination(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    auth.require(Role::Configure)?;
    state.engine.store().delete_destination(&id)?;
    state.engine.invalidate_adapter(&id);
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /automation/destinations/test-connection
pub async fn test_destination_connection(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<DestinationInput>,
) -> Result<Json<TestConnectionResponse>, AppError> {
    auth.require(Role::Configure)?;
    match state.engine.test_destination_connection(input).await {
        Ok(message) => Ok(Json(TestConnectionResponse { ok: true, message })),
        Err(e) => Ok(Json(TestConnectionResponse {
            ok: false,
            message: e.to_string(),
        })),
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct ListBackupsQuery {
    pub target_id: Option<String>,
    #[serde(default)]
    pub include_total: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(serde::Serialize)]
pub struct BackupListResponse {
    pub items: Vec<ArtifactInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

/// GET /automation/destinations/:id/backups
pub async fn list_backups(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(query): Query<ListBackupsQuery>,
) -> Result<Json<BackupListResponse>, AppError> {
    auth.require(Role::Read)?;
    let limit = query.limit.unwrap_or(100).clamp(1, MAX_PAGE_LIMIT) as usize;
    let offset = query.offset.unwrap_or(0).max(0) as usize;

    let (items, total) = state
        .engine
        .list_backups(
            &id,
            query.target_id.as_deref(),
            query.include_total,
            limit,
            offset,
        )
        .await?;
    Ok(Json(BackupListResponse { items, total }))
}

#[derive(Debug, serde::Deserialize)]
pub struct DownloadQuery {
    pub backup_id: String,
    pub filename: String,
}

/// GET /automation/destinations/:id/backups/download (streamed bytes)
pub async fn download_backup(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    auth.require(Role::Read)?;
    stream_artifact(&state, &id, &query.backup_id, &query.filename).await
}

#[derive(Debug, serde::Deserialize)]
pub struct DeleteBackupQuery {
    pub backup_id: String,
    pub name: String,
}

/// DELETE /automation/destinations/:id/backups/delete
pub async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Query(query): Query<DeleteBackupQuery>,
) -> Result<Json<SuccessResponse>, AppError> {
    auth.require(Role::Delete)?;
    state
        .engine
        .delete_backup(&id, &query.backup_id, &query.name)
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// Fetch an artifact into a spool file and stream it out. The open file
/// handle keeps the bytes alive after the spool directory is dropped.
pub(crate) async fn stream_artifact(
    state: &AppState,
    destination_id: &str,
    backup_id: &str,
    filename: &str,
) -> Result<Response, AppError> {
    let (spool, path) = state
        .engine
        .fetch_backup(destination_id, backup_id, filename)
        .await?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| AppError::internal(&format!("Failed to open spooled artifact: {}", e)))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| AppError::internal(&format!("Failed to stat spooled artifact: {}", e)))?
        .len();
    drop(spool);

    Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::internal(&format!("Failed to build response: {}", e)))
}
