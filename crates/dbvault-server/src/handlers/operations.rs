//! Imperative operations: backup-now, restore-now, and the built-in local
//! destination endpoints

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Response,
    Extension, Json,
};

use dbvault_core::engine::{BackupNowParams, RestoreNowParams};
use dbvault_core::{ArtifactInfo, Run, LOCAL_DESTINATION_ID};

use crate::{AppError, AppState, AuthContext, Role, SuccessResponse};

use super::destinations::stream_artifact;

#[derive(Debug, serde::Deserialize)]
pub struct BackupNowRequest {
    pub target_id: String,
    pub destination_ids: Option<Vec<String>>,
    #[serde(default)]
    pub use_local_storage: bool,
}

/// POST /automation/backup-now
///
/// Runs the backup on the worker pool and waits for the terminal run record.
pub async fn backup_now(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<BackupNowRequest>,
) -> Result<Json<Run>, AppError> {
    auth.require(Role::Create)?;
    let run = state
        .engine
        .backup_now(BackupNowParams {
            target_id: request.target_id,
            destination_ids: request.destination_ids,
            use_local_storage: request.use_local_storage,
        })
        .await?;
    Ok(Json(run))
}

#[derive(Debug, serde::Deserialize)]
pub struct RestoreNowRequest {
    pub target_id: String,
    pub backup_id: String,
    pub destination_id: Option<String>,
    #[serde(default)]
    pub use_local_storage: bool,
    #[serde(default)]
    pub confirmation: String,
    pub encryption_password: Option<String>,
}

/// POST /automation/restore-now
///
/// The confirmation must be the literal string `RESTORE`; a refused gate is
/// a 400 with no run recorded.
pub async fn restore_now(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<RestoreNowRequest>,
) -> Result<Json<Run>, AppError> {
    auth.require(Role::Restore)?;
    let run = state
        .engine
        .restore_now(RestoreNowParams {
            target_id: request.target_id,
            backup_id: request.backup_id,
            destination_id: request.destination_id,
            use_local_storage: request.use_local_storage,
            confirmation: request.confirmation,
            encryption_password: request.encryption_password,
        })
        .await?;
    Ok(Json(run))
}

/// GET|POST /backup/list (built-in local destination)
pub async fn local_list_backups(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<ArtifactInfo>>, AppError> {
    auth.require(Role::Read)?;
    let (items, _) = state
        .engine
        .list_backups(LOCAL_DESTINATION_ID, None, false, 1000, 0)
        .await?;
    Ok(Json(items))
}

/// Resolve a local artifact by bare filename.
async fn find_local_by_name(state: &AppState, filename: &str) -> Result<ArtifactInfo, AppError> {
    let (items, _) = state
        .engine
        .list_backups(LOCAL_DESTINATION_ID, None, false, 1000, 0)
        .await?;
    items
        .into_iter()
        .find(|a| a.name == filename)
        .ok_or_else(|| AppError::not_found("Backup not found"))
}

/// GET /backup/download/:filename
pub async fn local_download_backup(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    auth.require(Role::Read)?;
    let artifact = find_local_by_name(&state, &filename).await?;
    stream_artifact(&state, LOCAL_DESTINATION_ID, &artifact.id, &artifact.name).await
}

/// DELETE /backup/delete/:filename
///
/// Deletion is by name only; encrypted artifacts are not decrypted first.
pub async fn local_delete_backup(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(filename): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    auth.require(Role::Delete)?;
    let artifact = find_local_by_name(&state, &filename).await?;
    state
        .engine
        .delete_backup(LOCAL_DESTINATION_ID, &artifact.id, &artifact.name)
        .await?;
    Ok(Json(SuccessResponse { success: true }))
}
