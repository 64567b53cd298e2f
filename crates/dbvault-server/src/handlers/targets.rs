//! Target API handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};

use dbvault_core::{Target, TargetInput};

use crate::{AppError, AppState, AuthContext, Role, SuccessResponse};

#[derive(serde::Serialize)]
pub struct TestConnectionResponse {
    pub ok: bool,
    pub message: String,
}

/// GET /automation/targets
pub async fn list_targets(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Target>>, AppError> {
    auth.require(Role::Read)?;
    Ok(Json(state.engine.store().list_targets()?))
}

/// POST /automation/targets
pub async fn create_target(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<TargetInput>,
) -> Result<Json<Target>, AppError> {
    auth.require(Role::Configure)?;
    Ok(Json(state.engine.store().create_target(input)?))
}

/// GET /automation/targets/:id
pub async fn get_target(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Target>, AppError> {
    auth.require(Role::Read)?;
    let target = state
        .engine
        .store()
        .get_target(&id)?
        .ok_or_else(|| AppError::not_found("Target not found"))?;
    Ok(Json(target))
}

/// PUT /automation/targets/:id
pub async fn update_target(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(input): Json<TargetInput>,
) -> Result<Json<Target>, AppError> {
    auth.require(Role::Configure)?;
    Ok(Json(state.engine.store().update_target(&id, input)?))
}

/// DELETE /automation/targets/:id
pub async fn delete_target(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    auth.require(Role::Configure)?;
    state.engine.store().delete_target(&id)?;
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /automation/targets/test-connection, a dry run against an unsaved
/// config
pub async fn test_target_connection(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<TargetInput>,
) -> Result<Json<TestConnectionResponse>, AppError> {
    auth.require(Role::Configure)?;
    match state.engine.test_target_connection(input).await {
        Ok(message) => Ok(Json(TestConnectionResponse { ok: true, message })),
        Err(e) => Ok(Json(TestConnectionResponse {
            ok: false,
            message: e.to_string(),
        })),
    }
}
