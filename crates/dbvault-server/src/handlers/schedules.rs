//! Schedule API handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Extension, Json,
};

use dbvault_core::{QueuedRun, Schedule, ScheduleInput};

use crate::{AppError, AppState, AuthContext, Role, SuccessResponse};

/// GET /automation/schedules
pub async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Schedule>>, AppError> {
    auth.require(Role::Read)?;
    Ok(Json(state.engine.store().list_schedules()?))
}

/// POST /automation/schedules
pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<ScheduleInput>,
) -> Result<Json<Schedule>, AppError> {
    auth.require(Role::Configure)?;
    let schedule = state.engine.store().create_schedule(input)?;
    state.engine.wake_scheduler();
    Ok(Json(schedule))
}

/// GET /automation/schedules/:id
pub async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Schedule>, AppError> {
    auth.require(Role::Read)?;
    let schedule = state
        .engine
        .store()
        .get_schedule(&id)?
        .ok_or_else(|| AppError::not_found("Schedule not found"))?;
    Ok(Json(schedule))
}

/// PUT /automation/schedules/:id
pub async fn update_schedule(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(input): Json<ScheduleInput>,
) -> Result<Json<Schedule>, AppError> {
    auth.require(Role::Configure)?;
    let schedule = state.engine.store().update_schedule(&id, input)?;
    state.engine.wake_scheduler();
    Ok(Json(schedule))
}

/// DELETE /automation/schedules/:id
pub async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    auth.require(Role::Configure)?;
    state.engine.store().delete_schedule(&id)?;
    state.engine.wake_scheduler();
    Ok(Json(SuccessResponse { success: true }))
}

/// POST /automation/schedules/:id/run-now
///
/// Refuses with 409 BUSY while a run of the schedule is active.
pub async fn run_schedule_now(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<QueuedRun>, AppError> {
    auth.require(Role::Run)?;
    Ok(Json(state.engine.run_schedule_now(&id)?))
}

#[derive(Debug, serde::Deserialize)]
pub struct RunEnabledNowRequest {
    pub max_schedules: Option<usize>,
}

#[derive(serde::Serialize)]
pub struct RunEnabledNowResponse {
    pub queued: Vec<QueuedRun>,
}

/// POST /automation/schedules/run-enabled-now
pub async fn run_enabled_now(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<RunEnabledNowRequest>,
) -> Result<Json<RunEnabledNowResponse>, AppError> {
    auth.require(Role::Run)?;
    let max = request.max_schedules.unwrap_or(usize::MAX);
    let queued = state.engine.run_enabled_now(max)?;
    Ok(Json(RunEnabledNowResponse { queued }))
}
