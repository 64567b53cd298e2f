//! Run history (audit) API handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};

use dbvault_core::{Operation, Run, RunFilter, Trigger};

use crate::{AppError, AppState, AuthContext, Role, MAX_PAGE_LIMIT};

#[derive(Debug, serde::Deserialize)]
pub struct RunQuery {
    pub target_id: Option<String>,
    pub operation: Option<String>,
    pub trigger: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(default)]
    pub include_total: bool,
}

#[derive(serde::Serialize)]
pub struct RunListResponse {
    pub runs: Vec<Run>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

/// GET /automation/audit
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<RunQuery>,
) -> Result<Json<RunListResponse>, AppError> {
    auth.require(Role::Read)?;

    let operation = query
        .operation
        .as_deref()
        .map(str::parse::<Operation>)
        .transpose()?;
    let trigger = query
        .trigger
        .as_deref()
        .map(str::parse::<Trigger>)
        .transpose()?;

    let filter = RunFilter {
        target_id: query.target_id,
        operation,
        trigger,
        since: query.since,
        until: query.until,
        limit: query.limit.unwrap_or(50).clamp(1, MAX_PAGE_LIMIT),
        offset: query.offset.unwrap_or(0).max(0),
        include_total: query.include_total,
    };
    let page = state.engine.store().list_runs(&filter)?;
    Ok(Json(RunListResponse {
        runs: page.runs,
        total: page.total,
    }))
}

/// GET /automation/audit/:id
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    auth.require(Role::Read)?;
    let run = state
        .engine
        .store()
        .get_run(&id)?
        .ok_or_else(|| AppError::not_found("Run not found"))?;
    Ok(Json(run))
}
