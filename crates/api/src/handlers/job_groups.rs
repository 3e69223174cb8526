//! Handlers for the `/job-groups` resource.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use renderfarm_core::job_group::{
    CancelSummary, GroupSummary, JobGroupRequest, JobGroupSnapshot,
};
use renderfarm_core::types::GroupId;

use crate::error::AppResult;
use crate::state::AppState;

/// POST /api/v1/job-groups
///
/// Fan a job spec out to the requested backends. Returns 201 as soon as
/// every child is queued; progress is followed on the events stream.
pub async fn submit_group(
    State(state): State<AppState>,
    payload: Result<Json<JobGroupRequest>, JsonRejection>,
) -> AppResult<impl IntoResponse> {
    let Json(request) = payload?;
    let response = state.manager.create_and_execute(request).await?;

    tracing::info!(
        group_id = %response.group_id,
        children = response.children.len(),
        "Job group submitted",
    );

    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/v1/job-groups
pub async fn list_groups(State(state): State<AppState>) -> Json<Vec<GroupSummary>> {
    Json(state.manager.list().await)
}

/// GET /api/v1/job-groups/{id}
pub async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> AppResult<Json<JobGroupSnapshot>> {
    Ok(Json(state.manager.get_status(group_id).await?))
}

/// POST /api/v1/job-groups/{id}/cancel
///
/// Idempotent: cancelling a finished group reports every child as
/// already terminal.
pub async fn cancel_group(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> AppResult<Json<CancelSummary>> {
    Ok(Json(state.manager.cancel(group_id).await?))
}

/// DELETE /api/v1/job-groups/{id}
///
/// Release a finished group. Returns 409 while children are still running.
pub async fn acknowledge_group(
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> AppResult<StatusCode> {
    state.manager.acknowledge(group_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
