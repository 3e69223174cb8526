//! Handlers for the `/backends` resource.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::Json;
use renderfarm_core::backend::BackendDescriptor;

use crate::error::AppResult;
use crate::query::CapabilityParams;
use crate::state::AppState;

/// GET /api/v1/backends
///
/// Every configured backend advertising all requested capabilities, with
/// its current online/busy status.
pub async fn list_backends(
    State(state): State<AppState>,
    params: Result<Query<CapabilityParams>, QueryRejection>,
) -> AppResult<Json<Vec<BackendDescriptor>>> {
    let Query(params) = params?;
    let backends = state.manager.list_backends(&params.tags()).await?;
    Ok(Json(backends))
}
