//! Route definitions for the `/job-groups` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::job_groups;
use crate::state::AppState;
use crate::ws;

/// Routes mounted at `/job-groups`.
///
/// ```text
/// GET    /                -> list_groups
/// POST   /                -> submit_group
/// GET    /{id}            -> get_group
/// DELETE /{id}            -> acknowledge_group
/// POST   /{id}/cancel     -> cancel_group
/// GET    /{id}/events     -> group_events (WebSocket)
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(job_groups::list_groups).post(job_groups::submit_group),
        )
        .route(
            "/{id}",
            get(job_groups::get_group).delete(job_groups::acknowledge_group),
        )
        .route("/{id}/cancel", post(job_groups::cancel_group))
        .route("/{id}/events", get(ws::group_events_handler))
}
