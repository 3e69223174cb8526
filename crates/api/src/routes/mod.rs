pub mod backends;
pub mod health;
pub mod job_groups;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /backends                              list render backends
///
/// /job-groups                            list, submit
/// /job-groups/{id}                       status, acknowledge (DELETE)
/// /job-groups/{id}/cancel                cancel (POST)
/// /job-groups/{id}/events                WebSocket event stream
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/backends", backends::router())
        .nest("/job-groups", job_groups::router())
}
