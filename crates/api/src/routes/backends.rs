//! Route definitions for the `/backends` resource.

use axum::routing::get;
use axum::Router;

use crate::handlers::backends;
use crate::state::AppState;

/// Routes mounted at `/backends`.
///
/// ```text
/// GET    /                -> list_backends (?capabilities=a,b)
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(backends::list_backends))
}
