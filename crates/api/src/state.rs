use std::sync::Arc;

use renderfarm_pipeline::JobGroupManager;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Owner of every job group and its event channel.
    pub manager: Arc<JobGroupManager>,
}
