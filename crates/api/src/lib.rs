//! Render-farm scheduler HTTP server library.
//!
//! Exposes config, state, error handling, routes and the WebSocket event
//! stream so integration tests and the binary entrypoint share them.

pub mod background;
pub mod config;
pub mod error;
pub mod handlers;
pub mod query;
pub mod router;
pub mod routes;
pub mod state;
pub mod ws;
