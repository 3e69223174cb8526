//! ComfyUI worker backend for the render-farm scheduler.
//!
//! Implements the scheduler's collaborator traits on top of ComfyUI's
//! REST and WebSocket interfaces: [`registry::ComfyUIRegistry`] lists and
//! probes configured instances, [`backend::ComfyUIBackend`] drives one
//! prompt over a dedicated connection, and [`patch::ComfyUIPatcher`]
//! injects seeds and parameter overrides into API-format workflows.

pub mod api;
pub mod backend;
pub mod client;
pub mod messages;
pub mod patch;
pub mod registry;

pub use backend::ComfyUIBackend;
pub use patch::ComfyUIPatcher;
pub use registry::{ComfyUIRegistry, InstanceConfig};
