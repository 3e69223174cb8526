//! Per-group event fan-out for the render-farm scheduler.
//!
//! - [`EventBroadcaster`]: one `tokio::sync::broadcast` channel per job
//!   group; publishing never waits on subscribers.
//! - [`GroupEventStream`]: a subscriber's view: a synthetic
//!   `InitialState` first, then live events, ending after `GroupComplete`.

pub mod broadcaster;

pub use broadcaster::{EventBroadcaster, GroupEventStream};
