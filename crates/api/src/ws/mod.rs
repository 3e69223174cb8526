//! WebSocket event streams for job groups.
//!
//! Each connection follows exactly one group: it receives an
//! `initial_state` frame, then every live event as a JSON text frame, and
//! is closed by the server after `group_complete`.

mod handler;

pub use handler::{group_events_handler, PING_INTERVAL};
