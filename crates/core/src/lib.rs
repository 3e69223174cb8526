//! Domain types and pure logic for the render-farm job scheduler.
//!
//! Everything here is free of I/O: identifiers, the job-group data model
//! and its state machines, seed variation strategies, the event taxonomy
//! streamed to subscribers, and the collaborator traits that the
//! execution engine drives (backend registry, backend handle, job-spec
//! patcher).

pub mod backend;
pub mod error;
pub mod events;
pub mod job_group;
pub mod seeds;
pub mod types;
