//! Events streamed to job-group subscribers.
//!
//! Serialized as internally tagged JSON, one object per message:
//!
//! ```json
//! {"type": "child_progress", "job_id": "...", "backend_id": "gpu-a",
//!  "progress": 40, "current_step": "KSampler"}
//! ```

use serde::{Deserialize, Serialize};

use crate::job_group::{
    ChildError, ChildErrorKind, ChildJob, ChildStatus, GroupStatus, JobGroupSnapshot,
};
use crate::types::{BackendId, GroupId, JobId, Seed, Timestamp};

/// Final state of one child, as carried by [`GroupEvent::GroupComplete`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildResult {
    pub job_id: JobId,
    pub backend_id: BackendId,
    pub seed: Seed,
    pub status: ChildStatus,
    pub outputs: Option<serde_json::Value>,
    pub error: Option<ChildError>,
}

impl From<&ChildJob> for ChildResult {
    fn from(child: &ChildJob) -> Self {
        Self {
            job_id: child.job_id,
            backend_id: child.backend_id.clone(),
            seed: child.seed,
            status: child.status,
            outputs: child.outputs.clone(),
            error: child.error.clone(),
        }
    }
}

/// A single event in a job group's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupEvent {
    /// Synthetic first event for every subscriber, built from a snapshot.
    InitialState {
        group_id: GroupId,
        status: GroupStatus,
        children: Vec<ChildJob>,
    },

    /// Progress as reported by the backend (not smoothed).
    ChildProgress {
        job_id: JobId,
        backend_id: BackendId,
        progress: u8,
        current_step: Option<String>,
    },

    ChildCompleted {
        job_id: JobId,
        backend_id: BackendId,
        seed: Seed,
        outputs: serde_json::Value,
        completed_at: Timestamp,
    },

    ChildFailed {
        job_id: JobId,
        backend_id: BackendId,
        error_kind: ChildErrorKind,
        error_message: String,
    },

    ChildTimeout {
        job_id: JobId,
        backend_id: BackendId,
        timeout_seconds: u64,
    },

    ChildCancelled { job_id: JobId, backend_id: BackendId },

    /// Emitted exactly once, when every child is terminal.
    GroupComplete {
        group_id: GroupId,
        status: GroupStatus,
        total: usize,
        succeeded: usize,
        /// Failed plus timed out.
        failed: usize,
        cancelled: usize,
        results: Vec<ChildResult>,
    },
}

impl GroupEvent {
    /// Build the synthetic `InitialState` event for a late subscriber.
    pub fn initial_state(snapshot: &JobGroupSnapshot) -> Self {
        GroupEvent::InitialState {
            group_id: snapshot.group_id,
            status: snapshot.status,
            children: snapshot.children.clone(),
        }
    }

    /// Build the `GroupComplete` event from a snapshot whose children are
    /// all terminal.
    pub fn group_complete(snapshot: &JobGroupSnapshot) -> Self {
        GroupEvent::GroupComplete {
            group_id: snapshot.group_id,
            status: snapshot.status,
            total: snapshot.counts.total,
            succeeded: snapshot.counts.completed_count,
            failed: snapshot.counts.failed_count,
            cancelled: snapshot.counts.cancelled_count,
            results: snapshot.children.iter().map(ChildResult::from).collect(),
        }
    }

    /// Wire tag of this event, e.g. `"child_progress"`.
    pub fn kind(&self) -> &'static str {
        match self {
            GroupEvent::InitialState { .. } => "initial_state",
            GroupEvent::ChildProgress { .. } => "child_progress",
            GroupEvent::ChildCompleted { .. } => "child_completed",
            GroupEvent::ChildFailed { .. } => "child_failed",
            GroupEvent::ChildTimeout { .. } => "child_timeout",
            GroupEvent::ChildCancelled { .. } => "child_cancelled",
            GroupEvent::GroupComplete { .. } => "group_complete",
        }
    }

    /// The child this event is about, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            GroupEvent::ChildProgress { job_id, .. }
            | GroupEvent::ChildCompleted { job_id, .. }
            | GroupEvent::ChildFailed { job_id, .. }
            | GroupEvent::ChildTimeout { job_id, .. }
            | GroupEvent::ChildCancelled { job_id, .. } => Some(*job_id),
            GroupEvent::InitialState { .. } | GroupEvent::GroupComplete { .. } => None,
        }
    }

    /// Whether this is the final event of the stream.
    pub fn is_group_complete(&self) -> bool {
        matches!(self, GroupEvent::GroupComplete { .. })
    }
}
