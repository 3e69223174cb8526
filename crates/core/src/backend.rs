//! Collaborator interfaces consumed by the execution engine.
//!
//! - [`BackendRegistry`] lists worker nodes and opens connections to them.
//! - [`BackendHandle`] is one child's private connection to one worker.
//! - [`JobSpecPatcher`] substitutes a seed and parameter overrides into an
//!   opaque [`JobSpec`].
//!
//! The registry is read-only from the scheduler's point of view. Handles are
//! owned by exactly one child and must be released with
//! [`BackendHandle::close`] on every exit path.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job_group::{ChildErrorKind, JobSpec, Parameters};
use crate::types::{BackendId, Seed};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// A worker node as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub id: BackendId,
    pub online: bool,
    pub busy: bool,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl BackendDescriptor {
    /// Whether this backend advertises every tag in `required`.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|req| self.capabilities.iter().any(|cap| cap == req))
    }
}

/// Source of worker nodes.
#[async_trait]
pub trait BackendRegistry: Send + Sync {
    /// List known backends with their current status.
    ///
    /// Implementations may pre-filter by `required_capabilities`; callers
    /// still check [`BackendDescriptor::has_capabilities`] themselves.
    async fn list_available(
        &self,
        required_capabilities: &[String],
    ) -> Result<Vec<BackendDescriptor>, BackendError>;

    /// Open a fresh connection to `backend_id`, owned by the caller.
    async fn connect(&self, backend_id: &str) -> Result<Box<dyn BackendHandle>, BackendError>;
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Backend-assigned reference to a submitted execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionRef(pub String);

impl std::fmt::Display for ExecutionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One observation from a running execution.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendUpdate {
    /// Progress report, 0-100, with the worker's current stage if known.
    Progress { progress: u8, step: Option<String> },
    /// Nothing new yet; the caller should wait one polling interval.
    Pending,
    /// The execution finished; outputs can be fetched.
    Finished,
    /// The worker reported an internal failure.
    Failed { message: String },
}

/// A single child's connection to a worker node.
#[async_trait]
pub trait BackendHandle: Send {
    fn backend_id(&self) -> &str;

    /// Submit a patched job spec for execution.
    async fn submit(&mut self, spec: &JobSpec) -> Result<ExecutionRef, BackendError>;

    /// Wait for the next observation of `execution`.
    ///
    /// Streaming backends block until a frame arrives; polling backends may
    /// return [`BackendUpdate::Pending`] immediately.
    async fn next_update(&mut self, execution: &ExecutionRef)
        -> Result<BackendUpdate, BackendError>;

    /// Retrieve the outputs of a finished execution.
    async fn fetch_outputs(
        &mut self,
        execution: &ExecutionRef,
    ) -> Result<serde_json::Value, BackendError>;

    /// Ask the worker to stop `execution`.
    async fn interrupt(&mut self, execution: &ExecutionRef) -> Result<(), BackendError>;

    /// Release connection resources. Must be safe to call once on any path.
    async fn close(&mut self);
}

/// Failures reported by backend collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Network failure, refused connection, or dropped socket.
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The backend refused the submitted spec.
    #[error("Submission rejected: {0}")]
    Rejected(String),

    /// The backend answered with something that could not be interpreted.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The worker failed while executing.
    #[error("Backend execution error: {0}")]
    Execution(String),
}

impl BackendError {
    /// Classification recorded on the failed child.
    pub fn kind(&self) -> ChildErrorKind {
        match self {
            BackendError::Unreachable(_) => ChildErrorKind::BackendUnreachable,
            BackendError::Rejected(_) => ChildErrorKind::SubmissionRejected,
            BackendError::Malformed(_) => ChildErrorKind::MalformedResponse,
            BackendError::Execution(_) => ChildErrorKind::BackendExecutionError,
        }
    }
}

// ---------------------------------------------------------------------------
// Patcher
// ---------------------------------------------------------------------------

/// Substitutes a seed and parameter overrides into a job spec.
///
/// Implementations must not mutate `spec`; they return a patched copy.
pub trait JobSpecPatcher: Send + Sync {
    fn patch_seed(
        &self,
        spec: &JobSpec,
        seed: Seed,
        parameters: &Parameters,
    ) -> Result<JobSpec, PatchError>;
}

/// Failure to patch a job spec.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Cannot patch job spec: {0}")]
pub struct PatchError(pub String);
