//! Job-group data model: requests, child jobs, state machines, and the
//! status aggregation rule.
//!
//! A job group fans one opaque [`JobSpec`] out to several backends. Each
//! backend gets one [`ChildJob`] with its own seed. The group's status is
//! derived from its children via [`aggregate_status`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::seeds::SeedStrategy;
use crate::types::{new_id, BackendId, GroupId, JobId, Seed, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Per-child timeout used when the request does not specify one.
pub const DEFAULT_TIMEOUT_SECS: i64 = 300;

/// Lower bound of the per-child timeout.
pub const MIN_TIMEOUT_SECS: i64 = 30;

/// Upper bound of the per-child timeout.
pub const MAX_TIMEOUT_SECS: i64 = 3600;

/// Upper bound on the number of backends a single group may target.
pub const MAX_TARGET_BACKENDS: usize = 64;

// ---------------------------------------------------------------------------
// Job spec
// ---------------------------------------------------------------------------

/// Opaque job description (for ComfyUI: the API-format workflow graph).
///
/// The scheduler never looks inside; it only hands the spec to a
/// [`crate::backend::JobSpecPatcher`], which returns a patched copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobSpec(pub serde_json::Value);

impl JobSpec {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// Side-table of parameter overrides applied alongside the seed.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Body of a job-group submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGroupRequest {
    pub job_spec: JobSpec,
    #[serde(default)]
    pub parameters: Parameters,
    /// Backends to fan out to. Empty means every available backend.
    #[serde(default)]
    pub target_backends: Vec<BackendId>,
    /// Wire name of a [`SeedStrategy`]; kept as a string so that unknown
    /// names surface as [`CoreError::InvalidSeedStrategy`].
    #[serde(default = "default_seed_strategy")]
    pub seed_strategy: String,
    #[serde(default)]
    pub base_seed: Option<Seed>,
    /// Opaque caller context (e.g. a panel identifier), echoed back in snapshots.
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    #[serde(default = "default_timeout_secs")]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

fn default_seed_strategy() -> String {
    SeedStrategy::default().as_str().to_string()
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

fn default_timeout_secs() -> i64 {
    DEFAULT_TIMEOUT_SECS
}

impl JobGroupRequest {
    /// Build a request with defaults for everything but the spec and targets.
    pub fn new(job_spec: JobSpec, target_backends: Vec<BackendId>) -> Self {
        Self {
            job_spec,
            parameters: Parameters::new(),
            target_backends,
            seed_strategy: default_seed_strategy(),
            base_seed: None,
            metadata: empty_object(),
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            required_capabilities: Vec::new(),
        }
    }

    /// Parse the requested seed strategy.
    pub fn strategy(&self) -> Result<SeedStrategy, CoreError> {
        self.seed_strategy.parse()
    }

    /// Resolve the per-child timeout (see [`resolve_timeout`]).
    pub fn timeout(&self) -> Result<Duration, CoreError> {
        resolve_timeout(self.timeout_seconds)
    }

    /// Validate everything that can be checked without the registry.
    ///
    /// Returns the parsed strategy and resolved timeout so callers do not
    /// need to parse twice.
    pub fn validate(&self) -> Result<(SeedStrategy, Duration), CoreError> {
        let strategy = self.strategy()?;
        let timeout = self.timeout()?;

        if self.target_backends.len() > MAX_TARGET_BACKENDS {
            return Err(CoreError::Validation(format!(
                "A job group may target at most {MAX_TARGET_BACKENDS} backends"
            )));
        }
        if let Some(i) = self.target_backends.iter().position(|b| b.trim().is_empty()) {
            return Err(CoreError::Validation(format!(
                "Target backend at index {i} must not be empty"
            )));
        }
        if !self.metadata.is_object() && !self.metadata.is_null() {
            return Err(CoreError::Validation(
                "metadata must be a JSON object".to_string(),
            ));
        }

        Ok((strategy, timeout))
    }

    /// Target backends with duplicates removed, first occurrence wins.
    pub fn distinct_targets(&self) -> Vec<BackendId> {
        let mut seen = std::collections::HashSet::new();
        self.target_backends
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }
}

/// Turn a requested timeout into a duration.
///
/// Non-positive values are rejected with [`CoreError::InvalidTimeout`];
/// positive values are clamped into `[MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS]`.
pub fn resolve_timeout(timeout_seconds: i64) -> Result<Duration, CoreError> {
    if timeout_seconds <= 0 {
        return Err(CoreError::InvalidTimeout(timeout_seconds));
    }
    let clamped = timeout_seconds.clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);
    Ok(Duration::from_secs(clamped as u64))
}

// ---------------------------------------------------------------------------
// Child job
// ---------------------------------------------------------------------------

/// Lifecycle of a child job.
///
/// `Queued -> Running -> {Completed | Failed | TimedOut | Cancelled}`, plus
/// `Queued -> Cancelled` for children cancelled before they started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ChildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChildStatus::Queued | ChildStatus::Running)
    }

    /// Failed or timed out. Cancellation is not a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, ChildStatus::Failed | ChildStatus::TimedOut)
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(&self, next: ChildStatus) -> bool {
        match (self, next) {
            (ChildStatus::Queued, ChildStatus::Running) => true,
            (ChildStatus::Queued, ChildStatus::Cancelled) => true,
            (ChildStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// Classification of a child-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildErrorKind {
    BackendUnreachable,
    SubmissionRejected,
    MalformedResponse,
    /// The worker reported an internal failure while executing.
    BackendExecutionError,
    /// The job spec could not be patched with the seed/parameters.
    InvalidJobSpec,
    Timeout,
    /// The child's task panicked.
    Internal,
}

/// Error recorded on a failed or timed-out child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildError {
    pub kind: ChildErrorKind,
    pub message: String,
}

impl ChildError {
    pub fn new(kind: ChildErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// One backend's execution within a job group.
///
/// Transition methods return `false` (and change nothing) when the state
/// machine forbids the move, so terminal states can never be overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildJob {
    pub job_id: JobId,
    pub backend_id: BackendId,
    pub seed: Seed,
    pub status: ChildStatus,
    /// Highest progress reported while running, 0-100.
    pub progress: u8,
    pub current_step: Option<String>,
    pub outputs: Option<serde_json::Value>,
    pub error: Option<ChildError>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl ChildJob {
    pub fn new(backend_id: BackendId, seed: Seed) -> Self {
        Self {
            job_id: new_id(),
            backend_id,
            seed,
            status: ChildStatus::Queued,
            progress: 0,
            current_step: None,
            outputs: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// `Queued -> Running`.
    pub fn start(&mut self, now: Timestamp) -> bool {
        if !self.transition(ChildStatus::Running) {
            return false;
        }
        self.started_at = Some(now);
        true
    }

    /// Record a progress report. Only applies while running.
    ///
    /// The stored percentage never decreases; backends may report lower
    /// values (e.g. when moving to the next node) and those are still
    /// forwarded to subscribers by the executor.
    pub fn record_progress(&mut self, progress: u8, step: Option<String>) -> bool {
        if self.status != ChildStatus::Running {
            return false;
        }
        self.progress = self.progress.max(progress.min(100));
        if step.is_some() {
            self.current_step = step;
        }
        true
    }

    /// `Running -> Completed`.
    pub fn complete(&mut self, outputs: serde_json::Value, now: Timestamp) -> bool {
        if !self.transition(ChildStatus::Completed) {
            return false;
        }
        self.progress = 100;
        self.outputs = Some(outputs);
        self.completed_at = Some(now);
        true
    }

    /// `Running -> Failed`.
    pub fn fail(&mut self, error: ChildError, now: Timestamp) -> bool {
        if !self.transition(ChildStatus::Failed) {
            return false;
        }
        self.error = Some(error);
        self.completed_at = Some(now);
        true
    }

    /// `Running -> TimedOut`.
    pub fn time_out(&mut self, timeout: Duration, now: Timestamp) -> bool {
        if !self.transition(ChildStatus::TimedOut) {
            return false;
        }
        self.error = Some(ChildError::new(
            ChildErrorKind::Timeout,
            format!("No result within {} seconds", timeout.as_secs()),
        ));
        self.completed_at = Some(now);
        true
    }

    /// `Queued | Running -> Cancelled`.
    pub fn cancel(&mut self, now: Timestamp) -> bool {
        if !self.transition(ChildStatus::Cancelled) {
            return false;
        }
        self.completed_at = Some(now);
        true
    }

    fn transition(&mut self, next: ChildStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        true
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// Overall status of a job group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Running,
    Completed,
    Failed,
    PartialComplete,
    Cancelled,
}

impl GroupStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GroupStatus::Running)
    }
}

/// Derive a group status from its children's statuses.
///
/// - all `Completed` -> `Completed`
/// - all `Failed`/`TimedOut` -> `Failed`
/// - all terminal, mixed -> `PartialComplete`
/// - otherwise -> `Running`
///
/// Caller cancellation is not derived here; it is applied by the manager
/// and is sticky.
pub fn aggregate_status<I>(statuses: I) -> GroupStatus
where
    I: IntoIterator<Item = ChildStatus>,
{
    let mut total = 0usize;
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut terminal = 0usize;

    for status in statuses {
        total += 1;
        if status.is_terminal() {
            terminal += 1;
        }
        if status == ChildStatus::Completed {
            completed += 1;
        }
        if status.is_failure() {
            failed += 1;
        }
    }

    if total == 0 || terminal < total {
        GroupStatus::Running
    } else if completed == total {
        GroupStatus::Completed
    } else if failed == total {
        GroupStatus::Failed
    } else {
        GroupStatus::PartialComplete
    }
}

/// Per-status child counts, computed on read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildCounts {
    pub total: usize,
    pub queued_count: usize,
    pub running_count: usize,
    pub completed_count: usize,
    /// Failed plus timed out.
    pub failed_count: usize,
    pub cancelled_count: usize,
}

impl ChildCounts {
    pub fn from_children(children: &[ChildJob]) -> Self {
        let mut counts = Self {
            total: children.len(),
            ..Default::default()
        };
        for child in children {
            match child.status {
                ChildStatus::Queued => counts.queued_count += 1,
                ChildStatus::Running => counts.running_count += 1,
                ChildStatus::Completed => counts.completed_count += 1,
                ChildStatus::Failed | ChildStatus::TimedOut => counts.failed_count += 1,
                ChildStatus::Cancelled => counts.cancelled_count += 1,
            }
        }
        counts
    }

    pub fn terminal(&self) -> usize {
        self.completed_count + self.failed_count + self.cancelled_count
    }
}

/// Consistent read-only view of a job group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGroupSnapshot {
    pub group_id: GroupId,
    pub status: GroupStatus,
    pub job_spec: JobSpec,
    pub parameters: Parameters,
    pub seed_strategy: SeedStrategy,
    pub base_seed: Option<Seed>,
    pub timeout_seconds: u64,
    pub metadata: serde_json::Value,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    #[serde(flatten)]
    pub counts: ChildCounts,
    pub children: Vec<ChildJob>,
}

/// Child entry of a submission response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSummary {
    pub job_id: JobId,
    pub backend_id: BackendId,
    pub seed: Seed,
    pub status: ChildStatus,
}

impl From<&ChildJob> for ChildSummary {
    fn from(child: &ChildJob) -> Self {
        Self {
            job_id: child.job_id,
            backend_id: child.backend_id.clone(),
            seed: child.seed,
            status: child.status,
        }
    }
}

/// Response to a job-group submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGroupResponse {
    pub group_id: GroupId,
    pub status: GroupStatus,
    pub children: Vec<ChildSummary>,
}

impl From<&JobGroupSnapshot> for JobGroupResponse {
    fn from(snapshot: &JobGroupSnapshot) -> Self {
        Self {
            group_id: snapshot.group_id,
            status: snapshot.status,
            children: snapshot.children.iter().map(ChildSummary::from).collect(),
        }
    }
}

/// Compact listing entry for a job group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: GroupId,
    pub status: GroupStatus,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    #[serde(flatten)]
    pub counts: ChildCounts,
}

impl From<&JobGroupSnapshot> for GroupSummary {
    fn from(snapshot: &JobGroupSnapshot) -> Self {
        Self {
            group_id: snapshot.group_id,
            status: snapshot.status,
            created_at: snapshot.created_at,
            completed_at: snapshot.completed_at,
            counts: snapshot.counts,
        }
    }
}

/// Result of cancelling a job group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSummary {
    /// Non-terminal children that were signalled to stop.
    pub interrupted_count: usize,
    /// Children that were already terminal and left untouched.
    pub already_terminal_count: usize,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
