//! In-memory state of one job group.
//!
//! Every child lives in its own [`ChildCell`]; after creation only the
//! child's executor task writes to it, except for the manager's atomic
//! `Queued -> Cancelled` claim. Group-level status has a single writer,
//! [`GroupEntry::child_finished`], serialized by the aggregate mutex.
//!
//! Lock order is always aggregate mutex, then child locks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use renderfarm_core::events::GroupEvent;
use renderfarm_core::job_group::{
    aggregate_status, CancelSummary, ChildCounts, ChildJob, ChildStatus, GroupStatus, JobSpec,
    JobGroupSnapshot, Parameters,
};
use renderfarm_core::seeds::SeedStrategy;
use renderfarm_core::types::{BackendId, GroupId, JobId, Seed, Timestamp};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// ChildCell
// ---------------------------------------------------------------------------

/// Shared, lock-protected state of one child job.
pub struct ChildCell {
    job_id: JobId,
    backend_id: BackendId,
    seed: Seed,
    job: RwLock<ChildJob>,
    cancel: CancellationToken,
}

impl ChildCell {
    pub fn new(job: ChildJob, cancel: CancellationToken) -> Self {
        Self {
            job_id: job.job_id,
            backend_id: job.backend_id.clone(),
            seed: job.seed,
            job: RwLock::new(job),
            cancel,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn seed(&self) -> Seed {
        self.seed
    }

    /// Token cancelled when the caller cancels this child's group.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn snapshot(&self) -> ChildJob {
        self.job.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn status(&self) -> ChildStatus {
        self.job.read().unwrap_or_else(PoisonError::into_inner).status
    }

    /// Run `f` with exclusive access to the child.
    pub fn update<R>(&self, f: impl FnOnce(&mut ChildJob) -> R) -> R {
        let mut job = self.job.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut job)
    }
}

// ---------------------------------------------------------------------------
// GroupEntry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Aggregate {
    status: GroupStatus,
    completed_at: Option<Timestamp>,
    /// Children whose task has finished publishing its events.
    finished: usize,
    /// Set by a cancel that signalled at least one child.
    cancel_requested: bool,
    complete_emitted: bool,
}

/// Fixed description of a group, captured at creation.
pub struct GroupDefinition {
    pub group_id: GroupId,
    pub job_spec: Arc<JobSpec>,
    pub parameters: Arc<Parameters>,
    pub seed_strategy: SeedStrategy,
    pub base_seed: Option<Seed>,
    pub timeout: Duration,
    pub metadata: serde_json::Value,
    pub created_at: Timestamp,
}

/// One job group as held by the manager.
pub struct GroupEntry {
    definition: GroupDefinition,
    children: Vec<Arc<ChildCell>>,
    cancel: CancellationToken,
    aggregate: Mutex<Aggregate>,
}

impl GroupEntry {
    /// Build a group in `Running` state. Child tokens are derived from
    /// `cancel`.
    pub fn new(definition: GroupDefinition, children: Vec<ChildJob>, cancel: CancellationToken) -> Self {
        let children = children
            .into_iter()
            .map(|job| Arc::new(ChildCell::new(job, cancel.child_token())))
            .collect();
        Self {
            definition,
            children,
            cancel,
            aggregate: Mutex::new(Aggregate {
                status: GroupStatus::Running,
                completed_at: None,
                finished: 0,
                cancel_requested: false,
                complete_emitted: false,
            }),
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.definition.group_id
    }

    pub fn definition(&self) -> &GroupDefinition {
        &self.definition
    }

    pub fn children(&self) -> &[Arc<ChildCell>] {
        &self.children
    }

    pub fn status(&self) -> GroupStatus {
        self.lock().status
    }

    pub fn completed_at(&self) -> Option<Timestamp> {
        self.lock().completed_at
    }

    /// Whether `GroupComplete` has been produced.
    pub fn is_finished(&self) -> bool {
        self.lock().complete_emitted
    }

    /// Consistent view of the group and all of its children.
    pub fn snapshot(&self) -> JobGroupSnapshot {
        let aggregate = self.lock();
        self.snapshot_locked(&aggregate)
    }

    /// Record that one child's task is done and has published its last
    /// event, then re-aggregate.
    ///
    /// Returns the `GroupComplete` event exactly once: for the call that
    /// accounts for the last child.
    pub fn child_finished(&self) -> Option<GroupEvent> {
        let mut aggregate = self.lock();
        aggregate.finished = (aggregate.finished + 1).min(self.children.len());

        // Children can be terminal before their task has finished; the
        // stored status only turns terminal together with `completed_at`.
        if aggregate.finished < self.children.len() || aggregate.complete_emitted {
            return None;
        }

        let statuses: Vec<ChildStatus> = self.children.iter().map(|c| c.status()).collect();
        let mut derived = aggregate_status(statuses.iter().copied());
        if derived.is_terminal()
            && (aggregate.cancel_requested || statuses.contains(&ChildStatus::Cancelled))
        {
            derived = GroupStatus::Cancelled;
        }
        aggregate.status = derived;

        // Every child task ends with a terminal write; anything else is a bug.
        if !aggregate.status.is_terminal() {
            tracing::error!(
                group_id = %self.group_id(),
                "All child tasks finished but some children are not terminal",
            );
            aggregate.status = GroupStatus::Failed;
        }

        aggregate.complete_emitted = true;
        aggregate.completed_at = Some(Utc::now());
        let snapshot = self.snapshot_locked(&aggregate);
        Some(GroupEvent::group_complete(&snapshot))
    }

    /// Signal every non-terminal child to stop.
    ///
    /// Still-queued children are moved to `Cancelled` here; running ones are
    /// moved by their executor once it observes the token. A child already
    /// signalled by an earlier call is counted in neither field, so repeated
    /// calls report `interrupted_count == 0`.
    pub fn cancel(&self) -> CancelSummary {
        let mut aggregate = self.lock();
        let mut summary = CancelSummary::default();
        let now = Utc::now();

        for cell in &self.children {
            let was_terminal = cell.update(|job| {
                if job.status.is_terminal() {
                    return true;
                }
                if job.status == ChildStatus::Queued {
                    job.cancel(now);
                }
                false
            });

            if was_terminal {
                summary.already_terminal_count += 1;
            } else if !cell.cancel_token().is_cancelled() {
                summary.interrupted_count += 1;
                cell.cancel_token().cancel();
            }
        }

        if summary.interrupted_count > 0 && !aggregate.complete_emitted {
            aggregate.cancel_requested = true;
        }
        self.cancel.cancel();
        summary
    }

    fn snapshot_locked(&self, aggregate: &Aggregate) -> JobGroupSnapshot {
        let children: Vec<ChildJob> = self.children.iter().map(|c| c.snapshot()).collect();
        let definition = &self.definition;
        JobGroupSnapshot {
            group_id: definition.group_id,
            status: aggregate.status,
            job_spec: JobSpec::clone(&definition.job_spec),
            parameters: Parameters::clone(&definition.parameters),
            seed_strategy: definition.seed_strategy,
            base_seed: definition.base_seed,
            timeout_seconds: definition.timeout.as_secs(),
            metadata: definition.metadata.clone(),
            created_at: definition.created_at,
            completed_at: aggregate.completed_at,
            counts: ChildCounts::from_children(&children),
            children,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Aggregate> {
        self.aggregate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
