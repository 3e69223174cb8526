//! Job-group orchestration.
//!
//! [`JobGroupManager`] owns every job group of the process. Creating a
//! group resolves the target backends, assigns one seed per backend, and
//! spawns one task per child; each task runs the child through the
//! [`ChildJobExecutor`] and then reports to the group's aggregation step,
//! which publishes `GroupComplete` once the last child is done.
//!
//! Groups stay queryable after they finish until they are acknowledged,
//! age out of the retention window, or are pushed out by `max_groups`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use renderfarm_core::backend::{BackendDescriptor, BackendRegistry, JobSpecPatcher};
use renderfarm_core::error::CoreError;
use renderfarm_core::events::GroupEvent;
use renderfarm_core::job_group::{
    CancelSummary, ChildError, ChildErrorKind, ChildJob, GroupSummary, JobGroupRequest,
    JobGroupResponse, JobGroupSnapshot,
};
use renderfarm_core::seeds::generate_seeds;
use renderfarm_core::types::{new_id, BackendId, GroupId, Timestamp};
use renderfarm_events::{EventBroadcaster, GroupEventStream};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::executor::{ChildJobExecutor, ChildTask};
use crate::group::{GroupDefinition, GroupEntry};

/// How long [`JobGroupManager::shutdown`] waits for child tasks to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Creates, runs, tracks and retires job groups.
///
/// Created once at startup; share it as `Arc<JobGroupManager>`.
pub struct JobGroupManager {
    groups: RwLock<HashMap<GroupId, Arc<GroupEntry>>>,
    registry: Arc<dyn BackendRegistry>,
    executor: Arc<ChildJobExecutor>,
    broadcaster: Arc<EventBroadcaster>,
    config: SchedulerConfig,
    tasks: TaskTracker,
    /// Master token; every group token is a child of it.
    cancel: CancellationToken,
}

impl JobGroupManager {
    pub fn new(
        registry: Arc<dyn BackendRegistry>,
        patcher: Arc<dyn JobSpecPatcher>,
        config: SchedulerConfig,
    ) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new(config.event_capacity));
        let executor = Arc::new(ChildJobExecutor::new(
            Arc::clone(&registry),
            patcher,
            Arc::clone(&broadcaster),
            config.poll_interval,
        ));
        Self {
            groups: RwLock::new(HashMap::new()),
            registry,
            executor,
            broadcaster,
            config,
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    /// Validate a request, create its group, and start every child.
    ///
    /// Returns as soon as the children are launched. Besides request
    /// validation, the only error is [`CoreError::NoAvailableBackends`];
    /// in that case no group is created.
    pub async fn create_and_execute(
        &self,
        request: JobGroupRequest,
    ) -> Result<JobGroupResponse, CoreError> {
        let (strategy, timeout) = request.validate()?;
        let backends = self.resolve_backends(&request).await?;

        let seeds = generate_seeds(backends.len(), strategy, request.base_seed);
        let children: Vec<ChildJob> = backends
            .into_iter()
            .zip(seeds.iter().copied())
            .map(|(backend_id, seed)| ChildJob::new(backend_id, seed))
            .collect();

        let group_id = new_id();
        let definition = GroupDefinition {
            group_id,
            job_spec: Arc::new(request.job_spec),
            parameters: Arc::new(request.parameters),
            seed_strategy: strategy,
            base_seed: request.base_seed.or_else(|| seeds.first().copied()),
            timeout,
            metadata: if request.metadata.is_null() {
                serde_json::Value::Object(Default::default())
            } else {
                request.metadata
            },
            created_at: Utc::now(),
        };
        let entry = Arc::new(GroupEntry::new(
            definition,
            children,
            self.cancel.child_token(),
        ));
        let response = JobGroupResponse::from(&entry.snapshot());

        {
            let mut groups = self.groups.write().await;
            self.make_room(&mut groups);
            self.broadcaster.register(group_id);
            groups.insert(group_id, Arc::clone(&entry));
        }

        tracing::info!(
            group_id = %group_id,
            children = entry.children().len(),
            strategy = %strategy,
            timeout_secs = timeout.as_secs(),
            "Job group created",
        );

        for cell in entry.children() {
            let task = ChildTask {
                group_id,
                job_spec: Arc::clone(&entry.definition().job_spec),
                parameters: Arc::clone(&entry.definition().parameters),
                cell: Arc::clone(cell),
                timeout,
            };
            self.tasks.spawn(supervise_child(
                Arc::clone(&self.executor),
                Arc::clone(&self.broadcaster),
                Arc::clone(&entry),
                task,
            ));
        }

        Ok(response)
    }

    /// Current snapshot of a group.
    pub async fn get_status(&self, group_id: GroupId) -> Result<JobGroupSnapshot, CoreError> {
        Ok(self.entry(group_id).await?.snapshot())
    }

    /// Summaries of every retained group, newest first.
    pub async fn list(&self) -> Vec<GroupSummary> {
        let groups = self.groups.read().await;
        let mut summaries: Vec<GroupSummary> = groups
            .values()
            .map(|entry| GroupSummary::from(&entry.snapshot()))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Cancel every non-terminal child of a group. Idempotent.
    pub async fn cancel(&self, group_id: GroupId) -> Result<CancelSummary, CoreError> {
        let entry = self.entry(group_id).await?;
        let summary = entry.cancel();
        tracing::info!(
            group_id = %group_id,
            interrupted = summary.interrupted_count,
            already_terminal = summary.already_terminal_count,
            "Job group cancel requested",
        );
        Ok(summary)
    }

    /// Drop a finished group. Running groups cannot be acknowledged.
    pub async fn acknowledge(&self, group_id: GroupId) -> Result<(), CoreError> {
        let mut groups = self.groups.write().await;
        let entry = groups.get(&group_id).ok_or_else(|| not_found(group_id))?;
        if !entry.is_finished() {
            return Err(CoreError::Conflict(format!(
                "Job group {group_id} is still running"
            )));
        }
        groups.remove(&group_id);
        self.broadcaster.remove(group_id);
        tracing::info!(group_id = %group_id, "Job group acknowledged");
        Ok(())
    }

    /// Evict finished groups whose completion is older than the retention
    /// window. Returns the number of groups evicted.
    pub async fn evict_expired(&self, now: Timestamp) -> usize {
        let retention = self.config.retention;
        let mut groups = self.groups.write().await;
        let expired: Vec<GroupId> = groups
            .values()
            .filter(|entry| entry.is_finished())
            .filter(|entry| {
                entry
                    .completed_at()
                    .and_then(|done| (now - done).to_std().ok())
                    .is_some_and(|age| age >= retention)
            })
            .map(|entry| entry.group_id())
            .collect();

        for group_id in &expired {
            groups.remove(group_id);
            self.broadcaster.remove(*group_id);
            tracing::info!(group_id = %group_id, "Job group expired");
        }
        expired.len()
    }

    /// Subscribe to a group's events, starting with an `InitialState`.
    pub async fn subscribe(&self, group_id: GroupId) -> Result<GroupEventStream, CoreError> {
        let entry = self.entry(group_id).await?;
        self.broadcaster
            .subscribe(group_id, || Some(entry.snapshot()))
            .ok_or_else(|| not_found(group_id))
    }

    /// Backends known to the registry that advertise every capability.
    pub async fn list_backends(
        &self,
        required_capabilities: &[String],
    ) -> Result<Vec<BackendDescriptor>, CoreError> {
        let backends = self
            .registry
            .list_available(required_capabilities)
            .await
            .map_err(|e| CoreError::Internal(format!("Backend registry unavailable: {e}")))?;
        Ok(backends
            .into_iter()
            .filter(|b| b.has_capabilities(required_capabilities))
            .collect())
    }

    /// Number of retained groups.
    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }

    /// Cancel all running groups and wait briefly for their tasks.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job group manager");
        {
            let groups = self.groups.read().await;
            for entry in groups.values().filter(|e| !e.is_finished()) {
                entry.cancel();
            }
        }
        self.cancel.cancel();
        self.tasks.close();

        if tokio::time::timeout(SHUTDOWN_GRACE, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.tasks.len(),
                "Child tasks still running after shutdown grace period",
            );
        }
        tracing::info!("Job group manager shut down complete");
    }

    // ---- private helpers ----

    async fn entry(&self, group_id: GroupId) -> Result<Arc<GroupEntry>, CoreError> {
        self.groups
            .read()
            .await
            .get(&group_id)
            .cloned()
            .ok_or_else(|| not_found(group_id))
    }

    /// Online backends matching the request, in request order (or registry
    /// order when no targets were given).
    async fn resolve_backends(&self, request: &JobGroupRequest) -> Result<Vec<BackendId>, CoreError> {
        let targets = request.distinct_targets();
        let no_backends = || CoreError::NoAvailableBackends {
            requested: targets.clone(),
        };

        let listed = match self
            .registry
            .list_available(&request.required_capabilities)
            .await
        {
            Ok(listed) => listed,
            Err(e) => {
                tracing::warn!(error = %e, "Backend registry unavailable");
                return Err(no_backends());
            }
        };

        let usable: Vec<&BackendDescriptor> = listed
            .iter()
            .filter(|b| b.online && b.has_capabilities(&request.required_capabilities))
            .collect();

        let backends: Vec<BackendId> = if targets.is_empty() {
            usable.iter().map(|b| b.id.clone()).collect()
        } else {
            targets
                .iter()
                .filter(|id| usable.iter().any(|b| &b.id == *id))
                .cloned()
                .collect()
        };

        if backends.is_empty() {
            return Err(no_backends());
        }
        if backends.len() < targets.len() {
            tracing::info!(
                requested = targets.len(),
                usable = backends.len(),
                "Some target backends are offline or lack capabilities",
            );
        }
        Ok(backends)
    }

    /// Evict finished groups, oldest completion first, until there is room
    /// for one more. Running groups are never evicted.
    fn make_room(&self, groups: &mut HashMap<GroupId, Arc<GroupEntry>>) {
        if groups.len() < self.config.max_groups {
            return;
        }

        let mut finished: Vec<(Timestamp, GroupId)> = groups
            .values()
            .filter(|e| e.is_finished())
            .filter_map(|e| Some((e.completed_at()?, e.group_id())))
            .collect();
        finished.sort();

        let excess = groups.len() + 1 - self.config.max_groups;
        for (_, group_id) in finished.into_iter().take(excess) {
            groups.remove(&group_id);
            self.broadcaster.remove(group_id);
            tracing::info!(group_id = %group_id, "Job group evicted to make room");
        }

        if groups.len() >= self.config.max_groups {
            tracing::warn!(
                retained = groups.len(),
                max_groups = self.config.max_groups,
                "Group table over capacity; all retained groups are running",
            );
        }
    }
}

fn not_found(group_id: GroupId) -> CoreError {
    CoreError::NotFound {
        entity: "job_group",
        id: group_id.to_string(),
    }
}

/// Per-child wrapper: run the executor on its own task so that a panic is
/// contained, record the panic as a failure, then report to aggregation.
async fn supervise_child(
    executor: Arc<ChildJobExecutor>,
    broadcaster: Arc<EventBroadcaster>,
    entry: Arc<GroupEntry>,
    task: ChildTask,
) {
    let cell = Arc::clone(&task.cell);
    let group_id = task.group_id;

    let run = tokio::spawn(async move { executor.execute(&task).await });
    match run.await {
        Ok(Ok(status)) => {
            tracing::debug!(job_id = %cell.job_id(), ?status, "Child task finished");
        }
        Ok(Err(_cancelled)) => {
            tracing::debug!(job_id = %cell.job_id(), "Child task cancelled");
        }
        Err(e) => {
            tracing::error!(
                group_id = %group_id,
                job_id = %cell.job_id(),
                error = %e,
                "Child task panicked",
            );
            let error = ChildError::new(ChildErrorKind::Internal, format!("Child task failed: {e}"));
            let recorded = cell.update(|job| {
                let now = Utc::now();
                job.start(now);
                job.fail(error.clone(), now)
            });
            if recorded {
                broadcaster.publish(
                    group_id,
                    GroupEvent::ChildFailed {
                        job_id: cell.job_id(),
                        backend_id: cell.backend_id().to_string(),
                        error_kind: error.kind,
                        error_message: error.message,
                    },
                );
            }
        }
    }

    if let Some(event) = entry.child_finished() {
        tracing::info!(group_id = %group_id, status = ?entry.status(), "Job group complete");
        broadcaster.publish(group_id, event);
    }
}
