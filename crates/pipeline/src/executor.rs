//! Drives a single child job against one backend.
//!
//! The executor owns the whole life of a child after it leaves `Queued`:
//! patch the spec, connect, submit, follow progress, fetch outputs, and
//! classify anything that goes wrong. Every outcome ends in exactly one
//! terminal write plus its event; no error leaves [`ChildJobExecutor::execute`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use renderfarm_core::backend::{
    BackendError, BackendHandle, BackendRegistry, BackendUpdate, ExecutionRef, JobSpecPatcher,
};
use renderfarm_core::events::GroupEvent;
use renderfarm_core::job_group::{ChildError, ChildErrorKind, ChildStatus, JobSpec, Parameters};
use renderfarm_core::types::GroupId;
use renderfarm_events::EventBroadcaster;

use crate::group::ChildCell;

/// Upper bound on the best-effort interrupt sent after a timeout or cancel.
const INTERRUPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Returned when a child stopped because its group was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Child execution cancelled")]
pub struct ExecutionCancelled;

/// Everything one child needs to run.
#[derive(Clone)]
pub struct ChildTask {
    pub group_id: GroupId,
    pub job_spec: Arc<JobSpec>,
    pub parameters: Arc<Parameters>,
    pub cell: Arc<ChildCell>,
    pub timeout: Duration,
}

enum Attempt {
    Finished(serde_json::Value),
    Failed(ChildError),
    TimedOut,
    Cancelled,
}

/// Runs child jobs. Shared by every group of a manager.
pub struct ChildJobExecutor {
    registry: Arc<dyn BackendRegistry>,
    patcher: Arc<dyn JobSpecPatcher>,
    broadcaster: Arc<EventBroadcaster>,
    poll_interval: Duration,
}

impl ChildJobExecutor {
    pub fn new(
        registry: Arc<dyn BackendRegistry>,
        patcher: Arc<dyn JobSpecPatcher>,
        broadcaster: Arc<EventBroadcaster>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            patcher,
            broadcaster,
            poll_interval,
        }
    }

    /// Run one child to a terminal state.
    ///
    /// The timeout covers connect, submit, progress and fetch. On timeout
    /// or cancellation the backend is asked to interrupt the execution at
    /// most once. The backend connection is closed on every path.
    pub async fn execute(&self, task: &ChildTask) -> Result<ChildStatus, ExecutionCancelled> {
        let cell = &task.cell;

        if !cell.update(|job| job.start(Utc::now())) {
            // Claimed by a group cancel before the task got to run.
            tracing::info!(
                group_id = %task.group_id,
                job_id = %cell.job_id(),
                "Child job cancelled before start",
            );
            self.emit_cancelled(task);
            return Err(ExecutionCancelled);
        }

        tracing::info!(
            group_id = %task.group_id,
            job_id = %cell.job_id(),
            backend_id = %cell.backend_id(),
            seed = cell.seed(),
            "Child job started",
        );

        let mut handle: Option<Box<dyn BackendHandle>> = None;
        let mut execution: Option<ExecutionRef> = None;

        let attempt = tokio::select! {
            biased;
            _ = cell.cancel_token().cancelled() => Attempt::Cancelled,
            result = tokio::time::timeout(
                task.timeout,
                self.drive(task, &mut handle, &mut execution),
            ) => match result {
                Ok(Ok(outputs)) => Attempt::Finished(outputs),
                Ok(Err(error)) => Attempt::Failed(error),
                Err(_) => Attempt::TimedOut,
            },
        };

        let outcome = match attempt {
            Attempt::Finished(outputs) => {
                self.finish_completed(task, outputs);
                Ok(ChildStatus::Completed)
            }
            Attempt::Failed(error) => {
                self.finish_failed(task, error);
                Ok(ChildStatus::Failed)
            }
            Attempt::TimedOut => {
                self.finish_timed_out(task);
                self.interrupt(task, handle.as_deref_mut(), execution.as_ref())
                    .await;
                Ok(ChildStatus::TimedOut)
            }
            Attempt::Cancelled => {
                cell.update(|job| job.cancel(Utc::now()));
                tracing::info!(
                    group_id = %task.group_id,
                    job_id = %cell.job_id(),
                    "Child job cancelled",
                );
                self.emit_cancelled(task);
                self.interrupt(task, handle.as_deref_mut(), execution.as_ref())
                    .await;
                Err(ExecutionCancelled)
            }
        };

        if let Some(mut handle) = handle {
            handle.close().await;
        }
        outcome
    }

    /// The cancellable, time-bounded part of a run.
    async fn drive(
        &self,
        task: &ChildTask,
        handle_slot: &mut Option<Box<dyn BackendHandle>>,
        execution_slot: &mut Option<ExecutionRef>,
    ) -> Result<serde_json::Value, ChildError> {
        let cell = &task.cell;

        let spec = self
            .patcher
            .patch_seed(&task.job_spec, cell.seed(), &task.parameters)
            .map_err(|e| ChildError::new(ChildErrorKind::InvalidJobSpec, e.to_string()))?;

        let handle = handle_slot.insert(
            self.registry
                .connect(cell.backend_id())
                .await
                .map_err(child_error)?,
        );

        let execution = handle.submit(&spec).await.map_err(child_error)?;
        *execution_slot = Some(execution.clone());

        loop {
            match handle.next_update(&execution).await.map_err(child_error)? {
                BackendUpdate::Progress { progress, step } => {
                    cell.update(|job| job.record_progress(progress, step.clone()));
                    tracing::debug!(
                        job_id = %cell.job_id(),
                        progress,
                        step = step.as_deref().unwrap_or(""),
                        "Child progress",
                    );
                    self.broadcaster.publish(
                        task.group_id,
                        GroupEvent::ChildProgress {
                            job_id: cell.job_id(),
                            backend_id: cell.backend_id().to_string(),
                            progress,
                            current_step: step,
                        },
                    );
                }
                BackendUpdate::Pending => tokio::time::sleep(self.poll_interval).await,
                BackendUpdate::Finished => break,
                BackendUpdate::Failed { message } => {
                    return Err(ChildError::new(
                        ChildErrorKind::BackendExecutionError,
                        message,
                    ));
                }
            }
        }

        handle.fetch_outputs(&execution).await.map_err(child_error)
    }

    fn finish_completed(&self, task: &ChildTask, outputs: serde_json::Value) {
        let cell = &task.cell;
        let now = Utc::now();
        cell.update(|job| job.complete(outputs.clone(), now));

        tracing::info!(
            group_id = %task.group_id,
            job_id = %cell.job_id(),
            backend_id = %cell.backend_id(),
            "Child job completed",
        );
        self.broadcaster.publish(
            task.group_id,
            GroupEvent::ChildCompleted {
                job_id: cell.job_id(),
                backend_id: cell.backend_id().to_string(),
                seed: cell.seed(),
                outputs,
                completed_at: now,
            },
        );
    }

    fn finish_failed(&self, task: &ChildTask, error: ChildError) {
        let cell = &task.cell;
        cell.update(|job| job.fail(error.clone(), Utc::now()));

        tracing::warn!(
            group_id = %task.group_id,
            job_id = %cell.job_id(),
            backend_id = %cell.backend_id(),
            error_kind = ?error.kind,
            error = %error.message,
            "Child job failed",
        );
        self.broadcaster.publish(
            task.group_id,
            GroupEvent::ChildFailed {
                job_id: cell.job_id(),
                backend_id: cell.backend_id().to_string(),
                error_kind: error.kind,
                error_message: error.message,
            },
        );
    }

    fn finish_timed_out(&self, task: &ChildTask) {
        let cell = &task.cell;
        cell.update(|job| job.time_out(task.timeout, Utc::now()));

        tracing::warn!(
            group_id = %task.group_id,
            job_id = %cell.job_id(),
            backend_id = %cell.backend_id(),
            timeout_secs = task.timeout.as_secs(),
            "Child job timed out",
        );
        self.broadcaster.publish(
            task.group_id,
            GroupEvent::ChildTimeout {
                job_id: cell.job_id(),
                backend_id: cell.backend_id().to_string(),
                timeout_seconds: task.timeout.as_secs(),
            },
        );
    }

    fn emit_cancelled(&self, task: &ChildTask) {
        self.broadcaster.publish(
            task.group_id,
            GroupEvent::ChildCancelled {
                job_id: task.cell.job_id(),
                backend_id: task.cell.backend_id().to_string(),
            },
        );
    }

    /// Best-effort stop of a submitted execution. Failures are only logged.
    async fn interrupt(
        &self,
        task: &ChildTask,
        handle: Option<&mut (dyn BackendHandle + 'static)>,
        execution: Option<&ExecutionRef>,
    ) {
        let (Some(handle), Some(execution)) = (handle, execution) else {
            return;
        };

        match tokio::time::timeout(INTERRUPT_TIMEOUT, handle.interrupt(execution)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(
                    job_id = %task.cell.job_id(),
                    backend_id = %task.cell.backend_id(),
                    error = %e,
                    "Failed to interrupt backend execution",
                );
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %task.cell.job_id(),
                    backend_id = %task.cell.backend_id(),
                    "Timed out interrupting backend execution",
                );
            }
        }
    }
}

fn child_error(err: BackendError) -> ChildError {
    ChildError::new(err.kind(), err.to_string())
}
