//! Scripted in-memory backends for driving the job-group manager.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use renderfarm_core::backend::{
    BackendDescriptor, BackendError, BackendHandle, BackendRegistry, BackendUpdate, ExecutionRef,
    JobSpecPatcher, PatchError,
};
use renderfarm_core::events::GroupEvent;
use renderfarm_core::job_group::{JobGroupRequest, JobSpec, Parameters};
use renderfarm_core::types::{BackendId, Seed};
use renderfarm_events::GroupEventStream;
use renderfarm_pipeline::{JobGroupManager, SchedulerConfig};
use serde_json::json;

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// What a scripted backend does once a child connects to it.
#[derive(Debug, Clone)]
pub enum Script {
    /// Report each update in order, then finish with `outputs`.
    Succeed {
        updates: Vec<BackendUpdate>,
        outputs: serde_json::Value,
    },
    /// Refuse the submission.
    RejectSubmit(String),
    /// Accept the submission, then report a worker-side failure.
    FailExecution(String),
    /// Accept the submission, then lose the connection.
    DropConnection,
    /// Refuse the connection itself.
    RefuseConnect,
    /// Report 10% once, then nothing ever again.
    Hang,
    /// Panic while following progress.
    Panic,
}

impl Script {
    pub fn succeed() -> Self {
        Script::Succeed {
            updates: vec![
                BackendUpdate::Progress {
                    progress: 40,
                    step: Some("KSampler".to_string()),
                },
                BackendUpdate::Pending,
                BackendUpdate::Progress {
                    progress: 90,
                    step: Some("VAEDecode".to_string()),
                },
            ],
            outputs: json!({"images": [{"filename": "out.png"}]}),
        }
    }
}

/// Everything the scripted backends were asked to do.
#[derive(Default)]
pub struct Calls {
    submitted: Mutex<Vec<(BackendId, JobSpec)>>,
    interrupts: Mutex<HashMap<BackendId, usize>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

impl Calls {
    pub fn submitted(&self) -> Vec<(BackendId, JobSpec)> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn interrupts(&self, backend_id: &str) -> usize {
        self.interrupts
            .lock()
            .unwrap()
            .get(backend_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_interrupts(&self) -> usize {
        self.interrupts.lock().unwrap().values().sum()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ScriptedRegistry {
    backends: Vec<(BackendDescriptor, Script)>,
    calls: Arc<Calls>,
}

impl ScriptedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(self, id: &str, script: Script) -> Self {
        self.with_descriptor(descriptor(id, true, &[]), script)
    }

    pub fn with_capable_backend(self, id: &str, capabilities: &[&str], script: Script) -> Self {
        self.with_descriptor(descriptor(id, true, capabilities), script)
    }

    pub fn with_offline_backend(self, id: &str) -> Self {
        self.with_descriptor(descriptor(id, false, &[]), Script::succeed())
    }

    fn with_descriptor(mut self, descriptor: BackendDescriptor, script: Script) -> Self {
        self.backends.push((descriptor, script));
        self
    }

    pub fn calls(&self) -> Arc<Calls> {
        Arc::clone(&self.calls)
    }
}

fn descriptor(id: &str, online: bool, capabilities: &[&str]) -> BackendDescriptor {
    BackendDescriptor {
        id: id.to_string(),
        online,
        busy: false,
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
    }
}

#[async_trait]
impl BackendRegistry for ScriptedRegistry {
    async fn list_available(
        &self,
        _required_capabilities: &[String],
    ) -> Result<Vec<BackendDescriptor>, BackendError> {
        Ok(self.backends.iter().map(|(d, _)| d.clone()).collect())
    }

    async fn connect(&self, backend_id: &str) -> Result<Box<dyn BackendHandle>, BackendError> {
        self.calls.connects.fetch_add(1, Ordering::SeqCst);
        let (descriptor, script) = self
            .backends
            .iter()
            .find(|(d, _)| d.id == backend_id)
            .ok_or_else(|| BackendError::Unreachable(format!("unknown backend {backend_id}")))?;

        if matches!(script, Script::RefuseConnect) {
            return Err(BackendError::Unreachable("connection refused".to_string()));
        }

        let updates = match script {
            Script::Succeed { updates, .. } => updates.iter().cloned().collect(),
            Script::Hang => VecDeque::from([BackendUpdate::Progress {
                progress: 10,
                step: None,
            }]),
            _ => VecDeque::new(),
        };

        Ok(Box::new(ScriptedHandle {
            backend_id: descriptor.id.clone(),
            script: script.clone(),
            updates,
            calls: Arc::clone(&self.calls),
        }))
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct ScriptedHandle {
    backend_id: BackendId,
    script: Script,
    updates: VecDeque<BackendUpdate>,
    calls: Arc<Calls>,
}

#[async_trait]
impl BackendHandle for ScriptedHandle {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    async fn submit(&mut self, spec: &JobSpec) -> Result<ExecutionRef, BackendError> {
        if let Script::RejectSubmit(reason) = &self.script {
            return Err(BackendError::Rejected(reason.clone()));
        }
        self.calls
            .submitted
            .lock()
            .unwrap()
            .push((self.backend_id.clone(), spec.clone()));
        Ok(ExecutionRef(format!("prompt-{}", self.backend_id)))
    }

    async fn next_update(
        &mut self,
        _execution: &ExecutionRef,
    ) -> Result<BackendUpdate, BackendError> {
        if let Some(update) = self.updates.pop_front() {
            return Ok(update);
        }
        match &self.script {
            Script::Succeed { .. } => Ok(BackendUpdate::Finished),
            Script::FailExecution(message) => Ok(BackendUpdate::Failed {
                message: message.clone(),
            }),
            Script::DropConnection => Err(BackendError::Unreachable("socket closed".to_string())),
            Script::Hang => Ok(BackendUpdate::Pending),
            Script::Panic => panic!("scripted backend panic"),
            Script::RejectSubmit(_) | Script::RefuseConnect => {
                Err(BackendError::Malformed("unexpected poll".to_string()))
            }
        }
    }

    async fn fetch_outputs(
        &mut self,
        _execution: &ExecutionRef,
    ) -> Result<serde_json::Value, BackendError> {
        match &self.script {
            Script::Succeed { outputs, .. } => Ok(outputs.clone()),
            _ => Err(BackendError::Malformed("no outputs".to_string())),
        }
    }

    async fn interrupt(&mut self, _execution: &ExecutionRef) -> Result<(), BackendError> {
        *self
            .calls
            .interrupts
            .lock()
            .unwrap()
            .entry(self.backend_id.clone())
            .or_default() += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Patcher
// ---------------------------------------------------------------------------

/// Writes the seed and every parameter as top-level fields of an object spec.
pub struct SeedFieldPatcher;

impl JobSpecPatcher for SeedFieldPatcher {
    fn patch_seed(
        &self,
        spec: &JobSpec,
        seed: Seed,
        parameters: &Parameters,
    ) -> Result<JobSpec, PatchError> {
        let mut value = spec.as_value().clone();
        let object = value
            .as_object_mut()
            .ok_or_else(|| PatchError("spec must be an object".to_string()))?;
        for (key, param) in parameters {
            object.insert(key.clone(), param.clone());
        }
        object.insert("seed".to_string(), json!(seed));
        Ok(JobSpec::new(value))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(100),
        retention: Duration::from_secs(60),
        max_groups: 16,
        event_capacity: 256,
    }
}

/// Build a manager over `registry`, returning the call log alongside it.
pub fn build_manager(registry: ScriptedRegistry) -> (Arc<JobGroupManager>, Arc<Calls>) {
    build_manager_with(registry, test_config())
}

pub fn build_manager_with(
    registry: ScriptedRegistry,
    config: SchedulerConfig,
) -> (Arc<JobGroupManager>, Arc<Calls>) {
    let calls = registry.calls();
    let manager = JobGroupManager::new(Arc::new(registry), Arc::new(SeedFieldPatcher), config);
    (Arc::new(manager), calls)
}

pub fn request(targets: &[&str]) -> JobGroupRequest {
    JobGroupRequest::new(
        JobSpec::new(json!({"workflow": "txt2img"})),
        targets.iter().map(|t| t.to_string()).collect(),
    )
}

/// Read a stream until it ends.
pub async fn drain(mut stream: GroupEventStream) -> Vec<GroupEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.recv().await {
        events.push(event);
    }
    events
}

/// Read a stream until `count` events matching `kind` have been seen.
pub async fn wait_for(stream: &mut GroupEventStream, kind: &str, count: usize) {
    let mut seen = 0;
    while seen < count {
        let event = stream.recv().await.expect("stream ended early");
        if event.kind() == kind {
            seen += 1;
        }
    }
}
