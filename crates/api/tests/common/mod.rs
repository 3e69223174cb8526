#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use renderfarm_api::config::ServerConfig;
use renderfarm_api::router::build_app_router;
use renderfarm_api::state::AppState;
use renderfarm_comfyui::ComfyUIPatcher;
use renderfarm_core::backend::{
    BackendDescriptor, BackendError, BackendHandle, BackendRegistry, BackendUpdate, ExecutionRef,
};
use renderfarm_core::job_group::JobSpec;
use renderfarm_pipeline::{JobGroupManager, SchedulerConfig};
use serde_json::json;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Fake render farm
// ---------------------------------------------------------------------------

/// How a fake backend behaves once a child connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Report 50%, then finish with one image.
    Succeed,
    /// Report a worker-side failure.
    Fail,
    /// Never finish.
    Hang,
}

/// In-memory registry; every backend answers instantly.
#[derive(Default)]
pub struct FakeFarm {
    backends: Vec<(BackendDescriptor, Behaviour)>,
}

impl FakeFarm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, behaviour: Behaviour) -> Self {
        self.backends.push((descriptor(id, true, &[]), behaviour));
        self
    }

    pub fn with_capable(mut self, id: &str, capabilities: &[&str], behaviour: Behaviour) -> Self {
        self.backends
            .push((descriptor(id, true, capabilities), behaviour));
        self
    }

    pub fn with_offline(mut self, id: &str) -> Self {
        self.backends
            .push((descriptor(id, false, &[]), Behaviour::Succeed));
        self
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
impl BackendRegistry for FakeFarm {
    async fn list_available(
        &self,
        _required_capabilities: &[String],
    ) -> Result<Vec<BackendDescriptor>, BackendError> {
        Ok(self.backends.iter().map(|(d, _)| d.clone()).collect())
    }

    async fn connect(&self, backend_id: &str) -> Result<Box<dyn BackendHandle>, BackendError> {
        let (descriptor, behaviour) = self
            .backends
            .iter()
            .find(|(d, _)| d.id == backend_id)
            .ok_or_else(|| BackendError::Unreachable(backend_id.to_string()))?;
        Ok(Box::new(FakeHandle {
            backend_id: descriptor.id.clone(),
            behaviour: *behaviour,
            reported: false,
        }))
    }
}

struct FakeHandle {
    backend_id: String,
    behaviour: Behaviour,
    reported: bool,
}

#[async_trait]
impl BackendHandle for FakeHandle {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    async fn submit(&mut self, _spec: &JobSpec) -> Result<ExecutionRef, BackendError> {
        Ok(ExecutionRef(format!("prompt-{}", self.backend_id)))
    }

    async fn next_update(
        &mut self,
        _execution: &ExecutionRef,
    ) -> Result<BackendUpdate, BackendError> {
        if !self.reported {
            self.reported = true;
            return Ok(BackendUpdate::Progress {
                progress: 50,
                step: Some("3".to_string()),
            });
        }
        Ok(match self.behaviour {
            Behaviour::Succeed => BackendUpdate::Finished,
            Behaviour::Fail => BackendUpdate::Failed {
                message: "CUDA out of memory".to_string(),
            },
            Behaviour::Hang => BackendUpdate::Pending,
        })
    }

    async fn fetch_outputs(
        &mut self,
        _execution: &ExecutionRef,
    ) -> Result<serde_json::Value, BackendError> {
        Ok(json!({"9": {"images": [{"filename": "out.png", "type": "output"}]}}))
    }

    async fn interrupt(&mut self, _execution: &ExecutionRef) -> Result<(), BackendError> {
        Ok(())
    }

    async fn close(&mut self) {}
}

// ---------------------------------------------------------------------------
// App construction
// ---------------------------------------------------------------------------

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        scheduler: SchedulerConfig {
            poll_interval: std::time::Duration::from_millis(20),
            ..SchedulerConfig::default()
        },
        ..ServerConfig::default()
    }
}

/// Build the full application router over `farm`, using the same
/// middleware stack as `main.rs`. Also returns the state for direct access
/// to the manager.
pub fn build_test_app(farm: FakeFarm) -> (Router, AppState) {
    build_test_app_with(farm, test_config())
}

pub fn build_test_app_with(farm: FakeFarm, config: ServerConfig) -> (Router, AppState) {
    let manager = JobGroupManager::new(
        Arc::new(farm),
        Arc::new(ComfyUIPatcher::default()),
        config.scheduler.clone(),
    );
    let state = AppState {
        config: Arc::new(config.clone()),
        manager: Arc::new(manager),
    };
    (build_app_router(state.clone(), &config), state)
}

/// Serve `app` on an ephemeral port, for tests that need a real socket.
pub async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A minimal ComfyUI API-format workflow with one sampler.
pub fn workflow() -> serde_json::Value {
    json!({
        "3": {
            "class_type": "KSampler",
            "inputs": {"seed": 0, "steps": 20, "cfg": 7.0, "model": ["4", 0]}
        },
        "4": {
            "class_type": "CheckpointLoaderSimple",
            "inputs": {"ckpt_name": "sdxl.safetensors"}
        }
    })
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, Body::empty()).await
}

pub async fn delete(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::DELETE, uri, Body::empty()).await
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn send(app: Router, method: Method, uri: &str, body: Body) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
