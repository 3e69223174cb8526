//! [`BackendRegistry`] over a static list of ComfyUI instances.
//!
//! Availability is probed on every listing with `GET /queue`; probes run
//! concurrently and each is bounded by the configured timeout, so one dead
//! instance cannot stall a submission.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use renderfarm_core::backend::{BackendDescriptor, BackendError, BackendHandle, BackendRegistry};
use serde::Deserialize;

use crate::api::ComfyUIApi;
use crate::backend::ComfyUIBackend;
use crate::client::ComfyUIClient;

/// Default bound on a single availability probe or connection attempt.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One configured ComfyUI instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    /// Base HTTP URL, e.g. `http://gpu-a:8188`.
    pub api_url: String,
    /// WebSocket base URL, e.g. `ws://gpu-a:8188`.
    pub ws_url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

struct Instance {
    config: InstanceConfig,
    api: ComfyUIApi,
}

/// Registry of ComfyUI instances known at startup.
pub struct ComfyUIRegistry {
    instances: Vec<Instance>,
    probe_timeout: Duration,
}

impl ComfyUIRegistry {
    /// Build a registry sharing one HTTP connection pool across instances.
    ///
    /// Instances with a duplicate id are ignored (first one wins).
    pub fn new(configs: Vec<InstanceConfig>, probe_timeout: Duration) -> Self {
        let http = reqwest::Client::new();
        let mut instances: Vec<Instance> = Vec::with_capacity(configs.len());
        for config in configs {
            if instances.iter().any(|i| i.config.id == config.id) {
                tracing::warn!(backend_id = %config.id, "Duplicate ComfyUI instance id ignored");
                continue;
            }
            let api = ComfyUIApi::with_client(http.clone(), config.api_url.clone());
            instances.push(Instance { config, api });
        }
        Self {
            instances,
            probe_timeout,
        }
    }

    pub fn instances(&self) -> impl Iterator<Item = &InstanceConfig> {
        self.instances.iter().map(|i| &i.config)
    }

    fn find(&self, backend_id: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.config.id == backend_id)
    }

    async fn probe(&self, instance: &Instance) -> BackendDescriptor {
        let result = tokio::time::timeout(self.probe_timeout, instance.api.get_queue()).await;
        let (online, busy) = match result {
            Ok(Ok(queue)) => (true, queue.is_busy()),
            Ok(Err(e)) => {
                tracing::debug!(backend_id = %instance.config.id, error = %e, "ComfyUI probe failed");
                (false, false)
            }
            Err(_) => {
                tracing::debug!(backend_id = %instance.config.id, "ComfyUI probe timed out");
                (false, false)
            }
        };

        BackendDescriptor {
            id: instance.config.id.clone(),
            online,
            busy,
            capabilities: instance.config.capabilities.clone(),
        }
    }
}

#[async_trait]
impl BackendRegistry for ComfyUIRegistry {
    async fn list_available(
        &self,
        required_capabilities: &[String],
    ) -> Result<Vec<BackendDescriptor>, BackendError> {
        let probes = self
            .instances
            .iter()
            .filter(|i| {
                required_capabilities
                    .iter()
                    .all(|req| i.config.capabilities.contains(req))
            })
            .map(|i| self.probe(i));

        Ok(join_all(probes).await)
    }

    async fn connect(&self, backend_id: &str) -> Result<Box<dyn BackendHandle>, BackendError> {
        let instance = self
            .find(backend_id)
            .ok_or_else(|| BackendError::Unreachable(format!("Unknown backend '{backend_id}'")))?;

        let client = ComfyUIClient::new(instance.config.id.clone(), instance.config.ws_url.clone());
        let connection = tokio::time::timeout(self.probe_timeout, client.connect())
            .await
            .map_err(|_| {
                BackendError::Unreachable(format!(
                    "Timed out connecting to ComfyUI at {}",
                    client.ws_url()
                ))
            })??;

        Ok(Box::new(ComfyUIBackend::new(instance.api.clone(), connection)))
    }
}
