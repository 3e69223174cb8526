//! [`BackendHandle`] implementation for one ComfyUI prompt.
//!
//! Every child opens its own WebSocket with a fresh `clientId`, so frames
//! addressed to that client only concern prompts the child submitted.
//! Frames are still filtered by prompt id because ComfyUI broadcasts some
//! of them (`status`, legacy `progress`) to every client.

use async_trait::async_trait;
use futures::StreamExt;
use renderfarm_core::backend::{BackendError, BackendHandle, BackendUpdate, ExecutionRef};
use renderfarm_core::job_group::JobSpec;
use tokio_tungstenite::tungstenite::Message;

use crate::api::{outputs_from_history, ComfyUIApi};
use crate::client::{ComfyUIClientError, ComfyUIConnection, ComfyUIStream};
use crate::messages::{parse_message, ComfyUIMessage};

impl From<ComfyUIClientError> for BackendError {
    fn from(err: ComfyUIClientError) -> Self {
        BackendError::Unreachable(err.to_string())
    }
}

/// A child's private connection to a ComfyUI instance.
pub struct ComfyUIBackend {
    backend_id: String,
    client_id: String,
    api: ComfyUIApi,
    ws_stream: Option<ComfyUIStream>,
    tracker: PromptTracker,
}

impl ComfyUIBackend {
    pub fn new(api: ComfyUIApi, connection: ComfyUIConnection) -> Self {
        Self {
            backend_id: connection.backend_id,
            client_id: connection.client_id,
            api,
            ws_stream: Some(connection.ws_stream),
            tracker: PromptTracker::default(),
        }
    }
}

#[async_trait]
impl BackendHandle for ComfyUIBackend {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    async fn submit(&mut self, spec: &JobSpec) -> Result<ExecutionRef, BackendError> {
        let response = self
            .api
            .submit_workflow(spec.as_value(), &self.client_id)
            .await?;

        tracing::info!(
            backend_id = %self.backend_id,
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            "Prompt queued on ComfyUI",
        );
        self.tracker = PromptTracker::default();
        Ok(ExecutionRef(response.prompt_id))
    }

    async fn next_update(
        &mut self,
        execution: &ExecutionRef,
    ) -> Result<BackendUpdate, BackendError> {
        let ws = self
            .ws_stream
            .as_mut()
            .ok_or_else(|| BackendError::Unreachable("Connection already closed".to_string()))?;

        loop {
            let Some(frame) = ws.next().await else {
                return Err(BackendError::Unreachable(
                    "ComfyUI WebSocket stream ended".to_string(),
                ));
            };

            match frame {
                Ok(Message::Text(text)) => match parse_message(&text) {
                    Ok(message) => {
                        if let Some(update) = self.tracker.observe(message, &execution.0) {
                            return Ok(update);
                        }
                    }
                    Err(e) => {
                        tracing::trace!(
                            backend_id = %self.backend_id,
                            error = %e,
                            "Skipping unrecognised ComfyUI frame",
                        );
                    }
                },
                // Preview images.
                Ok(Message::Binary(_)) => {}
                Ok(Message::Close(frame)) => {
                    return Err(BackendError::Unreachable(format!(
                        "ComfyUI closed the connection: {frame:?}"
                    )));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(BackendError::Unreachable(format!(
                        "WebSocket receive error: {e}"
                    )));
                }
            }
        }
    }

    async fn fetch_outputs(
        &mut self,
        execution: &ExecutionRef,
    ) -> Result<serde_json::Value, BackendError> {
        let history = self.api.get_history(&execution.0).await?;
        outputs_from_history(&history, &execution.0).ok_or_else(|| {
            BackendError::Malformed(format!("History has no outputs for prompt {execution}"))
        })
    }

    /// Drop the prompt from the pending queue, and interrupt it if it is the
    /// one currently executing. `/interrupt` is not prompt-scoped, so it is
    /// only sent after checking the running queue.
    async fn interrupt(&mut self, execution: &ExecutionRef) -> Result<(), BackendError> {
        self.api.cancel_execution(&execution.0).await?;

        let queue = self.api.get_queue().await?;
        if queue.is_running(&execution.0) {
            self.api.interrupt().await?;
        }

        tracing::info!(
            backend_id = %self.backend_id,
            prompt_id = %execution,
            "Prompt interrupted",
        );
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut ws) = self.ws_stream.take() {
            if let Err(e) = ws.close(None).await {
                tracing::debug!(
                    backend_id = %self.backend_id,
                    error = %e,
                    "Error while closing ComfyUI WebSocket",
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame interpretation
// ---------------------------------------------------------------------------

/// Turns the ComfyUI frame stream into [`BackendUpdate`]s for one prompt.
#[derive(Debug, Default)]
struct PromptTracker {
    progress: u8,
    node: Option<String>,
}

impl PromptTracker {
    /// Interpret one frame. Returns `None` for frames that say nothing new
    /// about `prompt_id`.
    fn observe(&mut self, message: ComfyUIMessage, prompt_id: &str) -> Option<BackendUpdate> {
        match message {
            ComfyUIMessage::Progress(data) => {
                if data.prompt_id.as_deref().is_some_and(|id| id != prompt_id) {
                    return None;
                }
                self.progress = data.percent();
                if data.node.is_some() {
                    self.node = data.node;
                }
                Some(self.progress_update())
            }
            ComfyUIMessage::Executing(data) => {
                if data.prompt_id.as_deref() != Some(prompt_id) {
                    return None;
                }
                match data.node {
                    Some(node) => {
                        self.node = Some(node);
                        Some(self.progress_update())
                    }
                    None => Some(BackendUpdate::Finished),
                }
            }
            ComfyUIMessage::ExecutionSuccess(data) if data.prompt_id == prompt_id => {
                Some(BackendUpdate::Finished)
            }
            ComfyUIMessage::ExecutionError(data) if data.prompt_id == prompt_id => {
                Some(BackendUpdate::Failed {
                    message: format!(
                        "{}: {} (node {})",
                        data.exception_type, data.exception_message, data.node_id
                    ),
                })
            }
            ComfyUIMessage::ExecutionInterrupted(data) if data.prompt_id == prompt_id => {
                Some(BackendUpdate::Failed {
                    message: "Execution interrupted on the worker".to_string(),
                })
            }
            _ => None,
        }
    }

    fn progress_update(&self) -> BackendUpdate {
        BackendUpdate::Progress {
            progress: self.progress,
            step: self.node.clone(),
        }
    }
}
