//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps prompt submission, queue inspection, cancellation, interruption
//! and history retrieval using [`reqwest`].

use renderfarm_core::backend::BackendError;
use serde::Deserialize;

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Response returned by `POST /prompt` after queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
}

/// Response of `GET /queue`.
///
/// Entries are kept opaque; only their presence matters to the scheduler.
#[derive(Debug, Default, Deserialize)]
pub struct QueueResponse {
    #[serde(default)]
    pub queue_running: Vec<serde_json::Value>,
    #[serde(default)]
    pub queue_pending: Vec<serde_json::Value>,
}

impl QueueResponse {
    /// Whether the instance is executing or has anything waiting.
    pub fn is_busy(&self) -> bool {
        !self.queue_running.is_empty() || !self.queue_pending.is_empty()
    }

    /// Whether `prompt_id` is the prompt currently executing.
    ///
    /// Queue entries are `[number, prompt_id, prompt, extra_data, outputs]`.
    pub fn is_running(&self, prompt_id: &str) -> bool {
        self.queue_running
            .iter()
            .any(|entry| entry.get(1).and_then(serde_json::Value::as_str) == Some(prompt_id))
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, body decoding).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

impl From<ComfyUIApiError> for BackendError {
    /// 4xx answers mean ComfyUI looked at the request and refused it;
    /// everything else is treated as the instance being unreachable.
    fn from(err: ComfyUIApiError) -> Self {
        match &err {
            ComfyUIApiError::ApiError { status, .. } if (400..500).contains(status) => {
                BackendError::Rejected(err.to_string())
            }
            ComfyUIApiError::Request(e) if e.is_decode() => {
                BackendError::Malformed(err.to_string())
            }
            _ => BackendError::Unreachable(err.to_string()),
        }
    }
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// so that instances share one connection pool.
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution (`POST /prompt`).
    ///
    /// `client_id` must match the WebSocket connection that should receive
    /// progress frames for this prompt.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Remove a prompt from the pending queue (`POST /queue`).
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Interrupt whatever is executing right now (`POST /interrupt`).
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;

        Self::check_status(response).await
    }

    /// Execution history for one prompt (`GET /history/{prompt_id}`).
    ///
    /// The body is keyed by prompt id; each entry holds per-node outputs.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Current execution queue (`GET /queue`). Used as the liveness probe.
    pub async fn get_queue(&self) -> Result<QueueResponse, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/queue", self.api_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Return the response unchanged on 2xx, otherwise an
    /// [`ComfyUIApiError::ApiError`] carrying status and body text.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

/// Extract the outputs of `prompt_id` from a `/history/{prompt_id}` body.
pub fn outputs_from_history(
    history: &serde_json::Value,
    prompt_id: &str,
) -> Option<serde_json::Value> {
    history.get(prompt_id)?.get("outputs").cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn client_errors_are_rejections() {
        let err = ComfyUIApiError::ApiError {
            status: 400,
            body: r#"{"error":"invalid prompt"}"#.to_string(),
        };
        assert_matches!(BackendError::from(err), BackendError::Rejected(msg) if msg.contains("invalid prompt"));
    }

    #[test]
    fn server_errors_are_unreachable() {
        let err = ComfyUIApiError::ApiError {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_matches!(BackendError::from(err), BackendError::Unreachable(_));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let api = ComfyUIApi::new("http://gpu-a:8188/".to_string());
        assert_eq!(api.api_url(), "http://gpu-a:8188");
    }

    #[test]
    fn queue_busy_when_running_or_pending() {
        let idle: QueueResponse =
            serde_json::from_str(r#"{"queue_running":[],"queue_pending":[]}"#).unwrap();
        assert!(!idle.is_busy());

        let busy: QueueResponse =
            serde_json::from_str(r#"{"queue_running":[[0,"abc",{}]],"queue_pending":[]}"#)
                .unwrap();
        assert!(busy.is_busy());
        assert!(busy.is_running("abc"));
        assert!(!busy.is_running("def"));

        let missing: QueueResponse = serde_json::from_str("{}").unwrap();
        assert!(!missing.is_busy());
    }

    #[test]
    fn outputs_are_read_from_prompt_entry() {
        let history = serde_json::json!({
            "abc": {"outputs": {"9": {"images": [{"filename": "out.png"}]}}, "status": {}}
        });
        let outputs = outputs_from_history(&history, "abc").unwrap();
        assert_eq!(outputs["9"]["images"][0]["filename"], "out.png");
        assert!(outputs_from_history(&history, "other").is_none());
    }

    #[tokio::test]
    async fn refused_connection_maps_to_unreachable() {
        let api = ComfyUIApi::new("http://127.0.0.1:1".to_string());
        let err = api.get_queue().await.unwrap_err();
        assert_matches!(BackendError::from(err), BackendError::Unreachable(_));
    }
}
