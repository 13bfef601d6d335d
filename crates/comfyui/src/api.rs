//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission, history retrieval, output download, image
//! upload, and queue control using [`reqwest`]. Transport failures and
//! 5xx responses are retried with exponential backoff; 4xx responses are
//! returned immediately.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::history::{entry_for, HistoryEntry, OutputFile};
use crate::retry::{with_retry, RetryConfig};

/// Default per-request timeout. Large video workflows can take a long time
/// to return from `/view`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2700);

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    retry: RetryConfig,
}

/// Response returned by `/prompt` after successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation errors; empty when the prompt was accepted.
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// An image stored in the server's `input` folder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadedImage {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

impl UploadedImage {
    /// The value a `LoadImage` node expects: `subfolder/name` or `name`.
    pub fn reference(&self) -> String {
        if self.subfolder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.subfolder, self.name)
        }
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// `/prompt` refused the workflow during validation.
    #[error("Workflow rejected by ComfyUI: {0}")]
    Rejected(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected response from ComfyUI: {0}")]
    InvalidResponse(String),
}

impl ComfyUIApiError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(e) => !e.is_builder() && !e.is_decode(),
            Self::ApiError { status, .. } => *status >= 500,
            Self::Rejected(_) | Self::Io { .. } | Self::InvalidResponse(_) => false,
        }
    }
}

impl ComfyUIApi {
    /// Create a client with the default timeout and retry policy.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: impl Into<String>) -> Result<Self, ComfyUIApiError> {
        Self::with_config(api_url, DEFAULT_TIMEOUT, RetryConfig::default())
    }

    pub fn with_config(
        api_url: impl Into<String>,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            retry,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// WebSocket base URL derived from the HTTP one.
    pub fn ws_url(&self) -> String {
        if let Some(rest) = self.api_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.api_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{}", self.api_url)
        }
    }

    /// Submit a workflow for execution.
    ///
    /// A 400 from ComfyUI means the graph failed validation; the error
    /// and per-node messages are summarized into [`ComfyUIApiError::Rejected`].
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });
        let url = format!("{}/prompt", self.api_url);

        let result = self
            .retrying(|| async {
                let response = self.client.post(&url).json(&body).send().await?;
                Self::parse_response::<SubmitResponse>(response).await
            })
            .await;

        match result {
            Err(ComfyUIApiError::ApiError { status: 400, body }) => {
                Err(ComfyUIApiError::Rejected(summarize_rejection(&body)))
            }
            other => other,
        }
    }

    /// History entry for `prompt_id`, or `None` while it has not finished.
    pub async fn get_history(
        &self,
        prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        let url = format!("{}/history/{}", self.api_url, prompt_id);
        let raw: serde_json::Value = self
            .retrying(|| async {
                let response = self.client.get(&url).send().await?;
                Self::parse_response(response).await
            })
            .await?;

        entry_for(&raw, prompt_id)
            .map_err(|e| ComfyUIApiError::InvalidResponse(format!("history entry: {e}")))
    }

    /// Download an output file via `GET /view`.
    pub async fn view(&self, file: &OutputFile) -> Result<Vec<u8>, ComfyUIApiError> {
        let url = format!("{}/view", self.api_url);
        let query = [
            ("filename", file.filename.as_str()),
            ("subfolder", file.subfolder.as_str()),
            ("type", file.folder_type.as_str()),
        ];

        self.retrying(|| async {
            let response = self.client.get(&url).query(&query).send().await?;
            let response = Self::ensure_success(response).await?;
            Ok(response.bytes().await?.to_vec())
        })
        .await
    }

    /// Upload a local image into the server's `input` folder.
    ///
    /// Existing files with the same name are overwritten so reruns of a
    /// batch reference the current image.
    pub async fn upload_image(&self, path: &Path) -> Result<UploadedImage, ComfyUIApiError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ComfyUIApiError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.png".to_string());
        let url = format!("{}/upload/image", self.api_url);

        self.retrying(|| async {
            let part = reqwest::multipart::Part::bytes(bytes.clone()).file_name(file_name.clone());
            let form = reqwest::multipart::Form::new()
                .part("image", part)
                .text("overwrite", "true");
            let response = self.client.post(&url).multipart(form).send().await?;
            Self::parse_response(response).await
        })
        .await
    }

    /// `GET /system_stats`: version, devices and VRAM.
    pub async fn system_stats(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let url = format!("{}/system_stats", self.api_url);
        self.retrying(|| async {
            let response = self.client.get(&url).send().await?;
            Self::parse_response(response).await
        })
        .await
    }

    /// `GET /queue`: running and pending prompts.
    pub async fn queue(&self) -> Result<serde_json::Value, ComfyUIApiError> {
        let url = format!("{}/queue", self.api_url);
        self.retrying(|| async {
            let response = self.client.get(&url).send().await?;
            Self::parse_response(response).await
        })
        .await
    }

    /// Remove a pending prompt from the queue.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({ "delete": [prompt_id] });
        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await?;
        Self::ensure_success(response).await.map(|_| ())
    }

    /// Interrupt whatever is executing right now.
    ///
    /// Not retried: a late interrupt could hit the next prompt.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self
            .client
            .post(format!("{}/interrupt", self.api_url))
            .send()
            .await?;
        Self::ensure_success(response).await.map(|_| ())
    }

    // ---- private helpers ----

    async fn retrying<T, F, Fut>(&self, op: F) -> Result<T, ComfyUIApiError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ComfyUIApiError>>,
    {
        with_retry(&self.retry, op, ComfyUIApiError::is_retryable).await
    }

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
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| ComfyUIApiError::InvalidResponse(e.to_string()))
    }
}

/// Turn a `/prompt` 400 body into one line.
///
/// ComfyUI answers with `{"error": {"message": ...}, "node_errors": {"<id>":
/// {"class_type": ..., "errors": [{"message": ..., "details": ...}]}}}`.
fn summarize_rejection(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };

    let mut parts = Vec::new();
    if let Some(message) = json.pointer("/error/message").and_then(|v| v.as_str()) {
        parts.push(message.to_string());
    }

    if let Some(nodes) = json.get("node_errors").and_then(|v| v.as_object()) {
        for (node_id, node) in nodes {
            let class_type = node.get("class_type").and_then(|v| v.as_str()).unwrap_or("?");
            let errors = node
                .get("errors")
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .filter_map(|e| {
                    let message = e.get("message").and_then(|v| v.as_str())?;
                    Some(match e.get("details").and_then(|v| v.as_str()) {
                        Some(d) if !d.is_empty() => format!("{message} ({d})"),
                        _ => message.to_string(),
                    })
                })
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("node {node_id} [{class_type}]: {errors}"));
        }
    }

    if parts.is_empty() {
        body.trim().to_string()
    } else {
        parts.join("; ")
    }
}
