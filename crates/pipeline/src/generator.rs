//! Running one batch item end to end.
//!
//! validate image → translate prompts → upload image → build field values
//! → apply mapping → submit → wait → download outputs. Every failure ends
//! up in the returned [`JobResult`]; nothing here aborts the batch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use comfybatch_comfyui::events::ComfyUIEvent;
use comfybatch_comfyui::history::{ExecutionState, HistoryEntry};
use comfybatch_core::batch::BatchItem;
use comfybatch_core::error::CoreError;
use comfybatch_core::input_image::validate_input_image;
use comfybatch_core::job::JobResult;
use comfybatch_core::mapping::{
    layer_fields, resolve_seed, FieldValues, FIELD_IMAGE, FIELD_NEGATIVE_PROMPT,
    FIELD_POSITIVE_PROMPT,
};
use comfybatch_core::naming::{extension_of, output_filename};
use comfybatch_core::types::ItemNumber;

use crate::context::BatchContext;
use crate::error::PipelineError;
use crate::events::BatchEvent;

/// History is re-checked this soon after a WebSocket terminal event, since
/// the server may send the event just before it stores the history entry.
const SETTLE_INTERVAL: Duration = Duration::from_millis(250);

pub struct ImageGenerator {
    ctx: Arc<BatchContext>,
    client_id: String,
    comfy_events: broadcast::Sender<ComfyUIEvent>,
    batch_events: broadcast::Sender<BatchEvent>,
}

impl ImageGenerator {
    /// * `client_id` - the id the WebSocket connected with, so execution
    ///   messages for our prompts are delivered to it.
    pub fn new(
        ctx: Arc<BatchContext>,
        client_id: String,
        comfy_events: broadcast::Sender<ComfyUIEvent>,
        batch_events: broadcast::Sender<BatchEvent>,
    ) -> Self {
        Self {
            ctx,
            client_id,
            comfy_events,
            batch_events,
        }
    }

    pub async fn generate(&self, item: &BatchItem, cancel: &CancellationToken) -> JobResult {
        let started = Instant::now();
        let mut prompt_id = None;
        let outcome = self.run(item, cancel, &mut prompt_id).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(outputs) => {
                tracing::info!(
                    number = item.number,
                    prompt_id = ?prompt_id,
                    outputs = outputs.len(),
                    elapsed_ms,
                    "Item completed",
                );
                JobResult::success(
                    item.number,
                    item.image.clone(),
                    prompt_id.unwrap_or_default(),
                    outputs,
                    elapsed_ms,
                )
            }
            Err(PipelineError::Cancelled) => {
                tracing::warn!(number = item.number, prompt_id = ?prompt_id, "Item cancelled");
                JobResult::cancelled(item.number, item.image.clone(), prompt_id, elapsed_ms)
            }
            Err(e) => {
                tracing::error!(
                    number = item.number,
                    prompt_id = ?prompt_id,
                    error = %e,
                    "Item failed",
                );
                let image = item.image.clone();
                JobResult::failed(item.number, image, prompt_id, e.to_string(), elapsed_ms)
            }
        }
    }

    async fn run(
        &self,
        item: &BatchItem,
        cancel: &CancellationToken,
        prompt_id: &mut Option<String>,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let values = self.field_values(item).await?;
        let workflow = self.ctx.mapping.apply(&self.ctx.workflow, &values)?;

        // Subscribe before submitting so a fast prompt's events are not lost.
        let mut events = self.comfy_events.subscribe();
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let submitted = self
            .ctx
            .api
            .submit_workflow(&workflow, &self.client_id)
            .await?;
        let id = submitted.prompt_id;
        *prompt_id = Some(id.clone());
        tracing::info!(
            number = item.number,
            prompt_id = %id,
            queue_position = submitted.number,
            "Workflow queued",
        );
        let _ = self.batch_events.send(BatchEvent::ItemSubmitted {
            number: item.number,
            prompt_id: id.clone(),
        });

        let entry = match self
            .wait_for_completion(item.number, &id, &mut events, cancel)
            .await
        {
            Ok(entry) => entry,
            // The server already finished with this prompt.
            Err(e @ PipelineError::Execution(_)) => return Err(e),
            Err(e) => {
                self.stop_prompt(&id).await;
                return Err(e);
            }
        };

        self.save_outputs(item, &id, &entry).await
    }

    /// Layer defaults, item fields and overrides, then fill in prompts,
    /// the uploaded image and a concrete seed.
    async fn field_values(&self, item: &BatchItem) -> Result<FieldValues, PipelineError> {
        let mapping = &self.ctx.mapping;

        if let Some(image) = &item.image {
            let info = validate_input_image(image)?;
            tracing::debug!(
                number = item.number,
                image = %image.display(),
                width = info.width,
                height = info.height,
                format = %info.format,
                "Input image validated",
            );
        }

        let overrides = &self.ctx.options.overrides;
        let mut values = layer_fields([mapping.defaults(), &item.fields, overrides]);

        if !item.prompt.trim().is_empty() {
            values.insert(FIELD_POSITIVE_PROMPT.to_string(), item.prompt.clone());
        }
        if let Some(negative) = &item.negative_prompt {
            values.insert(FIELD_NEGATIVE_PROMPT.to_string(), negative.clone());
        }

        for field in [FIELD_POSITIVE_PROMPT, FIELD_NEGATIVE_PROMPT] {
            if let Some(text) = values.get(field).cloned() {
                let translated = self.ctx.translator.translate(&text).await;
                values.insert(field.to_string(), translated);
            }
        }

        if let Some(image) = &item.image {
            if mapping.is_bound(FIELD_IMAGE) {
                let uploaded = self.ctx.api.upload_image(image).await?;
                values.insert(FIELD_IMAGE.to_string(), uploaded.reference());
            } else {
                tracing::warn!(
                    number = item.number,
                    "Item has an input image but the mapping binds no `image` field; image not used",
                );
            }
        }

        resolve_seed(&mut values, item.number)?;
        Ok(values)
    }

    /// Poll history until the prompt finishes, waking early on WebSocket
    /// terminal events. Failed history reads are logged and retried until
    /// the deadline.
    async fn wait_for_completion(
        &self,
        number: ItemNumber,
        prompt_id: &str,
        events: &mut broadcast::Receiver<ComfyUIEvent>,
        cancel: &CancellationToken,
    ) -> Result<HistoryEntry, PipelineError> {
        let options = &self.ctx.options;
        let deadline = tokio::time::Instant::now() + options.timeout;
        let mut next_wait = options.poll_interval;

        loop {
            match self.ctx.api.get_history(prompt_id).await {
                Ok(Some(entry)) => match entry.state() {
                    ExecutionState::Succeeded => return Ok(entry),
                    ExecutionState::Failed(message) => {
                        return Err(PipelineError::Execution(message));
                    }
                    ExecutionState::Pending => {}
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(prompt_id, error = %e, "History check failed; still waiting");
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(PipelineError::Timeout {
                    prompt_id: prompt_id.to_string(),
                    waited: options.timeout,
                });
            }
            let wake_at = (now + next_wait).min(deadline);
            next_wait = options.poll_interval;

            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = self.follow_events(number, prompt_id, events) => {
                    next_wait = SETTLE_INTERVAL;
                }
            }
        }
    }

    /// Forward progress for `prompt_id` until a terminal event arrives.
    /// Never returns if the WebSocket is unavailable.
    async fn follow_events(
        &self,
        number: ItemNumber,
        prompt_id: &str,
        events: &mut broadcast::Receiver<ComfyUIEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) if event.is_terminal_for(prompt_id) => return,
                Ok(ComfyUIEvent::Progress {
                    prompt_id: for_prompt,
                    percent,
                    ..
                }) if for_prompt.as_deref().map_or(true, |p| p == prompt_id) => {
                    let _ = self
                        .batch_events
                        .send(BatchEvent::ItemProgress { number, percent });
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Execution event receiver lagged");
                }
                Err(RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    }

    /// Best effort: interrupt the prompt if it is running, otherwise drop
    /// it from the queue.
    async fn stop_prompt(&self, prompt_id: &str) {
        let api = &self.ctx.api;
        let running = match api.queue().await {
            Ok(queue) => Some(is_running(&queue, prompt_id)),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read the ComfyUI queue");
                None
            }
        };

        let result = match running {
            Some(true) => api.interrupt().await,
            Some(false) => api.cancel_execution(prompt_id).await,
            None => match api.cancel_execution(prompt_id).await {
                Ok(()) => api.interrupt().await,
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => tracing::info!(prompt_id, "Stopped prompt on ComfyUI"),
            Err(e) => tracing::warn!(prompt_id, error = %e, "Failed to stop prompt on ComfyUI"),
        }
    }

    async fn save_outputs(
        &self,
        item: &BatchItem,
        prompt_id: &str,
        entry: &HistoryEntry,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let files = entry.output_files();
        if files.is_empty() {
            return Err(PipelineError::NoOutputs(prompt_id.to_string()));
        }

        let stem = item.source_stem();
        let mut saved = Vec::with_capacity(files.len());
        for (index, file) in files.iter().enumerate() {
            let bytes = self.ctx.api.view(file).await?;
            let name = output_filename(
                item.number,
                stem.as_deref(),
                index,
                extension_of(&file.filename),
            );
            let path = self.ctx.options.output_dir.join(name);
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|e| CoreError::io(&path, e))?;
            tracing::debug!(
                number = item.number,
                server_file = %file.filename,
                path = %path.display(),
                bytes = bytes.len(),
                "Output saved",
            );
            saved.push(path);
        }
        Ok(saved)
    }
}

/// Whether `/queue` lists `prompt_id` as currently running.
///
/// Queue entries are arrays: `[number, prompt_id, prompt, extra, outputs]`.
fn is_running(queue: &serde_json::Value, prompt_id: &str) -> bool {
    queue
        .get("queue_running")
        .and_then(|v| v.as_array())
        .is_some_and(|running| {
            running
                .iter()
                .any(|entry| entry.get(1).and_then(|v| v.as_str()) == Some(prompt_id))
        })
}
