//! Sequential batch runner.
//!
//! Items run one at a time against a single ComfyUI server. A failing item
//! never stops the batch; once the cancellation token fires the current
//! item is stopped and every remaining item is recorded as skipped.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use comfybatch_comfyui::client::ComfyUIClient;
use comfybatch_comfyui::processor::{run_event_stream, EVENT_CHANNEL_CAPACITY};
use comfybatch_core::batch::BatchItem;
use comfybatch_core::error::CoreError;
use comfybatch_core::job::{BatchReport, JobResult, JobStatus};

use crate::context::BatchContext;
use crate::error::PipelineError;
use crate::events::{BatchEvent, BATCH_EVENT_CAPACITY};
use crate::generator::ImageGenerator;

pub struct BatchRunner {
    ctx: Arc<BatchContext>,
    events: broadcast::Sender<BatchEvent>,
}

impl BatchRunner {
    pub fn new(ctx: BatchContext) -> Self {
        let (events, _) = broadcast::channel(BATCH_EVENT_CAPACITY);
        Self {
            ctx: Arc::new(ctx),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    pub async fn run(
        &self,
        items: &[BatchItem],
        cancel: &CancellationToken,
    ) -> Result<BatchReport, PipelineError> {
        let started_at = Utc::now();
        let options = &self.ctx.options;
        tokio::fs::create_dir_all(&options.output_dir)
            .await
            .map_err(|e| CoreError::io(&options.output_dir, e))?;

        let client = ComfyUIClient::new(self.ctx.api.ws_url());
        let client_id = client.client_id().to_string();
        let (comfy_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let stream_cancel = cancel.child_token();
        let stream_task = options.websocket.then(|| {
            let tx = comfy_tx.clone();
            let stream_cancel = stream_cancel.clone();
            tokio::spawn(async move { run_event_stream(&client, &tx, &stream_cancel).await })
        });

        let generator = ImageGenerator::new(
            Arc::clone(&self.ctx),
            client_id,
            comfy_tx,
            self.events.clone(),
        );

        let total = items.len();
        tracing::info!(
            total,
            server = %self.ctx.api.api_url(),
            output_dir = %options.output_dir.display(),
            "Starting batch",
        );

        let mut results = Vec::with_capacity(total);
        for item in items {
            let result = if cancel.is_cancelled() {
                JobResult::skipped(item.number, item.image.clone())
            } else {
                tracing::info!(number = item.number, total, "Processing item");
                let _ = self.events.send(BatchEvent::ItemStarted {
                    number: item.number,
                    total,
                });
                generator.generate(item, cancel).await
            };
            let _ = self.events.send(BatchEvent::ItemFinished {
                result: result.clone(),
            });
            results.push(result);
        }

        stream_cancel.cancel();
        if let Some(task) = stream_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "WebSocket task ended abnormally");
            }
        }

        let report = BatchReport {
            started_at,
            finished_at: Utc::now(),
            server_url: self.ctx.api.api_url().to_string(),
            workflow_path: self.ctx.workflow.source().map(Path::to_path_buf),
            workflow_hash: self.ctx.workflow.hash().to_string(),
            results,
        };

        if options.write_report {
            match report.write_to(&options.output_dir) {
                Ok(path) => tracing::info!(path = %path.display(), "Report written"),
                Err(e) => tracing::error!(error = %e, "Failed to write report"),
            }
        }

        let (succeeded, failed) = (report.succeeded(), report.failed());
        let cancelled = report.count(JobStatus::Cancelled);
        let skipped = report.count(JobStatus::Skipped);
        tracing::info!(succeeded, failed, cancelled, skipped, "Batch finished");
        let _ = self.events.send(BatchEvent::BatchFinished {
            succeeded,
            failed,
            cancelled,
            skipped,
        });

        Ok(report)
    }
}
