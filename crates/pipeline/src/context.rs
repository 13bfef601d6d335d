//! Everything a run needs, shared read-only by the runner and generator.

use std::path::PathBuf;
use std::time::Duration;

use comfybatch_comfyui::api::ComfyUIApi;
use comfybatch_comfyui::retry::RetryConfig;
use comfybatch_core::mapping::{FieldValues, ResolvedMapping};
use comfybatch_core::workflow::WorkflowDocument;

use crate::error::PipelineError;
use crate::settings::Settings;
use crate::translate::PromptTranslator;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub output_dir: PathBuf,
    pub poll_interval: Duration,
    /// Longest time to wait for one prompt to finish.
    pub timeout: Duration,
    pub websocket: bool,
    pub write_report: bool,
    /// `--set` overrides; the highest-precedence field layer.
    pub overrides: FieldValues,
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            output_dir: settings.output.dir.clone(),
            poll_interval: settings.comfyui.poll_interval,
            timeout: settings.comfyui.timeout,
            websocket: settings.comfyui.websocket,
            write_report: settings.output.report,
            overrides: FieldValues::new(),
        }
    }
}

pub struct BatchContext {
    pub api: ComfyUIApi,
    pub workflow: WorkflowDocument,
    /// Resolved once per run and never mutated afterwards.
    pub mapping: ResolvedMapping,
    pub translator: PromptTranslator,
    pub options: RunOptions,
}

/// Build the ComfyUI client described by `settings`.
pub fn api_from_settings(settings: &Settings) -> Result<ComfyUIApi, PipelineError> {
    let retry = RetryConfig::with_attempts(settings.comfyui.retry_count.max(1));
    Ok(ComfyUIApi::with_config(
        settings.comfyui.url.clone(),
        settings.comfyui.timeout,
        retry,
    )?)
}
