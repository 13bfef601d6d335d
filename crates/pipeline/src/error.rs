use std::time::Duration;

use comfybatch_comfyui::api::ComfyUIApiError;
use comfybatch_core::error::CoreError;

use crate::translate::TranslateError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    Translate(#[from] TranslateError),

    /// ComfyUI ran the prompt and reported an error.
    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Prompt {prompt_id} did not finish within {}s", waited.as_secs())]
    Timeout { prompt_id: String, waited: Duration },

    #[error("Prompt {0} finished without producing any output files")]
    NoOutputs(String),

    #[error("Cancelled")]
    Cancelled,
}
