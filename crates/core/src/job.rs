//! Per-item results and the batch report written at the end of a run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{ItemNumber, Timestamp};

/// File name of the report written into the output directory.
pub const REPORT_FILE_NAME: &str = "report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Failed,
    /// Interrupted while running.
    Cancelled,
    /// Never started because the batch was cancelled first.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub number: ItemNumber,
    pub input_image: Option<PathBuf>,
    pub prompt_id: Option<String>,
    pub outputs: Vec<PathBuf>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl JobResult {
    pub fn success(
        number: ItemNumber,
        input_image: Option<PathBuf>,
        prompt_id: String,
        outputs: Vec<PathBuf>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            number,
            input_image,
            prompt_id: Some(prompt_id),
            outputs,
            status: JobStatus::Success,
            error: None,
            elapsed_ms,
        }
    }

    pub fn failed(
        number: ItemNumber,
        input_image: Option<PathBuf>,
        prompt_id: Option<String>,
        error: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            number,
            input_image,
            prompt_id,
            outputs: Vec::new(),
            status: JobStatus::Failed,
            error: Some(error.into()),
            elapsed_ms,
        }
    }

    pub fn cancelled(
        number: ItemNumber,
        input_image: Option<PathBuf>,
        prompt_id: Option<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            number,
            input_image,
            prompt_id,
            outputs: Vec::new(),
            status: JobStatus::Cancelled,
            error: None,
            elapsed_ms,
        }
    }

    pub fn skipped(number: ItemNumber, input_image: Option<PathBuf>) -> Self {
        Self {
            number,
            input_image,
            prompt_id: None,
            outputs: Vec::new(),
            status: JobStatus::Skipped,
            error: None,
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

/// Summary of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub server_url: String,
    pub workflow_path: Option<PathBuf>,
    pub workflow_hash: String,
    pub results: Vec<JobResult>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.count(JobStatus::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(JobStatus::Failed)
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// True when every item succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(JobResult::is_success)
    }

    /// Write the report as pretty JSON into `dir`, returning its path.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, CoreError> {
        std::fs::create_dir_all(dir).map_err(|e| CoreError::io(dir, e))?;
        let path = dir.join(REPORT_FILE_NAME);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize report: {e}")))?;
        std::fs::write(&path, json).map_err(|e| CoreError::io(&path, e))?;
        Ok(path)
    }
}
