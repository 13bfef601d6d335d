//! Progress events published while a batch runs.

use serde::Serialize;

use comfybatch_core::job::JobResult;
use comfybatch_core::types::ItemNumber;

/// Broadcast channel capacity for batch events.
pub const BATCH_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    ItemStarted {
        number: ItemNumber,
        total: usize,
    },
    ItemSubmitted {
        number: ItemNumber,
        prompt_id: String,
    },
    ItemProgress {
        number: ItemNumber,
        percent: u8,
    },
    ItemFinished {
        result: JobResult,
    },
    BatchFinished {
        succeeded: usize,
        failed: usize,
        cancelled: usize,
        skipped: usize,
    },
}
