//! Execution events derived from the ComfyUI WebSocket stream.
//!
//! Raw messages are interpreted by [`crate::processor`] and fanned out on
//! a broadcast channel so any number of listeners (the completion waiter,
//! progress printers) can follow a prompt without touching the socket.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ComfyUIEvent {
    Connected { client_id: String },

    Disconnected { client_id: String },

    /// Current queue depth on the server.
    QueueStatus { queue_remaining: i32 },

    ExecutionStarted { prompt_id: String },

    /// Step progress. `prompt_id` is missing on older servers.
    Progress {
        prompt_id: Option<String>,
        /// Completion percentage (0-100).
        percent: u8,
        current_node: Option<String>,
    },

    /// The prompt finished; outputs can be read from history.
    ExecutionCompleted { prompt_id: String },

    ExecutionFailed { prompt_id: String, error: String },

    ExecutionInterrupted { prompt_id: String },
}

impl ComfyUIEvent {
    /// True for events after which a prompt will not change any more.
    pub fn is_terminal_for(&self, prompt: &str) -> bool {
        match self {
            Self::ExecutionCompleted { prompt_id }
            | Self::ExecutionFailed { prompt_id, .. }
            | Self::ExecutionInterrupted { prompt_id } => prompt_id == prompt,
            _ => false,
        }
    }
}
