//! Typed view of the ComfyUI `/history/{prompt_id}` response.
//!
//! The endpoint returns `{}` while a prompt is still queued or running and
//! `{"<prompt_id>": {...}}` once it has finished. Node outputs are kept
//! loosely typed because custom nodes put arbitrary keys there; only the
//! file lists (`images`, `gifs`, `videos`) are interpreted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Output keys that carry lists of files.
const FILE_OUTPUT_KEYS: &[&str] = &["images", "gifs", "videos"];

/// Folder type of files written by `SaveImage`-style nodes.
pub const OUTPUT_FOLDER: &str = "output";

/// A file produced by a node, addressable through `/view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder")]
    pub folder_type: String,
}

fn default_folder() -> String {
    OUTPUT_FOLDER.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[event_name, data]` pairs recorded during execution.
    #[serde(default)]
    pub messages: Vec<(String, serde_json::Value)>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Where a prompt is in its lifecycle, as far as history can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Succeeded,
    Failed(String),
}

impl HistoryEntry {
    pub fn state(&self) -> ExecutionState {
        match &self.status {
            Some(status) if status.status_str == "error" => {
                let message = self
                    .error_message()
                    .unwrap_or_else(|| "execution failed".to_string());
                ExecutionState::Failed(message)
            }
            Some(status) if status.completed => ExecutionState::Succeeded,
            Some(_) => ExecutionState::Pending,
            // Older servers omit `status`; outputs mean it finished.
            None if !self.outputs.is_empty() => ExecutionState::Succeeded,
            None => ExecutionState::Pending,
        }
    }

    /// Files produced by the prompt, in node-id order.
    ///
    /// Files saved to the `output` folder are preferred; when a workflow
    /// only previews (temp files), those are returned instead.
    pub fn output_files(&self) -> Vec<OutputFile> {
        let mut node_ids: Vec<&String> = self.outputs.keys().collect();
        node_ids.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => a.cmp(b),
        });

        let all: Vec<OutputFile> = node_ids
            .into_iter()
            .flat_map(|id| {
                let output = &self.outputs[id];
                FILE_OUTPUT_KEYS
                    .iter()
                    .filter_map(|key| output.get(*key).and_then(|v| v.as_array()))
                    .flatten()
                    .filter_map(|v| serde_json::from_value::<OutputFile>(v.clone()).ok())
                    .collect::<Vec<_>>()
            })
            .collect();

        if all.iter().any(|f| f.folder_type == OUTPUT_FOLDER) {
            all.into_iter()
                .filter(|f| f.folder_type == OUTPUT_FOLDER)
                .collect()
        } else {
            all
        }
    }

    /// Human-readable failure reason from the recorded messages.
    pub fn error_message(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        for (kind, data) in &status.messages {
            match kind.as_str() {
                "execution_error" => {
                    let message = data
                        .get("exception_message")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error")
                        .trim();
                    return Some(match data.get("node_type").and_then(|v| v.as_str()) {
                        Some(node_type) => format!("{node_type}: {message}"),
                        None => message.to_string(),
                    });
                }
                "execution_interrupted" => return Some("execution interrupted".to_string()),
                _ => {}
            }
        }
        None
    }
}

/// Pick the entry for `prompt_id` out of a raw `/history` response.
pub fn entry_for(
    response: &serde_json::Value,
    prompt_id: &str,
) -> Result<Option<HistoryEntry>, serde_json::Error> {
    match response.get(prompt_id) {
        Some(raw) => serde_json::from_value(raw.clone()).map(Some),
        None => Ok(None),
    }
}
