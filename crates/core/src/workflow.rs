//! ComfyUI workflow documents (API format).
//!
//! Loads the JSON graph exported with "Save (API Format)", discovers the
//! parameters a user is likely to want to bind, and gives read/write
//! access to individual node inputs through [`BindingPath`]s.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::hashing::sha256_hex;
use crate::mapping::BindingPath;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Maximum workflow file size in bytes (10 MB).
pub const MAX_WORKFLOW_JSON_SIZE: usize = 10_000_000;

/// Maximum number of discovered parameters per workflow.
pub const MAX_DISCOVERED_PARAMS: usize = 100;

// ---------------------------------------------------------------------------
// ComfyUI node class types used for heuristic detection
// ---------------------------------------------------------------------------

const KSAMPLER_CLASS: &str = "KSampler";
const KSAMPLER_ADVANCED_CLASS: &str = "KSamplerAdvanced";
const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";
const LOAD_IMAGE_CLASS: &str = "LoadImage";
const LOAD_CHECKPOINT_CLASS: &str = "CheckpointLoaderSimple";
const LOAD_LORA_CLASS: &str = "LoraLoader";
const EMPTY_LATENT_CLASSES: &[&str] = &["EmptyLatentImage", "EmptySD3LatentImage"];

/// Node types that ship with a stock ComfyUI install.
const STANDARD_NODE_TYPES: &[&str] = &[
    "KSampler",
    "KSamplerAdvanced",
    "CheckpointLoaderSimple",
    "CLIPTextEncode",
    "CLIPSetLastLayer",
    "VAEDecode",
    "VAEEncode",
    "VAELoader",
    "EmptyLatentImage",
    "EmptySD3LatentImage",
    "LatentUpscale",
    "LatentUpscaleBy",
    "SaveImage",
    "PreviewImage",
    "LoadImage",
    "LoadImageMask",
    "ImageScale",
    "ImageScaleBy",
    "ImageInvert",
    "ConditioningCombine",
    "ConditioningAverage",
    "ConditioningConcat",
    "ConditioningSetArea",
    "ConditioningSetMask",
    "ControlNetLoader",
    "ControlNetApply",
    "ControlNetApplyAdvanced",
    "LoraLoader",
    "LoraLoaderModelOnly",
    "CLIPLoader",
    "DualCLIPLoader",
    "UNETLoader",
    "UpscaleModelLoader",
    "ImageUpscaleWithModel",
    "CLIPVisionEncode",
    "CLIPVisionLoader",
    "FluxGuidance",
    "SetLatentNoiseMask",
    "RepeatLatentBatch",
];

// ---------------------------------------------------------------------------
// Data structures
// ---------------------------------------------------------------------------

/// A single node in a parsed workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub class_type: String,
    /// Display title from `_meta.title`, when the export carries one.
    pub title: Option<String>,
    pub inputs: serde_json::Value,
}

/// A `[node_id, slot]` link from one node's output into another's input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConnection {
    pub from_node: String,
    pub from_output: String,
    pub to_node: String,
    pub to_input: String,
}

#[derive(Debug, Serialize)]
pub struct ParsedWorkflow {
    pub nodes: Vec<WorkflowNode>,
    pub connections: Vec<NodeConnection>,
    pub referenced_models: Vec<String>,
    pub referenced_loras: Vec<String>,
    /// Class types not in the stock ComfyUI set.
    pub referenced_custom_nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Seed,
    Cfg,
    Denoise,
    Prompt,
    NegativePrompt,
    Image,
    Steps,
    Sampler,
    Scheduler,
    Width,
    Height,
}

impl ParamType {
    /// Field name used for this parameter in a generated mapping file.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Cfg => "cfg",
            Self::Denoise => "denoise",
            Self::Prompt => "positive_prompt",
            Self::NegativePrompt => "negative_prompt",
            Self::Image => "image",
            Self::Steps => "steps",
            Self::Sampler => "sampler",
            Self::Scheduler => "scheduler",
            Self::Width => "width",
            Self::Height => "height",
        }
    }
}

/// A parameter found by heuristic analysis of the workflow nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredParameter {
    pub node_id: String,
    pub input_name: String,
    pub param_type: ParamType,
    pub current_value: serde_json::Value,
    pub suggested_name: String,
}

impl DiscoveredParameter {
    pub fn path(&self) -> BindingPath {
        BindingPath::new(&self.node_id, [self.input_name.as_str()])
    }
}

/// A loaded workflow plus its provenance.
#[derive(Debug, Clone)]
pub struct WorkflowDocument {
    json: serde_json::Value,
    hash: String,
    source: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// WorkflowDocument
// ---------------------------------------------------------------------------

impl WorkflowDocument {
    /// Wrap an in-memory workflow after checking its shape.
    pub fn from_value(json: serde_json::Value) -> Result<Self, CoreError> {
        check_api_format(&json)?;
        let serialized = serde_json::to_string(&json)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize workflow JSON: {e}")))?;
        if serialized.len() > MAX_WORKFLOW_JSON_SIZE {
            return Err(CoreError::Validation(format!(
                "Workflow JSON exceeds maximum size of {MAX_WORKFLOW_JSON_SIZE} bytes (got {} bytes)",
                serialized.len()
            )));
        }
        let hash = sha256_hex(serialized.as_bytes());
        Ok(Self {
            json,
            hash,
            source: None,
        })
    }

    /// Load a workflow JSON file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound {
                    entity: "workflow",
                    id: path.display().to_string(),
                }
            } else {
                CoreError::io(path, e)
            }
        })?;
        let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            CoreError::Validation(format!("Invalid workflow JSON in {}: {e}", path.display()))
        })?;
        let mut doc = Self::from_value(json)?;
        doc.source = Some(path.to_path_buf());
        Ok(doc)
    }

    pub fn json(&self) -> &serde_json::Value {
        &self.json
    }

    /// SHA-256 of the compact serialization.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn parse(&self) -> Result<ParsedWorkflow, CoreError> {
        parse_workflow(&self.json)
    }

    /// Value currently stored at `path`, if the path exists.
    pub fn value_at(&self, path: &BindingPath) -> Option<&serde_json::Value> {
        self.json.pointer(&path.to_pointer())
    }

    pub fn contains(&self, path: &BindingPath) -> bool {
        self.value_at(path).is_some()
    }
}

/// Replace the value at `path` inside a workflow JSON tree.
///
/// Returns `false` without modifying anything when the path is absent.
pub fn set_value_at(
    json: &mut serde_json::Value,
    path: &BindingPath,
    value: serde_json::Value,
) -> bool {
    match json.pointer_mut(&path.to_pointer()) {
        Some(slot) => {
            *slot = value;
            true
        }
        None => false,
    }
}

/// Reject JSON that is not an API-format workflow.
///
/// The UI export ("Save") carries a top-level `nodes` array and cannot be
/// queued directly.
fn check_api_format(json: &serde_json::Value) -> Result<(), CoreError> {
    let obj = json
        .as_object()
        .ok_or_else(|| CoreError::Validation("Workflow JSON must be an object".to_string()))?;
    if obj.get("nodes").is_some_and(|n| n.is_array()) {
        return Err(CoreError::Validation(
            "Workflow is in UI format; export it with \"Save (API Format)\"".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse an API-format workflow into nodes and connections.
///
/// The expected format is an object where each key is a node ID and each
/// value carries `class_type` and `inputs`:
///
/// ```json
/// { "3": { "class_type": "KSampler", "inputs": { "seed": 42 } } }
/// ```
pub fn parse_workflow(json: &serde_json::Value) -> Result<ParsedWorkflow, CoreError> {
    check_api_format(json)?;
    let obj = json
        .as_object()
        .ok_or_else(|| CoreError::Validation("Workflow JSON must be an object".to_string()))?;

    if obj.is_empty() {
        return Err(CoreError::Validation(
            "Workflow JSON must contain at least one node".to_string(),
        ));
    }

    let mut nodes = Vec::new();
    let mut connections = Vec::new();
    let mut referenced_models: Vec<String> = Vec::new();
    let mut referenced_loras: Vec<String> = Vec::new();
    let mut custom_nodes: Vec<String> = Vec::new();

    for (node_id, node_value) in obj {
        let class_type = node_value
            .get("class_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Node '{node_id}' is missing required 'class_type' field"
                ))
            })?
            .to_string();

        let title = node_value
            .get("_meta")
            .and_then(|m| m.get("title"))
            .and_then(|t| t.as_str())
            .map(str::to_string);

        let inputs = node_value
            .get("inputs")
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));

        if let Some(input_obj) = inputs.as_object() {
            for (input_name, input_val) in input_obj {
                if let Some((from_node, from_output)) = as_link(input_val) {
                    connections.push(NodeConnection {
                        from_node,
                        from_output,
                        to_node: node_id.clone(),
                        to_input: input_name.clone(),
                    });
                }
            }
        }

        let referenced = match class_type.as_str() {
            LOAD_CHECKPOINT_CLASS => Some((&mut referenced_models, "ckpt_name")),
            LOAD_LORA_CLASS => Some((&mut referenced_loras, "lora_name")),
            _ => None,
        };
        if let Some((list, key)) = referenced {
            if let Some(name) = inputs.get(key).and_then(|v| v.as_str()) {
                if !list.iter().any(|m| m == name) {
                    list.push(name.to_string());
                }
            }
        }

        if !STANDARD_NODE_TYPES.contains(&class_type.as_str())
            && !custom_nodes.contains(&class_type)
        {
            custom_nodes.push(class_type.clone());
        }

        nodes.push(WorkflowNode {
            id: node_id.clone(),
            class_type,
            title,
            inputs,
        });
    }

    nodes.sort_by(|a, b| compare_node_ids(&a.id, &b.id));

    Ok(ParsedWorkflow {
        nodes,
        connections,
        referenced_models,
        referenced_loras,
        referenced_custom_nodes: custom_nodes,
    })
}

/// Interpret an input value as a `[source_node_id, output_index]` link.
fn as_link(value: &serde_json::Value) -> Option<(String, String)> {
    let arr = value.as_array().filter(|a| a.len() == 2)?;
    let from_node = match &arr[0] {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) if n.is_u64() => n.to_string(),
        _ => return None,
    };
    let from_output = match &arr[1] {
        serde_json::Value::Number(n) if n.is_u64() => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => return None,
    };
    Some((from_node, from_output))
}

/// Order node ids numerically when both are numbers ("9" before "10").
fn compare_node_ids(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

// ---------------------------------------------------------------------------
// Parameter discovery
// ---------------------------------------------------------------------------

/// Discover bindable parameters using node-type heuristics.
pub fn discover_parameters(parsed: &ParsedWorkflow) -> Vec<DiscoveredParameter> {
    let mut params = Vec::new();

    for node in &parsed.nodes {
        match node.class_type.as_str() {
            KSAMPLER_CLASS | KSAMPLER_ADVANCED_CLASS => discover_sampler_params(&mut params, node),
            CLIP_TEXT_ENCODE_CLASS => discover_clip_text_params(&mut params, node),
            LOAD_IMAGE_CLASS => {
                push_literal(&mut params, node, "image", ParamType::Image, "Input Image")
            }
            class if EMPTY_LATENT_CLASSES.contains(&class) => {
                push_literal(&mut params, node, "width", ParamType::Width, "Width");
                push_literal(&mut params, node, "height", ParamType::Height, "Height");
            }
            _ => {}
        }

        if params.len() >= MAX_DISCOVERED_PARAMS {
            break;
        }
    }

    params.truncate(MAX_DISCOVERED_PARAMS);
    params
}

/// Render a `[bindings]` section for the discovered parameters.
///
/// When several nodes offer the same field, the first keeps the plain
/// name and later ones get a `_<node_id>` suffix.
pub fn suggest_mapping(params: &[DiscoveredParameter]) -> String {
    let mut out = String::from("[bindings]\n");
    let mut used: Vec<&str> = Vec::new();
    for param in params {
        let base = param.param_type.field_name();
        let name = if used.contains(&base) {
            format!("{base}_{}", param.node_id.replace(':', "_"))
        } else {
            used.push(base);
            base.to_string()
        };
        out.push_str(&format!(
            "{name} = {}    ; {}\n",
            param.path(),
            param.suggested_name
        ));
    }
    out
}

fn discover_sampler_params(params: &mut Vec<DiscoveredParameter>, node: &WorkflowNode) {
    let seed_input = if node.inputs.get("noise_seed").is_some() {
        "noise_seed"
    } else {
        "seed"
    };
    let mappings: [(&str, ParamType, &str); 6] = [
        (seed_input, ParamType::Seed, "Random Seed"),
        ("cfg", ParamType::Cfg, "CFG Scale"),
        ("denoise", ParamType::Denoise, "Denoise Strength"),
        ("steps", ParamType::Steps, "Sampling Steps"),
        ("sampler_name", ParamType::Sampler, "Sampler"),
        ("scheduler", ParamType::Scheduler, "Scheduler"),
    ];
    for (input_name, param_type, suggested_name) in mappings {
        push_literal(params, node, input_name, param_type, suggested_name);
    }
}

fn discover_clip_text_params(params: &mut Vec<DiscoveredParameter>, node: &WorkflowNode) {
    let label = format!(
        "{} {}",
        node.id.to_lowercase(),
        node.title.as_deref().unwrap_or_default().to_lowercase()
    );
    let (param_type, suggested_name) = if label.contains("neg") || label.contains("负") {
        (ParamType::NegativePrompt, "Negative Prompt")
    } else {
        (ParamType::Prompt, "Prompt")
    };
    push_literal(params, node, "text", param_type, suggested_name);
}

/// Record `input_name` if it holds a literal (links are skipped).
fn push_literal(
    params: &mut Vec<DiscoveredParameter>,
    node: &WorkflowNode,
    input_name: &str,
    param_type: ParamType,
    suggested_name: &str,
) {
    let Some(value) = node.inputs.get(input_name) else {
        return;
    };
    if value.is_array() {
        return;
    }
    params.push(DiscoveredParameter {
        node_id: node.id.clone(),
        input_name: input_name.to_string(),
        param_type,
        current_value: value.clone(),
        suggested_name: suggested_name.to_string(),
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
