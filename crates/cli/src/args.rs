use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use comfybatch_core::mapping::{normalize_field, FieldValues};

/// Batch companion for a ComfyUI server
#[derive(Parser, Debug)]
#[command(name = "comfybatch")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Settings file (default: ./setting.ini when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a batch through a workflow
    Run(RunArgs),

    /// Show a workflow's nodes, bindable parameters and mapping status
    Inspect(InspectArgs),

    /// Check that the ComfyUI server (and translator, if enabled) is reachable
    Status,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workflow JSON in API format (default: `[workflow] path` from the mapping)
    #[arg(long, short)]
    pub workflow: Option<PathBuf>,

    /// INI file binding field names to workflow inputs
    #[arg(long, short)]
    pub mapping: PathBuf,

    /// JSON manifest listing the batch items
    #[arg(long, conflicts_with_all = ["images", "prompt", "prompts"])]
    pub manifest: Option<PathBuf>,

    /// Directory of input images, processed in file-name order
    #[arg(long)]
    pub images: Option<PathBuf>,

    /// Text file with one prompt per line
    #[arg(long, conflicts_with = "prompt")]
    pub prompts: Option<PathBuf>,

    /// Single prompt shared by every image
    #[arg(long, requires = "images")]
    pub prompt: Option<String>,

    /// Negative prompt applied to every item
    #[arg(long)]
    pub negative: Option<String>,

    /// Output directory (default: `output.dir` from settings)
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Override a field for every item, e.g. `--set steps=30`
    #[arg(long = "set", value_name = "FIELD=VALUE", value_parser = parse_assignment)]
    pub overrides: Vec<(String, String)>,
}

impl RunArgs {
    pub fn override_values(&self) -> FieldValues {
        self.overrides
            .iter()
            .map(|(field, value)| (normalize_field(field), value.clone()))
            .collect()
    }
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Workflow JSON in API format (default: `[workflow] path` from the mapping)
    #[arg(long, short)]
    pub workflow: Option<PathBuf>,

    /// Mapping to check against the workflow
    #[arg(long, short)]
    pub mapping: Option<PathBuf>,
}

fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=VALUE, got '{raw}'"))?;
    let field = field.trim();
    if field.is_empty() {
        return Err(format!("missing field name in '{raw}'"));
    }
    Ok((field.to_string(), value.trim().to_string()))
}
