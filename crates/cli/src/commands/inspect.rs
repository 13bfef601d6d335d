use std::fmt::Write as _;

use comfybatch_core::mapping::ParameterMapping;
use comfybatch_core::workflow::{discover_parameters, suggest_mapping, WorkflowDocument};

use crate::args::InspectArgs;

pub fn execute(args: InspectArgs) -> anyhow::Result<()> {
    let (workflow, mapping) =
        super::load_inputs(args.workflow.as_deref(), args.mapping.as_deref())?;
    print!("{}", render(&workflow, mapping.as_ref())?);
    Ok(())
}

/// Human-readable report of the workflow and, if given, how the mapping
/// binds onto it.
fn render(
    workflow: &WorkflowDocument,
    mapping: Option<&ParameterMapping>,
) -> anyhow::Result<String> {
    let parsed = workflow.parse()?;
    let mut out = String::new();

    if let Some(source) = workflow.source() {
        writeln!(out, "Workflow: {}", source.display())?;
    }
    writeln!(out, "Hash:     {}", workflow.hash())?;
    writeln!(out, "\nNodes ({}):", parsed.nodes.len())?;
    for node in &parsed.nodes {
        match &node.title {
            Some(title) => writeln!(out, "  {:>4}  {}  \"{}\"", node.id, node.class_type, title)?,
            None => writeln!(out, "  {:>4}  {}", node.id, node.class_type)?,
        }
    }

    for (label, names) in [
        ("Models", &parsed.referenced_models),
        ("LoRAs", &parsed.referenced_loras),
        ("Custom nodes", &parsed.referenced_custom_nodes),
    ] {
        if !names.is_empty() {
            writeln!(out, "\n{label}:")?;
            for name in names {
                writeln!(out, "  {name}")?;
            }
        }
    }

    let params = discover_parameters(&parsed);
    writeln!(out, "\nParameters ({}):", params.len())?;
    for param in &params {
        writeln!(
            out,
            "  {:<20} {:<18} = {}",
            param.path().to_string(),
            param.suggested_name,
            param.current_value
        )?;
    }

    match mapping {
        Some(mapping) => {
            let resolved = mapping.resolve(workflow);
            writeln!(out, "\nActive bindings:")?;
            for binding in resolved.active() {
                writeln!(out, "  {} -> {}", binding.field, binding.path)?;
            }
            if !resolved.inert().is_empty() {
                writeln!(out, "\nInert bindings (path not in workflow):")?;
                for binding in resolved.inert() {
                    writeln!(out, "  {} -> {}", binding.field, binding.path)?;
                }
            }
        }
        None => {
            writeln!(out, "\nSuggested mapping:")?;
            out.push_str(&suggest_mapping(&params));
        }
    }

    Ok(out)
}
