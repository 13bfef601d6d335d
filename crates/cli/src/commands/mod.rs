pub mod inspect;
pub mod run;
pub mod status;

use std::path::{Path, PathBuf};

use anyhow::Context;

use comfybatch_core::mapping::ParameterMapping;
use comfybatch_core::workflow::WorkflowDocument;

/// Load the mapping (if any) and the workflow it points at.
///
/// An explicit `--workflow` wins over the mapping's `[workflow] path`.
pub fn load_inputs(
    workflow: Option<&Path>,
    mapping: Option<&Path>,
) -> anyhow::Result<(WorkflowDocument, Option<ParameterMapping>)> {
    let mapping = mapping
        .map(|path| {
            ParameterMapping::load(path)
                .with_context(|| format!("failed to load mapping {}", path.display()))
        })
        .transpose()?;

    let workflow_path: PathBuf = workflow
        .map(Path::to_path_buf)
        .or_else(|| mapping.as_ref().and_then(|m| m.workflow_path().map(Path::to_path_buf)))
        .context("no workflow given: pass --workflow or set [workflow] path in the mapping")?;

    let workflow = WorkflowDocument::load(&workflow_path)
        .with_context(|| format!("failed to load workflow {}", workflow_path.display()))?;
    Ok((workflow, mapping))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW: &str = r#"{"6": {"class_type": "CLIPTextEncode", "inputs": {"text": ""}}}"#;

    #[test]
    fn workflow_path_comes_from_mapping() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("wf.json"), WORKFLOW).unwrap();
        let mapping = dir.path().join("map.ini");
        let text = "[workflow]\npath = wf.json\n[bindings]\nprompt = 6.text\n";
        std::fs::write(&mapping, text).unwrap();

        let (workflow, mapping) = load_inputs(None, Some(&mapping)).unwrap();
        assert_eq!(workflow.source(), Some(dir.path().join("wf.json").as_path()));
        assert_eq!(mapping.unwrap().bindings().len(), 1);
    }

    #[test]
    fn missing_workflow_is_an_error() {
        let err = load_inputs(None, None).unwrap_err();
        assert!(err.to_string().contains("no workflow given"));
    }
}
