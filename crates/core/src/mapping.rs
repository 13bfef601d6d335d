//! Parameter mapping: named fields bound to paths inside a workflow.
//!
//! A mapping file looks like:
//!
//! ```ini
//! [workflow]
//! path = i2i_api.json
//!
//! [bindings]
//! positive_prompt = 6.text, 40.text
//! negative_prompt = 7.text
//! image = 12.inputs.image
//! seed = 3.seed
//! steps = 3.steps
//!
//! [defaults]
//! steps = 25
//! seed = random
//! ```
//!
//! Bindings whose path is absent from the loaded workflow are inert:
//! they are reported once and never applied.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::error::CoreError;
use crate::ini::{parse_flag, IniDocument};
use crate::types::ItemNumber;
use crate::workflow::{set_value_at, WorkflowDocument};

// ---------------------------------------------------------------------------
// Well-known field names
// ---------------------------------------------------------------------------

pub const FIELD_POSITIVE_PROMPT: &str = "positive_prompt";
pub const FIELD_NEGATIVE_PROMPT: &str = "negative_prompt";
pub const FIELD_IMAGE: &str = "image";
pub const FIELD_SEED: &str = "seed";

/// Largest seed handed out for `random` (fits losslessly in a JS number).
pub const MAX_SEED: u64 = (1 << 53) - 1;

const BINDINGS_SECTIONS: &[&str] = &["bindings", "mapping"];
const DEFAULTS_SECTION: &str = "defaults";

/// Field name → raw string value, names lowercase.
pub type FieldValues = BTreeMap<String, String>;

/// Lowercase a field name and fold aliases onto their canonical name.
pub fn normalize_field(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.as_str() {
        "prompt" | "positive" => FIELD_POSITIVE_PROMPT.to_string(),
        "negative" => FIELD_NEGATIVE_PROMPT.to_string(),
        _ => lower,
    }
}

/// Merge field layers; later layers override earlier ones.
pub fn layer_fields<'a>(layers: impl IntoIterator<Item = &'a FieldValues>) -> FieldValues {
    let mut merged = FieldValues::new();
    for layer in layers {
        for (k, v) in layer {
            merged.insert(normalize_field(k), v.clone());
        }
    }
    merged
}

// ---------------------------------------------------------------------------
// BindingPath
// ---------------------------------------------------------------------------

/// Location of one node input: `<node_id>.[inputs.]<input>[.<nested>...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingPath {
    node_id: String,
    segments: Vec<String>,
}

impl BindingPath {
    pub fn new<'a>(node_id: &str, segments: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            node_id: node_id.to_string(),
            segments: segments.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let raw = raw.trim();
        let mut parts = raw.split('.').map(str::trim);
        let node_id = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| {
            CoreError::Validation(format!("Binding path '{raw}' has no node id"))
        })?;

        let mut segments: Vec<&str> = parts.collect();
        if segments.first() == Some(&"inputs") {
            segments.remove(0);
        }
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(CoreError::Validation(format!(
                "Binding path '{raw}' must name an input, e.g. '{node_id}.text'"
            )));
        }
        Ok(Self::new(node_id, segments))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// RFC 6901 pointer into the workflow JSON.
    pub fn to_pointer(&self) -> String {
        let mut pointer = format!("/{}/inputs", escape_pointer(&self.node_id));
        for segment in &self.segments {
            pointer.push('/');
            pointer.push_str(&escape_pointer(segment));
        }
        pointer
    }
}

impl fmt::Display for BindingPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id, self.segments.join("."))
    }
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

// ---------------------------------------------------------------------------
// ParameterMapping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub field: String,
    pub path: BindingPath,
}

/// The mapping as written in the INI file, before checking it against a
/// workflow.
#[derive(Debug, Clone, Default)]
pub struct ParameterMapping {
    bindings: Vec<Binding>,
    defaults: FieldValues,
    workflow_path: Option<PathBuf>,
}

impl ParameterMapping {
    /// Load a mapping file. A relative `[workflow] path` is resolved
    /// against the mapping file's directory.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let doc = IniDocument::from_path(path)?;
        Self::from_ini(&doc, path.parent())
    }

    pub fn from_ini(doc: &IniDocument, base_dir: Option<&Path>) -> Result<Self, CoreError> {
        let mut bindings = Vec::new();
        for section in BINDINGS_SECTIONS {
            let Some(entries) = doc.section(section) else {
                continue;
            };
            for (field, raw_paths) in entries {
                let field = normalize_field(field);
                for raw in raw_paths.split(',').filter(|p| !p.trim().is_empty()) {
                    bindings.push(Binding {
                        field: field.clone(),
                        path: BindingPath::parse(raw)?,
                    });
                }
            }
        }

        if bindings.is_empty() {
            return Err(CoreError::Validation(
                "Mapping defines no bindings; add a [bindings] section".to_string(),
            ));
        }

        let defaults = doc
            .section(DEFAULTS_SECTION)
            .map(|s| {
                s.iter()
                    .map(|(k, v)| (normalize_field(k), v.clone()))
                    .collect()
            })
            .unwrap_or_default();

        let workflow_path = doc
            .get("workflow", "path")
            .filter(|p| !p.is_empty())
            .map(|p| match base_dir {
                Some(dir) if Path::new(p).is_relative() => dir.join(p),
                _ => PathBuf::from(p),
            });

        Ok(Self {
            bindings,
            defaults,
            workflow_path,
        })
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn defaults(&self) -> &FieldValues {
        &self.defaults
    }

    pub fn workflow_path(&self) -> Option<&Path> {
        self.workflow_path.as_deref()
    }

    /// Split bindings into those that exist in `workflow` and inert ones.
    pub fn resolve(&self, workflow: &WorkflowDocument) -> ResolvedMapping {
        let (active, inert): (Vec<_>, Vec<_>) = self
            .bindings
            .iter()
            .cloned()
            .partition(|b| workflow.contains(&b.path));

        for binding in &inert {
            tracing::warn!(
                field = %binding.field,
                path = %binding.path,
                "Binding path not found in workflow; it will be ignored",
            );
        }

        ResolvedMapping {
            active,
            inert,
            defaults: self.defaults.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ResolvedMapping
// ---------------------------------------------------------------------------

/// A mapping checked against one workflow. Immutable for the whole run.
#[derive(Debug, Clone)]
pub struct ResolvedMapping {
    active: Vec<Binding>,
    inert: Vec<Binding>,
    defaults: FieldValues,
}

impl ResolvedMapping {
    pub fn active(&self) -> &[Binding] {
        &self.active
    }

    pub fn inert(&self) -> &[Binding] {
        &self.inert
    }

    pub fn defaults(&self) -> &FieldValues {
        &self.defaults
    }

    pub fn is_bound(&self, field: &str) -> bool {
        let field = normalize_field(field);
        self.active.iter().any(|b| b.field == field)
    }

    /// Produce a fresh copy of the workflow with `values` substituted.
    ///
    /// Values are coerced to the JSON type already present at each bound
    /// path. Fields without a value keep the workflow's own value.
    pub fn apply(
        &self,
        workflow: &WorkflowDocument,
        values: &FieldValues,
    ) -> Result<serde_json::Value, CoreError> {
        let mut json = workflow.json().clone();

        for binding in &self.active {
            let Some(raw) = values.get(&binding.field) else {
                continue;
            };
            let coerced = coerce_value(workflow.value_at(&binding.path), raw).map_err(|reason| {
                CoreError::Validation(format!(
                    "Field '{}' = '{raw}' cannot be bound to {}: {reason}",
                    binding.field, binding.path
                ))
            })?;
            set_value_at(&mut json, &binding.path, coerced);
        }

        for field in values.keys().filter(|f| !self.is_bound(f)) {
            tracing::debug!(field = %field, "Field has no active binding");
        }

        Ok(json)
    }
}

/// Convert `raw` to the JSON type of `existing`.
pub fn coerce_value(
    existing: Option<&serde_json::Value>,
    raw: &str,
) -> Result<serde_json::Value, String> {
    use serde_json::Value;

    match existing {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(Value::String(raw.to_string())),
        Some(Value::Bool(_)) => parse_flag(raw)
            .map(Value::Bool)
            .ok_or_else(|| "expected a boolean".to_string()),
        Some(Value::Number(n)) if n.is_f64() => {
            let f: f64 = raw
                .trim()
                .parse()
                .map_err(|_| "expected a number".to_string())?;
            serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| "number must be finite".to_string())
        }
        Some(Value::Number(_)) => {
            let trimmed = raw.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Ok(Value::from(i))
            } else if let Ok(u) = trimmed.parse::<u64>() {
                Ok(Value::from(u))
            } else {
                Err("expected an integer".to_string())
            }
        }
        Some(Value::Array(_)) | Some(Value::Object(_)) => {
            serde_json::from_str(raw).map_err(|_| "bound input is a link or object".to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Seeds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicy {
    Fixed(u64),
    /// Fresh random seed for every item (`-1` or `random`).
    Random,
    /// `base + (number - 1)`.
    Increment(u64),
}

impl SeedPolicy {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let raw = raw.trim().to_lowercase();
        match raw.as_str() {
            "-1" | "random" => Ok(Self::Random),
            "increment" => Ok(Self::Increment(0)),
            _ => {
                if let Some(base) = raw.strip_prefix("increment:") {
                    return base.trim().parse().map(Self::Increment).map_err(|_| {
                        CoreError::Validation(format!("Invalid seed increment base '{base}'"))
                    });
                }
                raw.parse()
                    .map(Self::Fixed)
                    .map_err(|_| CoreError::Validation(format!("Invalid seed '{raw}'")))
            }
        }
    }

    pub fn seed_for(&self, number: ItemNumber) -> u64 {
        match *self {
            Self::Fixed(seed) => seed,
            Self::Random => rand::rng().random_range(0..=MAX_SEED),
            Self::Increment(base) => base.saturating_add(number.saturating_sub(1) as u64),
        }
    }
}

/// Replace a seed policy in `values` with the concrete seed for `number`.
pub fn resolve_seed(values: &mut FieldValues, number: ItemNumber) -> Result<(), CoreError> {
    if let Some(raw) = values.get(FIELD_SEED) {
        let seed = SeedPolicy::parse(raw)?.seed_for(number);
        values.insert(FIELD_SEED.to_string(), seed.to_string());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn workflow() -> WorkflowDocument {
        WorkflowDocument::from_value(json!({
            "3": {
                "class_type": "KSampler",
                "inputs": { "seed": 1, "steps": 20, "cfg": 7.0, "model": ["4", 0] }
            },
            "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "old", "clip": ["4", 1] } },
            "7": { "class_type": "CLIPTextEncode", "inputs": { "text": "", "clip": ["4", 1] } },
            "12": { "class_type": "LoadImage", "inputs": { "image": "example.png", "upload": "image" } },
            "20": { "class_type": "Toggle", "inputs": { "enabled": false } }
        }))
        .unwrap()
    }

    fn mapping(text: &str) -> ParameterMapping {
        ParameterMapping::from_ini(&IniDocument::parse(text).unwrap(), None).unwrap()
    }

    fn values(pairs: &[(&str, &str)]) -> FieldValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn binding_path_forms() {
        let short = BindingPath::parse("6.text").unwrap();
        let long = BindingPath::parse(" 6.inputs.text ").unwrap();
        assert_eq!(short, long);
        assert_eq!(short.to_pointer(), "/6/inputs/text");
        assert_eq!(short.to_string(), "6.text");

        let group = BindingPath::parse("12:3.image").unwrap();
        assert_eq!(group.node_id(), "12:3");
    }

    #[test]
    fn binding_path_rejects_incomplete() {
        assert!(BindingPath::parse("").is_err());
        assert!(BindingPath::parse("6").is_err());
        assert!(BindingPath::parse("6.inputs").is_err());
        assert!(BindingPath::parse("6..text").is_err());
    }

    #[test]
    fn pointer_escapes_special_characters() {
        let path = BindingPath::new("5", ["a/b", "c~d"]);
        assert_eq!(path.to_pointer(), "/5/inputs/a~1b/c~0d");
    }

    #[test]
    fn mapping_reads_bindings_defaults_and_aliases() {
        let m = mapping(
            "[bindings]\nPrompt = 6.text, 7.text\nSteps = 3.steps\n[defaults]\nsteps = 30\n",
        );
        assert_eq!(m.bindings().len(), 3);
        assert_eq!(m.bindings()[0].field, FIELD_POSITIVE_PROMPT);
        assert_eq!(m.defaults().get("steps").map(String::as_str), Some("30"));
    }

    #[test]
    fn mapping_without_bindings_is_rejected() {
        let doc = IniDocument::parse("[defaults]\nsteps = 3\n").unwrap();
        let err = ParameterMapping::from_ini(&doc, None).unwrap_err();
        assert_matches!(err, CoreError::Validation(_));
    }

    #[test]
    fn workflow_path_is_relative_to_mapping_dir() {
        let doc = IniDocument::parse("[workflow]\npath = flows/a.json\n[bindings]\nseed = 3.seed\n")
            .unwrap();
        let m = ParameterMapping::from_ini(&doc, Some(Path::new("/maps"))).unwrap();
        assert_eq!(m.workflow_path(), Some(Path::new("/maps/flows/a.json")));
    }

    #[test]
    fn windows_paths_survive_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.ini");
        std::fs::write(
            &path,
            "[workflow]\npath = config\\API\\i2i.json\n[bindings]\nimage = 10.image\n[defaults]\nimage = C:\\in\\x.png\n",
        )
        .unwrap();
        let m = ParameterMapping::load(&path).unwrap();
        assert_eq!(m.workflow_path(), Some(dir.path().join(r"config\API\i2i.json").as_path()));
        assert_eq!(m.defaults().get("image").map(String::as_str), Some(r"C:\in\x.png"));
    }

    #[test]
    fn missing_paths_are_inert_and_never_applied() {
        let m = mapping("[bindings]\npositive_prompt = 6.text\nwidth = 99.width\n");
        let wf = workflow();
        let resolved = m.resolve(&wf);
        assert_eq!(resolved.active().len(), 1);
        assert_eq!(resolved.inert().len(), 1);
        assert!(!resolved.is_bound("width"));

        let out = resolved
            .apply(&wf, &values(&[("positive_prompt", "a cat"), ("width", "512")]))
            .unwrap();
        assert_eq!(out["6"]["inputs"]["text"], json!("a cat"));
        assert!(out.get("99").is_none());
    }

    #[test]
    fn apply_coerces_to_existing_types_and_leaves_source_untouched() {
        let m = mapping(
            "[bindings]\nseed = 3.seed\nsteps = 3.steps\ncfg = 3.cfg\nenabled = 20.enabled\n",
        );
        let wf = workflow();
        let resolved = m.resolve(&wf);
        let out = resolved
            .apply(
                &wf,
                &values(&[("seed", "123"), ("steps", "28"), ("cfg", "5.5"), ("enabled", "yes")]),
            )
            .unwrap();
        assert_eq!(out["3"]["inputs"]["seed"], json!(123));
        assert_eq!(out["3"]["inputs"]["steps"], json!(28));
        assert_eq!(out["3"]["inputs"]["cfg"], json!(5.5));
        assert_eq!(out["20"]["inputs"]["enabled"], json!(true));
        assert_eq!(wf.json()["3"]["inputs"]["steps"], json!(20));
    }

    #[test]
    fn apply_rejects_uncoercible_values() {
        let m = mapping("[bindings]\nsteps = 3.steps\n");
        let wf = workflow();
        let err = m
            .resolve(&wf)
            .apply(&wf, &values(&[("steps", "many")]))
            .unwrap_err();
        assert_matches!(err, CoreError::Validation(msg) if msg.contains("steps"));
    }

    #[test]
    fn one_field_can_fan_out_to_several_nodes() {
        let m = mapping("[bindings]\nprompt = 6.text, 7.text\n");
        let wf = workflow();
        let out = m
            .resolve(&wf)
            .apply(&wf, &values(&[("positive_prompt", "shared")]))
            .unwrap();
        assert_eq!(out["6"]["inputs"]["text"], json!("shared"));
        assert_eq!(out["7"]["inputs"]["text"], json!("shared"));
    }

    #[test]
    fn coerce_handles_each_json_kind() {
        assert_eq!(coerce_value(None, "x").unwrap(), json!("x"));
        assert_eq!(coerce_value(Some(&json!(1)), "-4").unwrap(), json!(-4));
        assert_eq!(
            coerce_value(Some(&json!(1)), "18446744073709551615").unwrap(),
            json!(u64::MAX)
        );
        assert!(coerce_value(Some(&json!(1)), "1.5").is_err());
        assert_eq!(coerce_value(Some(&json!(1.0)), "2").unwrap(), json!(2.0));
        assert!(coerce_value(Some(&json!(true)), "maybe").is_err());
        assert!(coerce_value(Some(&json!(["4", 0])), "plain").is_err());
    }

    #[test]
    fn layering_later_wins_and_normalizes() {
        let merged = layer_fields([
            &values(&[("Steps", "20"), ("prompt", "a")]),
            &values(&[("steps", "30")]),
        ]);
        assert_eq!(merged.get("steps").map(String::as_str), Some("30"));
        assert_eq!(merged.get(FIELD_POSITIVE_PROMPT).map(String::as_str), Some("a"));
    }

    #[test]
    fn seed_policies() {
        assert_eq!(SeedPolicy::parse("-1").unwrap(), SeedPolicy::Random);
        assert_eq!(SeedPolicy::parse("RANDOM").unwrap(), SeedPolicy::Random);
        assert_eq!(SeedPolicy::parse("42").unwrap(), SeedPolicy::Fixed(42));
        assert_eq!(
            SeedPolicy::parse("increment:100").unwrap(),
            SeedPolicy::Increment(100)
        );
        assert!(SeedPolicy::parse("-5").is_err());

        assert_eq!(SeedPolicy::Increment(100).seed_for(3), 102);
        assert_eq!(SeedPolicy::Fixed(7).seed_for(9), 7);
        assert!(SeedPolicy::Random.seed_for(1) <= MAX_SEED);
    }

    #[test]
    fn resolve_seed_replaces_policy_with_number() {
        let mut v = values(&[("seed", "increment:10")]);
        resolve_seed(&mut v, 4).unwrap();
        assert_eq!(v.get("seed").map(String::as_str), Some("13"));

        let mut none = FieldValues::new();
        resolve_seed(&mut none, 1).unwrap();
        assert!(none.is_empty());
    }
}
