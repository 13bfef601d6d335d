//! Batch items and the ways to build a batch.
//!
//! A batch is a finite ordered list of [`BatchItem`]s. It can come from a
//! JSON manifest, from a directory of images paired with prompts, or from
//! prompts alone (text-to-image).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::mapping::FieldValues;
use crate::types::ItemNumber;

/// File extensions picked up when scanning an image directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];

/// One unit of work: an optional input image plus prompts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    /// 1-based position in the batch.
    pub number: ItemNumber,
    pub image: Option<PathBuf>,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// Per-item overrides for form fields (e.g. `steps`, `width`).
    pub fields: FieldValues,
}

impl BatchItem {
    /// File stem of the input image, used to name outputs.
    pub fn source_stem(&self) -> Option<String> {
        self.image
            .as_ref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
    }
}

/// One entry of a JSON manifest.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(default)]
    image: Option<PathBuf>,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    negative_prompt: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, serde_json::Value>,
}

/// Load a JSON manifest: an array of
/// `{"image": "...", "prompt": "...", "negative_prompt": "...", "fields": {...}}`.
///
/// Relative image paths are resolved against the manifest's directory.
pub fn load_manifest(path: &Path) -> Result<Vec<BatchItem>, CoreError> {
    let text = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_manifest(&text, base)
}

pub fn parse_manifest(text: &str, base_dir: &Path) -> Result<Vec<BatchItem>, CoreError> {
    let entries: Vec<ManifestEntry> = serde_json::from_str(text)
        .map_err(|e| CoreError::Validation(format!("Invalid batch manifest: {e}")))?;

    let items = entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| BatchItem {
            number: i + 1,
            image: entry.image.map(|p| {
                if p.is_relative() {
                    base_dir.join(p)
                } else {
                    p
                }
            }),
            prompt: entry.prompt,
            negative_prompt: entry.negative_prompt.filter(|n| !n.is_empty()),
            fields: entry
                .fields
                .into_iter()
                .map(|(k, v)| (k, field_to_string(v)))
                .collect(),
        })
        .collect();

    non_empty(items)
}

fn field_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Read prompts from a text file, one per line.
///
/// Blank lines and lines starting with `#` are skipped.
pub fn read_prompts(path: &Path) -> Result<Vec<String>, CoreError> {
    let text = std::fs::read_to_string(path).map_err(|e| CoreError::io(path, e))?;
    Ok(parse_prompts(&text))
}

pub fn parse_prompts(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// List image files in `dir`, sorted by file name.
pub fn scan_images(dir: &Path) -> Result<Vec<PathBuf>, CoreError> {
    if !dir.is_dir() {
        return Err(CoreError::NotFound {
            entity: "image directory",
            id: dir.display().to_string(),
        });
    }
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| CoreError::io(dir, e))? {
        let path = entry.map_err(|e| CoreError::io(dir, e))?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()));
        if path.is_file() && is_image {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Pair images with prompts.
///
/// A single prompt is broadcast to every image; otherwise the counts
/// must match. An empty prompt list gives every image an empty prompt.
pub fn from_images(
    images: Vec<PathBuf>,
    prompts: &[String],
    negative_prompt: Option<&str>,
) -> Result<Vec<BatchItem>, CoreError> {
    if prompts.len() > 1 && prompts.len() != images.len() {
        return Err(CoreError::Validation(format!(
            "Found {} images but {} prompts; provide one prompt per image or a single shared prompt",
            images.len(),
            prompts.len()
        )));
    }

    let items = images
        .into_iter()
        .enumerate()
        .map(|(i, image)| BatchItem {
            number: i + 1,
            image: Some(image),
            prompt: prompts
                .get(i)
                .or_else(|| prompts.first())
                .cloned()
                .unwrap_or_default(),
            negative_prompt: negative_prompt.map(str::to_string),
            fields: FieldValues::new(),
        })
        .collect();

    non_empty(items)
}

/// Text-only batch: one item per prompt.
pub fn from_prompts(
    prompts: Vec<String>,
    negative_prompt: Option<&str>,
) -> Result<Vec<BatchItem>, CoreError> {
    let items = prompts
        .into_iter()
        .enumerate()
        .map(|(i, prompt)| BatchItem {
            number: i + 1,
            image: None,
            prompt,
            negative_prompt: negative_prompt.map(str::to_string),
            fields: FieldValues::new(),
        })
        .collect();
    non_empty(items)
}

fn non_empty(items: Vec<BatchItem>) -> Result<Vec<BatchItem>, CoreError> {
    if items.is_empty() {
        return Err(CoreError::Validation("Batch contains no items".to_string()));
    }
    Ok(items)
}
