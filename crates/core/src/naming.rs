//! Output file naming.
//!
//! Generates deterministic, filesystem-safe names for downloaded outputs
//! from the item number, the input image stem, and the output index.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::ItemNumber;

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("static regex is valid"));

/// Generate the file name for one output of one item.
///
/// Convention: `{number:04}{_stem}{_index}.{ext}`
///
/// - `_stem` = sanitized input image stem, omitted for text-only items
/// - `_index` = `_2`, `_3`, … for the second and later outputs of an item
///
/// # Examples
///
/// ```
/// use comfybatch_core::naming::output_filename;
///
/// assert_eq!(output_filename(1, Some("cat"), 0, "png"), "0001_cat.png");
/// assert_eq!(output_filename(1, Some("cat"), 1, "png"), "0001_cat_2.png");
/// assert_eq!(output_filename(12, None, 0, "webp"), "0012.webp");
/// ```
pub fn output_filename(
    number: ItemNumber,
    source_stem: Option<&str>,
    output_index: usize,
    extension: &str,
) -> String {
    let mut name = format!("{number:04}");

    if let Some(stem) = source_stem.map(sanitize_stem).filter(|s| !s.is_empty()) {
        name.push('_');
        name.push_str(&stem);
    }

    if output_index > 0 {
        name.push('_');
        name.push_str(&(output_index + 1).to_string());
    }

    let ext = extension.trim_start_matches('.').to_lowercase();
    name.push('.');
    name.push_str(if ext.is_empty() { "png" } else { &ext });
    name
}

/// Extension of a server-side file name, defaulting to `png`.
pub fn extension_of(filename: &str) -> &str {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png")
}

/// Replace runs of characters outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_stem(stem: &str) -> String {
    UNSAFE_CHARS
        .replace_all(stem, "_")
        .trim_matches('_')
        .to_string()
}
