//! Input image checks run before anything is sent to the server.
//!
//! Only the image header is decoded, which is enough to reject missing,
//! truncated, or non-image files cheaply.

use std::path::Path;

use serde::Serialize;

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    /// Lowercase format name, e.g. `png`.
    pub format: String,
}

/// Verify that `path` exists and holds a decodable image header.
pub fn validate_input_image(path: &Path) -> Result<ImageInfo, CoreError> {
    if !path.is_file() {
        return Err(CoreError::NotFound {
            entity: "input image",
            id: path.display().to_string(),
        });
    }

    let reader = image::ImageReader::open(path)
        .map_err(|e| CoreError::io(path, e))?
        .with_guessed_format()
        .map_err(|e| CoreError::io(path, e))?;

    let format = reader
        .format()
        .map(|f| format!("{f:?}").to_lowercase())
        .ok_or_else(|| {
            CoreError::Validation(format!("{} is not a recognised image format", path.display()))
        })?;

    let (width, height) = reader.into_dimensions().map_err(|e| {
        CoreError::Validation(format!("Invalid image {}: {e}", path.display()))
    })?;

    Ok(ImageInfo {
        width,
        height,
        format,
    })
}
