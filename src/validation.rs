//! Upload checks run before a job record is created.

use std::path::Path;

use crate::errors::ForgeError;
use crate::models::config::ImageConfig;

pub const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Reject payloads over the configured limit.
pub fn validate_upload_size(len: usize, max_mb: u64) -> Result<(), ForgeError> {
    let size_mb = len as f64 / (1024.0 * 1024.0);
    if size_mb > max_mb as f64 {
        return Err(ForgeError::PayloadTooLarge(format!(
            "File too large: {:.1}MB (max {}MB)",
            size_mb, max_mb
        )));
    }
    Ok(())
}

/// Extension, decodability, pixel bounds and colour mode of a stored upload.
pub fn validate_image_file(path: &Path, limits: &ImageConfig) -> Result<(u32, u32), ForgeError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ForgeError::InvalidInput(format!(
            "Invalid file type. Allowed: {}",
            ALLOWED_EXTENSIONS
                .iter()
                .map(|e| format!(".{}", e))
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let img = image::ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|e| ForgeError::InvalidInput(format!("Failed to read image: {}", e)))?
        .decode()
        .map_err(|e| ForgeError::InvalidInput(format!("Failed to read image: {}", e)))?;

    let (width, height) = (img.width(), img.height());
    if width < limits.min_dimension || height < limits.min_dimension {
        return Err(ForgeError::InvalidInput(format!(
            "Image too small: {}x{}px (min {}x{}px)",
            width, height, limits.min_dimension, limits.min_dimension
        )));
    }
    if width > limits.max_dimension || height > limits.max_dimension {
        return Err(ForgeError::InvalidInput(format!(
            "Image too large: {}x{}px (max {}x{}px)",
            width, height, limits.max_dimension, limits.max_dimension
        )));
    }

    use image::ColorType;
    match img.color() {
        ColorType::Rgb8 | ColorType::Rgba8 | ColorType::Rgb16 | ColorType::Rgba16 => {}
        other => {
            return Err(ForgeError::InvalidInput(format!(
                "Unsupported image mode: {:?} (need RGB or RGBA)",
                other
            )))
        }
    }

    Ok((width, height))
}

/// Make a client-supplied name safe to use as a path component.
pub fn sanitize_filename(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !sanitized.contains('.') {
        sanitized.push_str(".jpg");
    }
    sanitized
}
