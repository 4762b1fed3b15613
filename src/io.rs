// ============================================================================
// Image file I/O for the headless CLI
// ============================================================================

use std::path::Path;

use image::RgbaImage;

use crate::error::EditError;

/// Load any supported raster format as RGBA.
pub fn load_image(path: &Path) -> Result<RgbaImage, EditError> {
    let img = image::open(path)
        .map_err(|e| EditError::Io(format!("Failed to load {}: {}", path.display(), e)))?;
    Ok(img.to_rgba8())
}

/// Encode by the output path's extension (png, jpg/jpeg, webp, bmp).
/// JPEG flattens the alpha channel; everything else keeps it.
pub fn save_image(image: &RgbaImage, path: &Path) -> Result<(), EditError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let result = match ext.as_str() {
        "jpg" | "jpeg" => {
            // JPEG has no alpha — drop it
            let rgb = image::DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            rgb.save(path)
        }
        "png" | "webp" | "bmp" => image.save(path),
        other => {
            return Err(EditError::Io(format!(
                "Unsupported output format '.{}' (use png, jpg, webp, or bmp)",
                other
            )));
        }
    };
    result.map_err(|e| EditError::Io(format!("Failed to save {}: {}", path.display(), e)))
}
