// ============================================================================
// Background removal / substitution
// ============================================================================
//
// A single saliency-segmentation pass produces a foreground-probability map;
// the probabilities are remapped around the caller's threshold with a steep
// sigmoid (smooth edges instead of a hard cutoff) into a mask at source
// resolution. The mask then drives one of three composites: transparent
// background, flat color, or a replacement image.

use image::{GrayImage, Luma, Rgba, RgbaImage, imageops};

use crate::error::EditError;
use crate::mask::{self, WeightCurve};
use crate::registry::{ModelKind, ModelRegistry};
use crate::{codec, log_info};

/// Steepness of the smooth threshold transition.
const SMOOTH_STEEPNESS: f32 = 12.0;

/// Run the segmentation model and build a foreground mask at the image's
/// resolution. `threshold` in [0,1] moves the foreground/background cut.
pub fn segment_foreground(
    registry: &ModelRegistry,
    image: &RgbaImage,
    threshold: f32,
) -> Result<GrayImage, EditError> {
    let (width, height) = image.dimensions();
    let spec = registry.spec(ModelKind::Segmentation)?.clone();
    let size = spec.input_size;
    let session = registry.acquire(ModelKind::Segmentation)?;

    log_info!(
        "Segment: {}x{} at model resolution {}x{}, threshold {:.2}",
        width,
        height,
        size,
        size,
        threshold
    );

    let output = {
        let input = codec::encode(image, (size, size), spec.layout, spec.normalization);
        let mut outputs = session.run(&[("input", &input)]).map_err(EditError::from)?;
        // U²-Net's refined map is its first output, conventionally "d0".
        super::pick_output(&mut outputs, &["d0", "output"])?
    };

    let (out_h, out_w) = output
        .spatial_dims()
        .filter(|&(h, w)| h > 0 && w > 0)
        .ok_or_else(|| {
            EditError::InvalidOutput(format!("segmentation output shape {:?}", output.shape()))
        })?;
    let probs = output
        .as_f32()
        .ok_or_else(|| EditError::InvalidOutput("segmentation output not float".to_string()))?;
    if probs.len() < (out_w * out_h) as usize {
        return Err(EditError::InvalidOutput(format!(
            "segmentation output has {} values for a {}x{} map",
            probs.len(),
            out_w,
            out_h
        )));
    }

    // Smooth transition: remap probabilities around the threshold with a
    // steep sigmoid instead of a hard cutoff.
    let mut small = GrayImage::new(out_w, out_h);
    for (i, pixel) in small.pixels_mut().enumerate() {
        let p = probs[i].clamp(0.0, 1.0);
        let remapped = 1.0 / (1.0 + (-(p - threshold) * SMOOTH_STEEPNESS).exp());
        *pixel = Luma([(remapped * 255.0).round().clamp(0.0, 255.0) as u8]);
    }
    drop(output);

    if small.dimensions() == (width, height) {
        Ok(small)
    } else {
        Ok(imageops::resize(
            &small,
            width,
            height,
            imageops::FilterType::Triangle,
        ))
    }
}

/// Foreground against a transparent or flat-color background.
/// `color: None` keeps the background transparent (mask becomes alpha,
/// combined with the existing alpha channel).
pub fn apply_background_color(
    image: &RgbaImage,
    mask_full: &GrayImage,
    color: Option<Rgba<u8>>,
) -> Result<RgbaImage, EditError> {
    if mask_full.dimensions() != image.dimensions() {
        return Err(EditError::Geometry(format!(
            "mask is {:?}, image is {:?}",
            mask_full.dimensions(),
            image.dimensions()
        )));
    }

    match color {
        None => {
            let mut out = image.clone();
            for (x, y, pixel) in out.enumerate_pixels_mut() {
                let alpha = pixel[3] as f32 / 255.0;
                let mask_alpha = mask_full.get_pixel(x, y)[0] as f32 / 255.0;
                pixel[3] = (alpha * mask_alpha * 255.0).round().clamp(0.0, 255.0) as u8;
            }
            Ok(out)
        }
        Some(c) => {
            let backdrop = RgbaImage::from_pixel(image.width(), image.height(), c);
            // w^0.5 keeps the foreground dominant through soft mask edges,
            // so the backdrop does not bleed into feathered hair/fur detail.
            Ok(mask::blend(&backdrop, image, mask_full, WeightCurve::FEATHER))
        }
    }
}

/// Foreground composited over a replacement image (resized to fit).
pub fn apply_background_image(
    image: &RgbaImage,
    mask_full: &GrayImage,
    background: &RgbaImage,
) -> Result<RgbaImage, EditError> {
    if mask_full.dimensions() != image.dimensions() {
        return Err(EditError::Geometry(format!(
            "mask is {:?}, image is {:?}",
            mask_full.dimensions(),
            image.dimensions()
        )));
    }
    let backdrop = if background.dimensions() == image.dimensions() {
        background.clone()
    } else {
        imageops::resize(
            background,
            image.width(),
            image.height(),
            imageops::FilterType::Triangle,
        )
    };
    Ok(mask::blend(&backdrop, image, mask_full, WeightCurve::FEATHER))
}

/// One-shot background removal: segment, then cut the background to
/// transparent. Returns the composited preview plus the mask so the caller
/// can re-composite under different settings without re-running the model.
pub fn remove_background(
    registry: &ModelRegistry,
    image: &RgbaImage,
    threshold: f32,
) -> Result<(RgbaImage, GrayImage), EditError> {
    let mask_full = segment_foreground(registry, image, threshold)?;
    let preview = apply_background_color(image, &mask_full, None)?;
    Ok((preview, mask_full))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, Tensor};
    use crate::testing::{RunFn, mock_registry};
    use std::collections::HashMap;
    use std::sync::Arc;

    /// Saliency map: left half foreground (p=1), right half background (p=0).
    fn half_split_session() -> RunFn {
        Arc::new(|inputs| {
            let (_, t) = inputs
                .first()
                .ok_or_else(|| EngineError::InferenceFailed("no input".to_string()))?;
            let (h, w) = t.spatial_dims().unwrap();
            let mut data = vec![0.0f32; (h * w) as usize];
            for y in 0..h {
                for x in 0..w / 2 {
                    data[(y * w + x) as usize] = 1.0;
                }
            }
            let mut out = HashMap::new();
            out.insert(
                "d0".to_string(),
                Tensor::f32(vec![1, 1, h as i64, w as i64], data),
            );
            Ok(out)
        })
    }

    #[test]
    fn segmentation_splits_foreground_from_background() {
        let (_dirs, registry) = mock_registry(vec![(ModelKind::Segmentation, half_split_session())]);
        let image = RgbaImage::from_pixel(80, 60, Rgba([50, 50, 50, 255]));
        let mask = segment_foreground(&registry, &image, 0.5).unwrap();
        assert_eq!(mask.dimensions(), (80, 60));
        assert!(mask.get_pixel(10, 30)[0] > 240);
        assert!(mask.get_pixel(70, 30)[0] < 15);
    }

    #[test]
    fn transparent_background_zeroes_alpha_outside_mask() {
        let (_dirs, registry) = mock_registry(vec![(ModelKind::Segmentation, half_split_session())]);
        let image = RgbaImage::from_pixel(40, 40, Rgba([200, 100, 50, 255]));
        let (preview, mask) = remove_background(&registry, &image, 0.5).unwrap();
        assert!(preview.get_pixel(5, 20)[3] > 240);
        assert!(preview.get_pixel(35, 20)[3] < 15);
        assert_eq!(mask.dimensions(), (40, 40));
        // Color channels stay untouched either side.
        assert_eq!(preview.get_pixel(35, 20)[0], 200);
    }

    #[test]
    fn flat_color_background_replaces_outside_mask() {
        let image = RgbaImage::from_pixel(20, 20, Rgba([10, 10, 10, 255]));
        let mut mask = GrayImage::new(20, 20);
        for y in 0..20 {
            for x in 0..10 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let out =
            apply_background_color(&image, &mask, Some(Rgba([0, 255, 0, 255]))).unwrap();
        assert_eq!(*out.get_pixel(3, 10), Rgba([10, 10, 10, 255]));
        assert_eq!(*out.get_pixel(15, 10), Rgba([0, 255, 0, 255]));
    }

    #[test]
    fn replacement_image_background() {
        let image = RgbaImage::from_pixel(16, 16, Rgba([10, 10, 10, 255]));
        let bg = RgbaImage::from_pixel(4, 4, Rgba([200, 0, 0, 255]));
        let mask = GrayImage::new(16, 16); // nothing selected → all backdrop
        let out = apply_background_image(&image, &mask, &bg).unwrap();
        assert_eq!(*out.get_pixel(8, 8), Rgba([200, 0, 0, 255]));
    }

    #[test]
    fn mask_size_mismatch_is_geometry_error() {
        let image = RgbaImage::new(16, 16);
        let mask = GrayImage::new(8, 8);
        assert!(matches!(
            apply_background_color(&image, &mask, None),
            Err(EditError::Geometry(_))
        ));
    }
}
