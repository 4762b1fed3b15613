// ============================================================================
// Segmentation refinement — rough stroke mask → prompt-driven neural mask
// ============================================================================
//
// Two-stage pipeline over the MobileSAM-style encoder/decoder pair:
//
//   Idle → Encoding → Decoding → Constraining → Done
//
// 1. Derive a single foreground point prompt from the rough mask's centroid.
//    An empty rough mask short-circuits to an all-zero output, no inference.
// 2. Encode the image once at the encoder's fixed resolution; run the
//    encoder to get the image embedding.
// 3. Run the decoder with {embedding, point, label, zeroed placeholder mask,
//    has-prior-mask=false} to get low-resolution mask logits.
// 4. Upscale logits to encoder resolution (nearest on the logit grid — the
//    sigmoid and the downstream blend do the smoothing), apply sigmoid,
//    scale to 8-bit.
// 5. Constrain to the rough mask's expanded bounds so the segmentation
//    cannot bleed far beyond the user's gesture, then downscale to the
//    source resolution.
//
// Failure in steps 2–5 falls back to the rough mask at source resolution —
// never a partial or garbage mask. The fallback is a visible branch of the
// outcome type, not an implicit catch.

use image::{GrayImage, Luma, RgbaImage, imageops};

use crate::engine::Tensor;
use crate::error::EditError;
use crate::registry::{ModelKind, ModelRegistry};
use crate::{codec, log_err, log_info, mask};

/// Expansion margin applied to the rough mask's bounds, in pixels at the
/// encoder's resolution.
const BOUNDS_MARGIN: u32 = 20;

/// Decoder placeholder-mask grid edge.
const PRIOR_MASK_GRID: u32 = 256;

/// How a refinement run concluded.
#[derive(Debug)]
pub enum RefineOutcome {
    /// Neural refinement succeeded.
    Refined(GrayImage),
    /// The rough mask had no selected pixels; nothing was run.
    EmptyMask(GrayImage),
    /// Refinement failed; the rough mask (at source resolution) stands in.
    RoughFallback { mask: GrayImage, error: EditError },
}

impl RefineOutcome {
    /// The usable mask, whichever way the run concluded.
    pub fn into_mask(self) -> GrayImage {
        match self {
            RefineOutcome::Refined(m) => m,
            RefineOutcome::EmptyMask(m) => m,
            RefineOutcome::RoughFallback { mask, .. } => mask,
        }
    }

    pub fn is_refined(&self) -> bool {
        matches!(self, RefineOutcome::Refined(_))
    }
}

/// Refine a stroke-derived rough mask against the image content.
pub fn refine_mask(
    registry: &ModelRegistry,
    image: &RgbaImage,
    rough: &GrayImage,
) -> RefineOutcome {
    let (width, height) = image.dimensions();

    // Prompt generation: centroid of the drawn pixels. No pixels drawn is a
    // terminal no-op, not an error.
    let Some(center) = mask::centroid(rough, mask::MASK_THRESHOLD) else {
        log_info!("Refine: rough mask is empty, returning all-zero mask");
        return RefineOutcome::EmptyMask(GrayImage::new(width, height));
    };

    match run_refinement(registry, image, rough, center) {
        Ok(constrained) => {
            let final_mask = imageops::resize(
                &constrained,
                width,
                height,
                imageops::FilterType::Triangle,
            );
            log_info!("Refine: completed");
            RefineOutcome::Refined(final_mask)
        }
        Err(error) => {
            log_err!("Refine failed, falling back to rough mask: {}", error);
            let fallback = if rough.dimensions() == (width, height) {
                rough.clone()
            } else {
                imageops::resize(rough, width, height, imageops::FilterType::Triangle)
            };
            RefineOutcome::RoughFallback {
                mask: fallback,
                error,
            }
        }
    }
}

fn run_refinement(
    registry: &ModelRegistry,
    image: &RgbaImage,
    rough: &GrayImage,
    center: (f32, f32),
) -> Result<GrayImage, EditError> {
    let spec = registry.spec(ModelKind::SamEncoder)?.clone();
    let size = spec.input_size;

    // -- Encoding --
    log_info!("Refine: encoding image at {}x{}", size, size);
    let encoder = registry.acquire(ModelKind::SamEncoder)?;
    let embeddings = {
        let input = codec::encode(image, (size, size), spec.layout, spec.normalization);
        let mut outputs = encoder.run(&[("input", &input)]).map_err(EditError::from)?;
        super::pick_output(&mut outputs, &["image_embeddings"])?
        // input tensor and remaining outputs drop here
    };

    // -- Decoding --
    log_info!(
        "Refine: decoding with point prompt ({:.3}, {:.3})",
        center.0,
        center.1
    );
    let decoder = registry.acquire(ModelKind::SamDecoder)?;

    // Scale the normalized centroid into the encoder's coordinate space.
    let point_coords = Tensor::f32(
        vec![1, 1, 2],
        vec![center.0 * size as f32, center.1 * size as f32],
    );
    // A single foreground point.
    let point_labels = Tensor::i64(vec![1, 1], vec![1]);
    // No prior mask: zeroed placeholder plus has_mask_input = 0.
    let grid = (PRIOR_MASK_GRID * PRIOR_MASK_GRID) as usize;
    let mask_input = Tensor::f32(
        vec![1, 1, PRIOR_MASK_GRID as i64, PRIOR_MASK_GRID as i64],
        vec![0.0; grid],
    );
    let has_mask_input = Tensor::f32(vec![1], vec![0.0]);

    let logits = {
        let mut outputs = decoder
            .run(&[
                ("image_embeddings", &embeddings),
                ("point_coords", &point_coords),
                ("point_labels", &point_labels),
                ("mask_input", &mask_input),
                ("has_mask_input", &has_mask_input),
            ])
            .map_err(EditError::from)?;
        super::pick_output(&mut outputs, &["masks"])?
    };
    drop(embeddings);

    let (logit_h, logit_w) = logits
        .spatial_dims()
        .filter(|&(h, w)| h > 0 && w > 0)
        .ok_or_else(|| {
            EditError::InvalidOutput(format!("mask logits shape {:?}", logits.shape()))
        })?;
    let logit_data = logits
        .as_f32()
        .ok_or_else(|| EditError::InvalidOutput("mask logits not float".to_string()))?;
    if logit_data.len() < (logit_w * logit_h) as usize {
        return Err(EditError::InvalidOutput(format!(
            "mask logits have {} values for a {}x{} grid",
            logit_data.len(),
            logit_w,
            logit_h
        )));
    }

    let segmentation = logits_to_mask(logit_data, logit_w, logit_h, size);

    // -- Constraining --
    let rough_scaled = imageops::resize(rough, size, size, imageops::FilterType::Triangle);
    Ok(mask::constrain(&segmentation, &rough_scaled, BOUNDS_MARGIN))
}

/// Nearest-neighbour upscale of the logit grid to `size`², sigmoid to [0,1],
/// scaled to 8-bit intensity.
fn logits_to_mask(logits: &[f32], logit_w: u32, logit_h: u32, size: u32) -> GrayImage {
    let mut out = GrayImage::new(size, size);
    for y in 0..size {
        let ly = (y * logit_h / size).min(logit_h - 1);
        for x in 0..size {
            let lx = (x * logit_w / size).min(logit_w - 1);
            let logit = logits[(ly * logit_w + lx) as usize];
            let probability = 1.0 / (1.0 + (-logit).exp());
            let intensity = (probability * 255.0).round().clamp(0.0, 255.0) as u8;
            out.put_pixel(x, y, Luma([intensity]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::testing::{RunFn, mock_registry};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const SIZE: u32 = 1024;

    fn encoder_session() -> RunFn {
        Arc::new(|_inputs| {
            let mut out = HashMap::new();
            out.insert(
                "image_embeddings".to_string(),
                Tensor::f32(vec![1, 256, 64, 64], vec![0.0; 256 * 64 * 64]),
            );
            Ok(out)
        })
    }

    /// Decoder whose logits are positive inside the central quarter of the
    /// grid and strongly negative elsewhere.
    fn decoder_session(seen: Arc<Mutex<Vec<(String, Tensor)>>>) -> RunFn {
        Arc::new(move |inputs| {
            *seen.lock().unwrap() = inputs
                .iter()
                .map(|(n, t)| (n.to_string(), (*t).clone()))
                .collect();
            let g = 256u32;
            let mut logits = vec![-12.0f32; (g * g) as usize];
            // 2.2 → sigmoid ≈ 0.90, below the high-confidence constrain band
            for y in g / 4..3 * g / 4 {
                for x in g / 4..3 * g / 4 {
                    logits[(y * g + x) as usize] = 2.2;
                }
            }
            let mut out = HashMap::new();
            out.insert(
                "masks".to_string(),
                Tensor::f32(vec![1, 1, g as i64, g as i64], logits),
            );
            Ok(out)
        })
    }

    fn center_square_rough(w: u32, h: u32) -> GrayImage {
        let mut rough = GrayImage::new(w, h);
        for y in h * 3 / 8..h * 5 / 8 {
            for x in w * 3 / 8..w * 5 / 8 {
                rough.put_pixel(x, y, Luma([255]));
            }
        }
        rough
    }

    #[test]
    fn empty_rough_mask_short_circuits() {
        // No models registered at all: the empty path must not touch them.
        let (_dirs, registry) = mock_registry(vec![]);
        let image = RgbaImage::new(64, 64);
        let rough = GrayImage::new(64, 64);
        let outcome = refine_mask(&registry, &image, &rough);
        match outcome {
            RefineOutcome::EmptyMask(m) => {
                assert_eq!(m.dimensions(), (64, 64));
                assert!(m.pixels().all(|p| p[0] == 0));
            }
            other => panic!("expected EmptyMask, got {:?}", other),
        }
    }

    #[test]
    fn refines_and_constrains_to_rough_bounds() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (_dirs, registry) = mock_registry(vec![
            (ModelKind::SamEncoder, encoder_session()),
            (ModelKind::SamDecoder, decoder_session(seen.clone())),
        ]);

        let image = RgbaImage::new(128, 128);
        let rough = center_square_rough(128, 128);
        let outcome = refine_mask(&registry, &image, &rough);
        assert!(outcome.is_refined());
        let refined = outcome.into_mask();
        assert_eq!(refined.dimensions(), (128, 128));

        // Center selected, far corner suppressed by the constrain box.
        assert!(refined.get_pixel(64, 64)[0] > 200);
        assert_eq!(refined.get_pixel(4, 4)[0], 0);
        // Inside the decoder's detection but outside the rough mask's
        // expanded bounds: suppressed by the constrain step.
        assert_eq!(refined.get_pixel(37, 64)[0], 0);

        // The decoder received the prompt contract: a single foreground
        // point at the centroid scaled into encoder space, no prior mask.
        let inputs = seen.lock().unwrap();
        let point = inputs
            .iter()
            .find(|(n, _)| n == "point_coords")
            .map(|(_, t)| t.clone())
            .unwrap();
        let coords = point.as_f32().unwrap();
        assert!((coords[0] - 0.5 * SIZE as f32).abs() < SIZE as f32 * 0.01);
        assert!((coords[1] - 0.5 * SIZE as f32).abs() < SIZE as f32 * 0.01);

        let labels = inputs
            .iter()
            .find(|(n, _)| n == "point_labels")
            .map(|(_, t)| t.clone())
            .unwrap();
        assert_eq!(labels.as_i64(), Some(&[1i64][..]));

        let has_mask = inputs
            .iter()
            .find(|(n, _)| n == "has_mask_input")
            .map(|(_, t)| t.clone())
            .unwrap();
        assert_eq!(has_mask.as_f32(), Some(&[0.0f32][..]));
    }

    #[test]
    fn decoder_failure_falls_back_to_rough_mask() {
        let failing: RunFn = Arc::new(|_inputs| {
            Err(EngineError::InferenceFailed("scripted failure".to_string()))
        });
        let (_dirs, registry) = mock_registry(vec![
            (ModelKind::SamEncoder, encoder_session()),
            (ModelKind::SamDecoder, failing),
        ]);

        let image = RgbaImage::new(96, 96);
        let rough = center_square_rough(96, 96);
        match refine_mask(&registry, &image, &rough) {
            RefineOutcome::RoughFallback { mask, error } => {
                assert_eq!(mask.as_raw(), rough.as_raw());
                assert!(matches!(error, EditError::Inference(_)));
            }
            other => panic!("expected RoughFallback, got {:?}", other),
        }
    }

    #[test]
    fn missing_encoder_model_falls_back() {
        let (_dirs, registry) = mock_registry(vec![]);
        let image = RgbaImage::new(32, 32);
        let rough = center_square_rough(32, 32);
        match refine_mask(&registry, &image, &rough) {
            RefineOutcome::RoughFallback { error, .. } => {
                assert!(matches!(error, EditError::ModelLoad(_)));
            }
            other => panic!("expected RoughFallback, got {:?}", other),
        }
    }
}
