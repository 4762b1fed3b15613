// ============================================================================
// Object removal — mask-guided neural inpainting
// ============================================================================
//
// Single inference pass at the model's fixed resolution, blended back
// through the *unblurred* original-resolution mask. The mask fed to the
// model is softened first so hard stroke edges do not produce visible seams;
// the blend curve (w^1.5) keeps the confident interior fully replaced while
// feathering the boundary. Any failure aborts the whole operation — the
// caller keeps the pre-operation image, never a partial mutation.

use image::{GrayImage, RgbaImage, imageops};

use crate::error::EditError;
use crate::mask::{self, WeightCurve};
use crate::registry::{ModelKind, ModelRegistry};
use crate::{codec, log_info};

/// Softening radius applied to the mask at model resolution.
const MASK_FEATHER_RADIUS: u32 = 12;

/// Remove the masked region from `image`, filling it from surrounding
/// context. `mask` selects the pixels to remove (255 = remove) and must
/// match the image dimensions.
pub fn remove_object(
    registry: &ModelRegistry,
    image: &RgbaImage,
    mask_full: &GrayImage,
) -> Result<RgbaImage, EditError> {
    let (width, height) = image.dimensions();
    if mask_full.dimensions() != (width, height) {
        return Err(EditError::Geometry(format!(
            "mask is {:?}, image is {}x{}",
            mask_full.dimensions(),
            width,
            height
        )));
    }

    let spec = registry.spec(ModelKind::Inpainting)?.clone();
    let size = spec.input_size;
    let session = registry.acquire(ModelKind::Inpainting)?;

    log_info!(
        "Inpaint: {}x{} image at model resolution {}x{}",
        width,
        height,
        size,
        size
    );

    // Image and mask are resized independently; the mask gets a softening
    // pass on top.
    let output = {
        let image_tensor = codec::encode(image, (size, size), spec.layout, spec.normalization);
        let mask_small = imageops::resize(mask_full, size, size, imageops::FilterType::Triangle);
        let mask_soft = mask::feather(&mask_small, MASK_FEATHER_RADIUS);
        let mask_tensor = codec::encode_mask(&mask_soft, (size, size));

        let mut outputs = session
            .run(&[("image", &image_tensor), ("mask", &mask_tensor)])
            .map_err(EditError::from)?;
        super::pick_output(&mut outputs, &["output", "inpainted"])?
        // input tensors and intermediate masks drop here
    };

    let (out_h, out_w) = output
        .spatial_dims()
        .filter(|&(h, w)| h > 0 && w > 0)
        .ok_or_else(|| {
            EditError::InvalidOutput(format!("inpainting output shape {:?}", output.shape()))
        })?;

    // The output's numeric range is not fixed across model revisions;
    // detect it before denormalizing.
    let inpainted = codec::decode_auto_range(&output, out_w, out_h, spec.layout)?;
    drop(output);

    let restored = if inpainted.dimensions() == (width, height) {
        inpainted
    } else {
        imageops::resize(&inpainted, width, height, imageops::FilterType::Triangle)
    };

    // Blend through the unblurred original mask.
    Ok(mask::blend(image, &restored, mask_full, WeightCurve::SOFT))
}
