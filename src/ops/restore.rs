// ============================================================================
// Face restoration — single-pass detail recovery
// ============================================================================
//
// One inference at the restoration model's fixed resolution. The model's
// contract is symmetric normalization ([-1,1]) both directions; unlike the
// inpainting model its output range is part of the contract, so the decode
// uses the contract stats rather than range sniffing.

use image::{RgbaImage, imageops};

use crate::error::EditError;
use crate::registry::{ModelKind, ModelRegistry};
use crate::{codec, log_info};

/// Restore facial detail across the whole frame. Any failure aborts the
/// operation; the caller keeps the pre-operation image.
pub fn restore_face(registry: &ModelRegistry, image: &RgbaImage) -> Result<RgbaImage, EditError> {
    let (width, height) = image.dimensions();
    let spec = registry.spec(ModelKind::FaceRestoration)?.clone();
    let size = spec.input_size;
    let session = registry.acquire(ModelKind::FaceRestoration)?;

    log_info!("Restore: {}x{} at model resolution {}x{}", width, height, size, size);

    let output = {
        let input = codec::encode(image, (size, size), spec.layout, spec.normalization);
        let mut outputs = session.run(&[("input", &input)]).map_err(EditError::from)?;
        super::pick_output(&mut outputs, &["output"])?
    };

    let (out_h, out_w) = output
        .spatial_dims()
        .filter(|&(h, w)| h > 0 && w > 0)
        .ok_or_else(|| {
            EditError::InvalidOutput(format!("restoration output shape {:?}", output.shape()))
        })?;
    let restored = codec::decode(&output, out_w, out_h, spec.layout, spec.normalization)?;
    drop(output);

    if restored.dimensions() == (width, height) {
        Ok(restored)
    } else {
        Ok(imageops::resize(
            &restored,
            width,
            height,
            imageops::FilterType::Triangle,
        ))
    }
}
