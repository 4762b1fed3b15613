// ============================================================================
// Tensor codec — image region ⇄ normalized float tensor
// ============================================================================
//
// Channel order and normalization constants are model-specific configuration
// carried by the registry's contract table; nothing here is hard-coded per
// call site. Encode and decode are exact inverses modulo resize and 8-bit
// quantization.

use image::{Rgba, RgbaImage, imageops};
use serde::{Deserialize, Serialize};

use crate::engine::Tensor;
use crate::error::EditError;

/// Memory layout of the pixel channels inside a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorLayout {
    /// NCHW — all R values, then all G, then all B.
    ChannelMajor,
    /// NHWC — R,G,B per pixel, pixel by pixel.
    PixelMajor,
}

/// Per-channel normalization stats, expressed in the [0,1] domain:
/// `t = (v/255 − mean[c]) / std[c]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    /// No-op stats: tensor values are the raw [0,1] channel values.
    pub const UNIT: Normalization = Normalization {
        mean: [0.0, 0.0, 0.0],
        std: [1.0, 1.0, 1.0],
    };

    /// ImageNet statistics, used by the segmentation encoder.
    pub const IMAGENET: Normalization = Normalization {
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    /// Symmetric stats mapping [0,1] onto [-1,1], used by the face
    /// restoration model.
    pub const SYMMETRIC: Normalization = Normalization {
        mean: [0.5, 0.5, 0.5],
        std: [0.5, 0.5, 0.5],
    };
}

/// Resize (bilinear) a region to `target`, normalize each channel, and lay
/// the result out as a `[1, 3, H, W]` or `[1, H, W, 3]` float tensor.
pub fn encode(
    region: &RgbaImage,
    target: (u32, u32),
    layout: TensorLayout,
    norm: Normalization,
) -> Tensor {
    let (tw, th) = target;
    let resized;
    let source = if region.dimensions() == (tw, th) {
        region
    } else {
        resized = imageops::resize(region, tw, th, imageops::FilterType::Triangle);
        &resized
    };

    let npixels = (tw as usize) * (th as usize);
    let mut data = vec![0.0f32; 3 * npixels];

    match layout {
        TensorLayout::ChannelMajor => {
            for (i, pixel) in source.pixels().enumerate() {
                for c in 0..3 {
                    data[c * npixels + i] =
                        (pixel[c] as f32 / 255.0 - norm.mean[c]) / norm.std[c];
                }
            }
            Tensor::f32(vec![1, 3, th as i64, tw as i64], data)
        }
        TensorLayout::PixelMajor => {
            for (i, pixel) in source.pixels().enumerate() {
                for c in 0..3 {
                    data[i * 3 + c] = (pixel[c] as f32 / 255.0 - norm.mean[c]) / norm.std[c];
                }
            }
            Tensor::f32(vec![1, th as i64, tw as i64, 3], data)
        }
    }
}

/// Encode a grayscale mask as a single-channel `[1, 1, H, W]` tensor with
/// values in [0,1]. Resizes (bilinear) when the mask is not already at the
/// target size.
pub fn encode_mask(mask: &image::GrayImage, target: (u32, u32)) -> Tensor {
    let (tw, th) = target;
    let resized;
    let source = if mask.dimensions() == (tw, th) {
        mask
    } else {
        resized = imageops::resize(mask, tw, th, imageops::FilterType::Triangle);
        &resized
    };
    let data: Vec<f32> = source.pixels().map(|p| p[0] as f32 / 255.0).collect();
    Tensor::f32(vec![1, 1, th as i64, tw as i64], data)
}

/// Exact inverse of [`encode`]: denormalize, clamp to [0,255], reassemble
/// opaque RGBA pixels. The tensor's spatial dims must match `(width, height)`.
pub fn decode(
    tensor: &Tensor,
    width: u32,
    height: u32,
    layout: TensorLayout,
    norm: Normalization,
) -> Result<RgbaImage, EditError> {
    let data = tensor
        .as_f32()
        .ok_or_else(|| EditError::InvalidOutput("expected a float tensor".to_string()))?;
    let npixels = (width as usize) * (height as usize);
    if data.len() != 3 * npixels {
        return Err(EditError::InvalidOutput(format!(
            "tensor has {} values, expected {} for {}x{}x3",
            data.len(),
            3 * npixels,
            width,
            height
        )));
    }

    let mut out = RgbaImage::new(width, height);
    for (i, pixel) in out.pixels_mut().enumerate() {
        let mut rgb = [0u8; 3];
        for c in 0..3 {
            let v = match layout {
                TensorLayout::ChannelMajor => data[c * npixels + i],
                TensorLayout::PixelMajor => data[i * 3 + c],
            };
            rgb[c] = ((v * norm.std[c] + norm.mean[c]) * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        *pixel = Rgba([rgb[0], rgb[1], rgb[2], 255]);
    }
    Ok(out)
}

// -- Output range detection ---------------------------------------------

/// Numeric range of a raw model output. Some model revisions emit [0,1],
/// others [-1,1] or already-8-bit values; the range is sniffed from the
/// tensor's min/max rather than assumed fixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueRange {
    /// Values in [0, 1].
    Unit,
    /// Values in [-1, 1].
    Symmetric,
    /// Values already in [0, 255].
    EightBit,
}

impl ValueRange {
    /// Inspect min/max to classify the output range. Sampling is evenly
    /// spaced for speed on large tensors.
    pub fn detect(data: &[f32]) -> ValueRange {
        if data.is_empty() {
            return ValueRange::Unit;
        }
        let step = (data.len() / 10_000).max(1);
        let mut min_val = f32::MAX;
        let mut max_val = f32::MIN;
        for i in (0..data.len()).step_by(step) {
            min_val = min_val.min(data[i]);
            max_val = max_val.max(data[i]);
        }
        if min_val >= -0.05 && max_val <= 1.05 {
            ValueRange::Unit
        } else if min_val >= -1.1 && max_val <= 1.1 {
            ValueRange::Symmetric
        } else {
            ValueRange::EightBit
        }
    }

    /// Map one raw value to an 8-bit channel.
    #[inline]
    pub fn to_u8(self, v: f32) -> u8 {
        let scaled = match self {
            ValueRange::Unit => v * 255.0,
            ValueRange::Symmetric => (v + 1.0) * 127.5,
            ValueRange::EightBit => v,
        };
        scaled.round().clamp(0.0, 255.0) as u8
    }
}

/// Decode a `[1,3,H,W]` / `[1,H,W,3]` tensor whose numeric range is not
/// fixed by contract: sniff the range, then map to 8-bit.
pub fn decode_auto_range(
    tensor: &Tensor,
    width: u32,
    height: u32,
    layout: TensorLayout,
) -> Result<RgbaImage, EditError> {
    let data = tensor
        .as_f32()
        .ok_or_else(|| EditError::InvalidOutput("expected a float tensor".to_string()))?;
    let npixels = (width as usize) * (height as usize);
    if data.len() != 3 * npixels {
        return Err(EditError::InvalidOutput(format!(
            "tensor has {} values, expected {} for {}x{}x3",
            data.len(),
            3 * npixels,
            width,
            height
        )));
    }

    let range = ValueRange::detect(data);
    crate::log_info!("Output value range detected: {:?}", range);

    let mut out = RgbaImage::new(width, height);
    for (i, pixel) in out.pixels_mut().enumerate() {
        let mut rgb = [0u8; 3];
        for c in 0..3 {
            let v = match layout {
                TensorLayout::ChannelMajor => data[c * npixels + i],
                TensorLayout::PixelMajor => data[i * 3 + c],
            };
            rgb[c] = range.to_u8(v);
        }
        *pixel = Rgba([rgb[0], rgb[1], rgb[2], 255]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([rgb[0], rgb[1], rgb[2], 255]))
    }

    #[test]
    fn round_trip_unit_stats_within_one() {
        let img = solid(8, 8, [200, 33, 119]);
        for layout in [TensorLayout::ChannelMajor, TensorLayout::PixelMajor] {
            let t = encode(&img, (8, 8), layout, Normalization::UNIT);
            let back = decode(&t, 8, 8, layout, Normalization::UNIT).unwrap();
            for (p, q) in img.pixels().zip(back.pixels()) {
                for c in 0..3 {
                    assert!((p[c] as i16 - q[c] as i16).abs() <= 1);
                }
            }
        }
    }

    #[test]
    fn round_trip_imagenet_stats_within_one() {
        let img = solid(4, 4, [10, 128, 250]);
        let t = encode(&img, (4, 4), TensorLayout::ChannelMajor, Normalization::IMAGENET);
        let back = decode(&t, 4, 4, TensorLayout::ChannelMajor, Normalization::IMAGENET).unwrap();
        for (p, q) in img.pixels().zip(back.pixels()) {
            for c in 0..3 {
                assert!((p[c] as i16 - q[c] as i16).abs() <= 1);
            }
        }
    }

    #[test]
    fn re_encoding_decoded_tensor_matches() {
        let img = solid(6, 6, [90, 180, 45]);
        let t = encode(&img, (6, 6), TensorLayout::ChannelMajor, Normalization::IMAGENET);
        let decoded = decode(&t, 6, 6, TensorLayout::ChannelMajor, Normalization::IMAGENET).unwrap();
        let t2 = encode(&decoded, (6, 6), TensorLayout::ChannelMajor, Normalization::IMAGENET);
        for (a, b) in t.as_f32().unwrap().iter().zip(t2.as_f32().unwrap()) {
            // One quantization step divided by the smallest std
            assert!((a - b).abs() < (1.0 / 255.0) / 0.225 + 1e-6);
        }
    }

    #[test]
    fn channel_major_layout_places_planes() {
        let mut img = solid(2, 1, [0, 0, 0]);
        img.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        img.put_pixel(1, 0, Rgba([0, 255, 0, 255]));
        let t = encode(&img, (2, 1), TensorLayout::ChannelMajor, Normalization::UNIT);
        let d = t.as_f32().unwrap();
        // R plane then G plane then B plane
        assert_eq!(d, &[1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        let t = encode(&img, (2, 1), TensorLayout::PixelMajor, Normalization::UNIT);
        let d = t.as_f32().unwrap();
        assert_eq!(d, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn mask_encode_is_unit_range() {
        let mut mask = image::GrayImage::new(2, 2);
        mask.put_pixel(0, 0, image::Luma([255]));
        mask.put_pixel(1, 1, image::Luma([128]));
        let t = encode_mask(&mask, (2, 2));
        assert_eq!(t.shape(), &[1, 1, 2, 2]);
        let d = t.as_f32().unwrap();
        assert_eq!(d[0], 1.0);
        assert!((d[3] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn range_detection() {
        assert_eq!(ValueRange::detect(&[0.0, 0.5, 1.0]), ValueRange::Unit);
        assert_eq!(ValueRange::detect(&[-0.9, 0.2, 0.8]), ValueRange::Symmetric);
        assert_eq!(ValueRange::detect(&[0.0, 128.0, 255.0]), ValueRange::EightBit);
        assert_eq!(ValueRange::Symmetric.to_u8(1.0), 255);
        assert_eq!(ValueRange::Symmetric.to_u8(-1.0), 0);
        assert_eq!(ValueRange::EightBit.to_u8(300.0), 255);
    }

    #[test]
    fn decode_rejects_bad_shape() {
        let t = Tensor::f32(vec![1, 3, 2, 2], vec![0.0; 12]);
        assert!(decode(&t, 4, 4, TensorLayout::ChannelMajor, Normalization::UNIT).is_err());
    }
}
