// ============================================================================
// Mask engine — stroke rasterization, mask algebra, mask-guided compositing
// ============================================================================
//
// A mask is a single-channel intensity buffer: 255 = selected, 0 =
// background, gradients permitted during blending. Masks are always
// regenerable from their stroke list or from model output — never
// hand-edited.

use image::{GrayImage, Luma, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Intensity above which a pixel counts as selected.
pub const MASK_THRESHOLD: u8 = 25;

/// Candidate-mask intensities above this survive outside the constrain box;
/// a detection this strong should not be truncated at the boundary.
const HIGH_CONFIDENCE: u8 = 240;

/// Blend weights below this copy the base pixel verbatim — no floating-point
/// drift on untouched pixels.
const WEIGHT_EPSILON: f32 = 1.0 / 512.0;

// -- Brush strokes ------------------------------------------------------

/// One freehand stroke: an ordered list of points normalized to
/// [0,1]×[0,1] relative to the mask dimensions, a brush radius in pixels,
/// and a polarity. Strokes are immutable once created; a stroke sequence is
/// replayed in order to rebuild a mask deterministically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrushStroke {
    pub points: Vec<[f32; 2]>,
    pub radius: f32,
    /// Subtractive strokes paint black (deselect) instead of white.
    pub erase: bool,
}

impl BrushStroke {
    pub fn new(points: Vec<[f32; 2]>, radius: f32, erase: bool) -> Self {
        BrushStroke {
            points,
            radius,
            erase,
        }
    }
}

/// Rasterize a stroke sequence into a mask, replaying strokes in input
/// order. Each stroke is drawn as a round-capped, round-joined path of
/// width 2×radius: every segment is a filled capsule, so caps and joins
/// fall out of the distance test. Identical stroke sequences always produce
/// byte-identical masks.
pub fn rasterize(strokes: &[BrushStroke], width: u32, height: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for stroke in strokes {
        let value = if stroke.erase { 0u8 } else { 255u8 };
        let radius = stroke.radius.max(0.5);
        match stroke.points.len() {
            0 => {}
            1 => {
                let p = denorm(stroke.points[0], width, height);
                stamp_capsule(&mut mask, p, p, radius, value);
            }
            _ => {
                for pair in stroke.points.windows(2) {
                    let a = denorm(pair[0], width, height);
                    let b = denorm(pair[1], width, height);
                    stamp_capsule(&mut mask, a, b, radius, value);
                }
            }
        }
    }
    mask
}

#[inline]
fn denorm(p: [f32; 2], width: u32, height: u32) -> (f32, f32) {
    (p[0] * width as f32, p[1] * height as f32)
}

/// Fill every pixel within `radius` of segment a–b.
fn stamp_capsule(mask: &mut GrayImage, a: (f32, f32), b: (f32, f32), radius: f32, value: u8) {
    let (w, h) = mask.dimensions();
    let min_x = (a.0.min(b.0) - radius).floor().max(0.0) as u32;
    let max_x = ((a.0.max(b.0) + radius).ceil() as i64).min(w as i64 - 1);
    let min_y = (a.1.min(b.1) - radius).floor().max(0.0) as u32;
    let max_y = ((a.1.max(b.1) + radius).ceil() as i64).min(h as i64 - 1);
    if max_x < 0 || max_y < 0 {
        return;
    }

    let r2 = radius * radius;
    let ab = (b.0 - a.0, b.1 - a.1);
    let ab_len2 = ab.0 * ab.0 + ab.1 * ab.1;

    for y in min_y..=max_y as u32 {
        for x in min_x..=max_x as u32 {
            // Sample at the pixel center
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;
            let ap = (px - a.0, py - a.1);
            let t = if ab_len2 <= f32::EPSILON {
                0.0
            } else {
                ((ap.0 * ab.0 + ap.1 * ab.1) / ab_len2).clamp(0.0, 1.0)
            };
            let dx = px - (a.0 + ab.0 * t);
            let dy = py - (a.1 + ab.1 * t);
            if dx * dx + dy * dy <= r2 {
                mask.put_pixel(x, y, Luma([value]));
            }
        }
    }
}

// -- Bounds -------------------------------------------------------------

/// Axis-aligned box with inclusive pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl Rect {
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    #[inline]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// Minimal box containing every pixel whose intensity exceeds `threshold`,
/// or None when no pixel does.
pub fn bounds(mask: &GrayImage, threshold: u8) -> Option<Rect> {
    let (w, h) = mask.dimensions();
    let mut min_x = w;
    let mut min_y = h;
    let mut max_x = 0u32;
    let mut max_y = 0u32;
    let mut found = false;

    for (y, row) in mask.rows().enumerate() {
        for (x, pixel) in row.enumerate() {
            if pixel[0] > threshold {
                found = true;
                min_x = min_x.min(x as u32);
                min_y = min_y.min(y as u32);
                max_x = max_x.max(x as u32);
                max_y = max_y.max(y as u32);
            }
        }
    }

    found.then_some(Rect {
        min_x,
        min_y,
        max_x,
        max_y,
    })
}

/// Grow a box by `margin` pixels per side, clamped to the buffer bounds.
pub fn expand(rect: Rect, margin: u32, width: u32, height: u32) -> Rect {
    Rect {
        min_x: rect.min_x.saturating_sub(margin),
        min_y: rect.min_y.saturating_sub(margin),
        max_x: (rect.max_x + margin).min(width.saturating_sub(1)),
        max_y: (rect.max_y + margin).min(height.saturating_sub(1)),
    }
}

/// Centroid of all above-threshold pixels, normalized to [0,1]×[0,1].
/// None when nothing is selected.
pub fn centroid(mask: &GrayImage, threshold: u8) -> Option<(f32, f32)> {
    let (w, h) = mask.dimensions();
    let mut sum_x: u64 = 0;
    let mut sum_y: u64 = 0;
    let mut count: u64 = 0;

    for (y, row) in mask.rows().enumerate() {
        for (x, pixel) in row.enumerate() {
            if pixel[0] > threshold {
                sum_x += x as u64;
                sum_y += y as u64;
                count += 1;
            }
        }
    }

    if count == 0 {
        return None;
    }
    Some((
        sum_x as f32 / count as f32 / w as f32,
        sum_y as f32 / count as f32 / h as f32,
    ))
}

/// Zero every candidate-mask pixel outside the rough mask's expanded bounds,
/// suppressing segmentation bleed beyond the user's gesture. Pixels above the
/// high-confidence band survive regardless. An empty rough mask yields an
/// all-zero result whatever the candidate contains.
pub fn constrain(candidate: &GrayImage, rough: &GrayImage, margin: u32) -> GrayImage {
    let (w, h) = candidate.dimensions();
    let Some(rough_bounds) = bounds(rough, MASK_THRESHOLD) else {
        return GrayImage::new(w, h);
    };
    let keep = expand(rough_bounds, margin, w, h);

    let mut out = GrayImage::new(w, h);
    for (y, row) in candidate.rows().enumerate() {
        for (x, pixel) in row.enumerate() {
            let v = pixel[0];
            let kept = if keep.contains(x as u32, y as u32) {
                v
            } else if v > HIGH_CONFIDENCE {
                v
            } else {
                0
            };
            out.put_pixel(x as u32, y as u32, Luma([kept]));
        }
    }
    out
}

// -- Blending -----------------------------------------------------------

/// Monotonic map from mask intensity to blend weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeightCurve {
    exponent: f32,
}

impl WeightCurve {
    /// Straight alpha.
    pub const LINEAR: WeightCurve = WeightCurve { exponent: 1.0 };
    /// w^1.5 — softens edges while keeping the confident interior fully
    /// replaced (inpainting blend).
    pub const SOFT: WeightCurve = WeightCurve { exponent: 1.5 };
    /// w^0.5 — wide feather that favours the overlay early.
    pub const FEATHER: WeightCurve = WeightCurve { exponent: 0.5 };

    #[inline]
    pub fn apply(&self, w: f32) -> f32 {
        if self.exponent == 1.0 {
            w
        } else {
            w.powf(self.exponent)
        }
    }
}

/// Per-pixel composite: `overlay×weight + base×(1−weight)` per channel,
/// where weight = curve(mask/255). Pixels under a small epsilon weight are
/// copied from `base` verbatim. All three buffers must share dimensions.
pub fn blend(
    base: &RgbaImage,
    overlay: &RgbaImage,
    mask: &GrayImage,
    curve: WeightCurve,
) -> RgbaImage {
    assert_eq!(base.dimensions(), overlay.dimensions(), "blend size mismatch");
    assert_eq!(base.dimensions(), mask.dimensions(), "blend mask mismatch");
    let (w, h) = base.dimensions();

    let mut out = RgbaImage::new(w, h);
    out.par_chunks_mut(4 * w as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let y = y as u32;
            for x in 0..w {
                let weight = curve.apply(mask.get_pixel(x, y)[0] as f32 / 255.0);
                let b = base.get_pixel(x, y);
                let idx = (x * 4) as usize;
                if weight < WEIGHT_EPSILON {
                    row[idx..idx + 4].copy_from_slice(&b.0);
                    continue;
                }
                let o = overlay.get_pixel(x, y);
                for c in 0..4 {
                    let v = o[c] as f32 * weight + b[c] as f32 * (1.0 - weight);
                    row[idx + c] = v.round().clamp(0.0, 255.0) as u8;
                }
            }
        });
    out
}

/// Separable box-blur softening pass for masks, used before feeding a mask
/// to the inpainting model so hard stroke edges do not leave visible seams.
pub fn feather(mask: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    let (w, h) = mask.dimensions();
    let r = radius as i32;

    // Horizontal pass
    let mut temp = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0.0f32;
            let mut count = 0.0f32;
            for dx in -r..=r {
                let nx = (x as i32 + dx).clamp(0, w as i32 - 1) as u32;
                sum += mask.get_pixel(nx, y)[0] as f32;
                count += 1.0;
            }
            temp.put_pixel(x, y, Luma([(sum / count) as u8]));
        }
    }

    // Vertical pass
    let mut result = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut sum = 0.0f32;
            let mut count = 0.0f32;
            for dy in -r..=r {
                let ny = (y as i32 + dy).clamp(0, h as i32 - 1) as u32;
                sum += temp.get_pixel(x, ny)[0] as f32;
                count += 1.0;
            }
            result.put_pixel(x, y, Luma([(sum / count) as u8]));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use proptest::prelude::*;

    fn filled_square(w: u32, h: u32, rect: Rect, value: u8) -> GrayImage {
        let mut m = GrayImage::new(w, h);
        for y in rect.min_y..=rect.max_y {
            for x in rect.min_x..=rect.max_x {
                m.put_pixel(x, y, Luma([value]));
            }
        }
        m
    }

    #[test]
    fn rasterize_is_deterministic() {
        let strokes = vec![
            BrushStroke::new(vec![[0.1, 0.1], [0.6, 0.4], [0.9, 0.9]], 12.0, false),
            BrushStroke::new(vec![[0.5, 0.5], [0.5, 0.8]], 6.0, true),
        ];
        let a = rasterize(&strokes, 200, 160);
        let b = rasterize(&strokes, 200, 160);
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn rasterize_order_matters_for_overlapping_polarity() {
        let add = BrushStroke::new(vec![[0.5, 0.5]], 20.0, false);
        let sub = BrushStroke::new(vec![[0.5, 0.5]], 20.0, true);
        let add_then_sub = rasterize(&[add.clone(), sub.clone()], 100, 100);
        let sub_then_add = rasterize(&[sub, add], 100, 100);
        assert_eq!(add_then_sub.get_pixel(50, 50)[0], 0);
        assert_eq!(sub_then_add.get_pixel(50, 50)[0], 255);
    }

    #[test]
    fn single_point_stroke_paints_a_disc() {
        let mask = rasterize(&[BrushStroke::new(vec![[0.5, 0.5]], 10.0, false)], 100, 100);
        assert_eq!(mask.get_pixel(50, 50)[0], 255);
        assert_eq!(mask.get_pixel(50, 42)[0], 255);
        assert_eq!(mask.get_pixel(50, 70)[0], 0);
        assert_eq!(mask.get_pixel(5, 5)[0], 0);
    }

    #[test]
    fn bounds_none_iff_all_below_threshold() {
        let empty = GrayImage::new(40, 40);
        assert_eq!(bounds(&empty, MASK_THRESHOLD), None);
        let faint = GrayImage::from_pixel(40, 40, Luma([MASK_THRESHOLD]));
        assert_eq!(bounds(&faint, MASK_THRESHOLD), None);
    }

    #[test]
    fn bounds_is_minimal() {
        let rect = Rect {
            min_x: 7,
            min_y: 3,
            max_x: 19,
            max_y: 12,
        };
        let mask = filled_square(40, 40, rect, 200);
        assert_eq!(bounds(&mask, MASK_THRESHOLD), Some(rect));
    }

    #[test]
    fn expand_clamps_to_buffer() {
        let r = Rect {
            min_x: 5,
            min_y: 5,
            max_x: 90,
            max_y: 90,
        };
        let e = expand(r, 20, 100, 100);
        assert_eq!(
            e,
            Rect {
                min_x: 0,
                min_y: 0,
                max_x: 99,
                max_y: 99
            }
        );
    }

    #[test]
    fn constrain_with_empty_rough_is_all_zero() {
        let candidate = GrayImage::from_pixel(30, 30, Luma([255]));
        let rough = GrayImage::new(30, 30);
        let out = constrain(&candidate, &rough, 20);
        assert!(out.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn constrain_zeroes_outside_expanded_box() {
        // The end-to-end scenario: a 50×50 above-threshold square in a
        // 500×500 image, margin 20 → exactly a 90×90 keep box.
        let square = Rect {
            min_x: 100,
            min_y: 100,
            max_x: 149,
            max_y: 149,
        };
        let rough = filled_square(500, 500, square, 255);
        assert_eq!(bounds(&rough, MASK_THRESHOLD), Some(square));

        let candidate = GrayImage::from_pixel(500, 500, Luma([128]));
        let out = constrain(&candidate, &rough, 20);

        let keep = expand(square, 20, 500, 500);
        assert_eq!(keep.width(), 90);
        assert_eq!(keep.height(), 90);
        for (x, y, p) in out.enumerate_pixels() {
            if keep.contains(x, y) {
                assert_eq!(p[0], 128);
            } else {
                assert_eq!(p[0], 0, "pixel ({},{}) outside box survived", x, y);
            }
        }
    }

    #[test]
    fn constrain_keeps_high_confidence_outside_box() {
        let square = Rect {
            min_x: 10,
            min_y: 10,
            max_x: 19,
            max_y: 19,
        };
        let rough = filled_square(100, 100, square, 255);
        let mut candidate = GrayImage::new(100, 100);
        candidate.put_pixel(80, 80, Luma([250]));
        candidate.put_pixel(85, 85, Luma([200]));
        let out = constrain(&candidate, &rough, 20);
        assert_eq!(out.get_pixel(80, 80)[0], 250);
        assert_eq!(out.get_pixel(85, 85)[0], 0);
    }

    #[test]
    fn blend_extremes() {
        let base = RgbaImage::from_pixel(8, 8, Rgba([10, 20, 30, 255]));
        let overlay = RgbaImage::from_pixel(8, 8, Rgba([200, 100, 50, 255]));

        let full = GrayImage::from_pixel(8, 8, Luma([255]));
        let out = blend(&base, &overlay, &full, WeightCurve::SOFT);
        assert!(out.pixels().all(|p| *p == Rgba([200, 100, 50, 255])));

        let none = GrayImage::new(8, 8);
        let out = blend(&base, &overlay, &none, WeightCurve::SOFT);
        assert!(out.pixels().all(|p| *p == Rgba([10, 20, 30, 255])));
    }

    #[test]
    fn blend_midpoint_follows_curve() {
        let base = RgbaImage::from_pixel(1, 1, Rgba([0, 0, 0, 255]));
        let overlay = RgbaImage::from_pixel(1, 1, Rgba([255, 255, 255, 255]));
        let half = GrayImage::from_pixel(1, 1, Luma([128]));

        let linear = blend(&base, &overlay, &half, WeightCurve::LINEAR);
        assert_eq!(linear.get_pixel(0, 0)[0], 128);

        let soft = blend(&base, &overlay, &half, WeightCurve::SOFT);
        let expected = ((128.0f32 / 255.0).powf(1.5) * 255.0).round() as u8;
        assert_eq!(soft.get_pixel(0, 0)[0], expected);
    }

    #[test]
    fn feather_spreads_edges_and_preserves_interior() {
        let square = Rect {
            min_x: 20,
            min_y: 20,
            max_x: 43,
            max_y: 43,
        };
        let mask = filled_square(64, 64, square, 255);
        let soft = feather(&mask, 4);
        // Deep interior stays saturated, just outside the edge is now gray
        assert_eq!(soft.get_pixel(31, 31)[0], 255);
        let outside = soft.get_pixel(45, 31)[0];
        assert!(outside > 0 && outside < 255);
    }

    proptest! {
        #[test]
        fn rasterize_deterministic_for_any_strokes(
            points in proptest::collection::vec((0.0f32..1.0, 0.0f32..1.0), 1..8),
            radius in 1.0f32..20.0,
            erase in any::<bool>(),
        ) {
            let stroke = BrushStroke::new(
                points.iter().map(|&(x, y)| [x, y]).collect(),
                radius,
                erase,
            );
            let a = rasterize(std::slice::from_ref(&stroke), 64, 48);
            let b = rasterize(std::slice::from_ref(&stroke), 64, 48);
            prop_assert_eq!(a.as_raw(), b.as_raw());
        }

        #[test]
        fn bounds_contains_all_selected_pixels(
            xs in proptest::collection::vec((0u32..32, 0u32..32), 1..10)
        ) {
            let mut mask = GrayImage::new(32, 32);
            for &(x, y) in &xs {
                mask.put_pixel(x, y, Luma([255]));
            }
            let b = bounds(&mask, MASK_THRESHOLD).unwrap();
            for &(x, y) in &xs {
                prop_assert!(b.contains(x, y));
            }
        }
    }
}
