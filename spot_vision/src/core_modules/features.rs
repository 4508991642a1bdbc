// THEORY:
// The two instantaneous signals that feed every occupancy decision. Both are
// pure functions of their input crops: no state, no randomness, and the same
// bytes in always give the same number out.
//
// 1.  **Edge ratio**: parked vehicles add texture (panel seams, windows, wheel
//     arches) to what is usually a flat patch of asphalt. The crop goes through
//     Canny, which smooths it once with its own Gaussian (sigma 1.4, close to a
//     5×5 kernel), is thickened by one 3×3 dilation so broken contours count
//     consistently, and the fraction of edge pixels is reported. No extra
//     blur is applied beforehand: two passes would erase thin lane paint. The engine
//     compares it against the same measurement on the empty-lot baseline.
// 2.  **Shadow-robust difference**: a per-pixel comparison against the baseline
//     crop in HSV space. Each crop's value channel is histogram-equalized on
//     its own so a global brightness shift does not register, then hue and
//     saturation differences dominate a weighted mix while value only counts
//     for a tenth. The mix is binarized, cleaned with a 3×3 median and the
//     changed fraction is reported.

use image::{GrayImage, Luma, RgbImage};
use imageproc::contrast::equalize_histogram;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::median_filter;
use imageproc::morphology::dilate;

use crate::core_modules::pixel::pixel::{HsvPixel, hue_distance};
use crate::error::{SpotError, SpotResult};

pub const HUE_WEIGHT: f32 = 0.45;
pub const SATURATION_WEIGHT: f32 = 0.45;
pub const VALUE_WEIGHT: f32 = 0.10;

const MASK_ON: u8 = 255;

/// One frame's measurements for one region.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawSignal {
    /// Fraction of edge pixels in the aligned grayscale crop, in [0, 1].
    pub edge_ratio: f64,
    /// Fraction of pixels that differ from the baseline crop, in [0, 1].
    pub diff_ratio: f64,
}

/// Fraction of pixels classified as edges after Canny (with its built-in
/// smoothing) and one 3×3 dilation.
///
/// A zero-area crop yields 0, and so do inverted thresholds (`low > high`) or
/// thresholds that are not numbers.
pub fn edge_ratio(gray_crop: &GrayImage, low: f32, high: f32) -> f64 {
    let (width, height) = gray_crop.dimensions();
    if width == 0 || height == 0 || !(low <= high) {
        return 0.0;
    }

    let edges = canny(gray_crop, low, high);
    let dilated = dilate(&edges, Norm::LInf, 1);

    nonzero_fraction(&dilated)
}

/// Fraction of pixels whose weighted HSV difference from the baseline crop
/// exceeds `pixel_threshold`, after a 3×3 median clean-up.
///
/// Both crops must have the same dimensions. A zero-area pair yields 0.
pub fn shadow_robust_diff_ratio(
    color_crop: &RgbImage,
    baseline_crop: &RgbImage,
    pixel_threshold: f32,
) -> SpotResult<f64> {
    if color_crop.dimensions() != baseline_crop.dimensions() {
        let (left_width, left_height) = color_crop.dimensions();
        let (right_width, right_height) = baseline_crop.dimensions();
        return Err(SpotError::CropPairMismatch {
            left_width,
            left_height,
            right_width,
            right_height,
        });
    }
    let (width, height) = color_crop.dimensions();
    if width == 0 || height == 0 {
        return Ok(0.0);
    }

    let current = HsvPlanes::from_rgb(color_crop);
    let baseline = HsvPlanes::from_rgb(baseline_crop);
    let current_value = equalize_histogram(&current.value);
    let baseline_value = equalize_histogram(&baseline.value);

    let mut mask = GrayImage::new(width, height);
    for (x, y, out) in mask.enumerate_pixels_mut() {
        let hue_delta = hue_distance(current.hue.get_pixel(x, y).0[0], baseline.hue.get_pixel(x, y).0[0]);
        let saturation_delta = current
            .saturation
            .get_pixel(x, y)
            .0[0]
            .abs_diff(baseline.saturation.get_pixel(x, y).0[0]);
        let value_delta = current_value
            .get_pixel(x, y)
            .0[0]
            .abs_diff(baseline_value.get_pixel(x, y).0[0]);

        let mixed = HUE_WEIGHT * hue_delta as f32
            + SATURATION_WEIGHT * saturation_delta as f32
            + VALUE_WEIGHT * value_delta as f32;

        if mixed > pixel_threshold {
            *out = Luma([MASK_ON]);
        }
    }

    let cleaned = median_filter(&mask, 1, 1);
    Ok(nonzero_fraction(&cleaned))
}

fn nonzero_fraction(mask: &GrayImage) -> f64 {
    let total = mask.width() as u64 * mask.height() as u64;
    if total == 0 {
        return 0.0;
    }
    let count = mask.pixels().filter(|p| p.0[0] != 0).count() as u64;
    count as f64 / total as f64
}

/// Per-channel planes of an RGB crop converted to 8-bit HSV.
struct HsvPlanes {
    hue: GrayImage,
    saturation: GrayImage,
    value: GrayImage,
}

impl HsvPlanes {
    fn from_rgb(crop: &RgbImage) -> Self {
        let (width, height) = crop.dimensions();
        let mut hue = GrayImage::new(width, height);
        let mut saturation = GrayImage::new(width, height);
        let mut value = GrayImage::new(width, height);
        for (x, y, pixel) in crop.enumerate_pixels() {
            let hsv = HsvPixel::from_rgb(pixel);
            hue.put_pixel(x, y, Luma([hsv.hue]));
            saturation.put_pixel(x, y, Luma([hsv.saturation]));
            value.put_pixel(x, y, Luma([hsv.value]));
        }
        Self {
            hue,
            saturation,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    const THRESHOLD: f32 = 20.0;

    #[test]
    fn zero_area_crops_yield_zero() {
        assert_eq!(edge_ratio(&GrayImage::new(0, 0), 60.0, 180.0), 0.0);
        assert_eq!(edge_ratio(&GrayImage::new(5, 0), 60.0, 180.0), 0.0);
        let empty = RgbImage::new(0, 4);
        assert_eq!(shadow_robust_diff_ratio(&empty, &empty, THRESHOLD).unwrap(), 0.0);
    }

    #[test]
    fn flat_crop_has_no_edges() {
        let flat = GrayImage::from_pixel(32, 32, Luma([90]));
        assert_eq!(edge_ratio(&flat, 60.0, 180.0), 0.0);
    }

    #[test]
    fn square_outline_produces_edges() {
        let mut crop = GrayImage::from_pixel(40, 40, Luma([20]));
        for y in 12..28 {
            for x in 12..28 {
                crop.put_pixel(x, y, Luma([230]));
            }
        }
        let ratio = edge_ratio(&crop, 60.0, 180.0);
        assert!(ratio > 0.05, "expected visible edge content, got {ratio}");
        assert!(ratio < 1.0);
    }

    fn line_crop(thickness: u32, contrast: u8) -> GrayImage {
        let mut crop = GrayImage::from_pixel(40, 40, Luma([60]));
        for y in 0..40 {
            for x in 19..19 + thickness {
                crop.put_pixel(x, y, Luma([60 + contrast]));
            }
        }
        crop
    }

    #[test]
    fn thin_paint_lines_produce_edges() {
        for (thickness, contrast) in [(2, 120), (3, 120), (2, 160)] {
            let ratio = edge_ratio(&line_crop(thickness, contrast), 60.0, 180.0);
            assert!(ratio > 0.05, "{thickness} px line at contrast {contrast} gave {ratio}");
        }
    }

    #[test]
    fn inverted_thresholds_yield_zero() {
        let crop = line_crop(2, 160);
        assert_eq!(edge_ratio(&crop, 180.0, 60.0), 0.0);
        assert_eq!(edge_ratio(&crop, f32::NAN, 60.0), 0.0);
    }

    #[test]
    fn identical_crops_have_zero_difference() {
        let mut crop = RgbImage::from_pixel(24, 24, Rgb([120, 110, 100]));
        crop.put_pixel(3, 3, Rgb([10, 200, 30]));
        assert_eq!(shadow_robust_diff_ratio(&crop, &crop.clone(), THRESHOLD).unwrap(), 0.0);
    }

    #[test]
    fn colored_object_on_gray_background_is_detected() {
        let baseline = RgbImage::from_pixel(24, 24, Rgb([128, 128, 128]));
        let frame = RgbImage::from_pixel(24, 24, Rgb([200, 30, 30]));
        let ratio = shadow_robust_diff_ratio(&frame, &baseline, THRESHOLD).unwrap();
        assert!(ratio > 0.99, "expected almost every pixel to differ, got {ratio}");
    }

    #[test]
    fn uniform_darkening_is_ignored() {
        let baseline = RgbImage::from_pixel(24, 24, Rgb([180, 150, 120]));
        let shaded = RgbImage::from_pixel(24, 24, Rgb([90, 75, 60]));
        let ratio = shadow_robust_diff_ratio(&shaded, &baseline, THRESHOLD).unwrap();
        assert_eq!(ratio, 0.0);
    }

    #[test]
    fn mismatched_crops_are_rejected() {
        let a = RgbImage::new(4, 4);
        let b = RgbImage::new(4, 5);
        assert!(matches!(
            shadow_robust_diff_ratio(&a, &b, THRESHOLD),
            Err(SpotError::CropPairMismatch { .. })
        ));
    }
}
