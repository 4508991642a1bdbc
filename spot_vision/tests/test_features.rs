// tests/test_features.rs: Determinism and monotonicity of the region signals.

use image::{GrayImage, Luma, Rgb, RgbImage};
use spot_vision::core_modules::features::{edge_ratio, shadow_robust_diff_ratio};

const LOW: f32 = 60.0;
const HIGH: f32 = 180.0;
const PIXEL_THRESHOLD: f32 = 20.0;

fn asphalt(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let n = ((x * 31 + y * 17) % 9) as u8;
        Rgb([96 + n, 98 + n, 104 + n])
    })
}

/// Paints the first `rows` rows of the crop with a saturated color.
fn with_object_rows(base: &RgbImage, rows: u32) -> RgbImage {
    let mut out = base.clone();
    for y in 0..rows.min(base.height()) {
        for x in 0..base.width() {
            out.put_pixel(x, y, Rgb([210, 40, 35]));
        }
    }
    out
}

/// Adds `bars` bright vertical bars, 3 px wide and 8 px apart.
fn with_bars(bars: u32) -> GrayImage {
    let mut img = GrayImage::from_pixel(64, 40, Luma([40]));
    for bar in 0..bars {
        let x0 = 4 + bar * 8;
        for y in 4..36 {
            for x in x0..x0 + 3 {
                img.put_pixel(x, y, Luma([220]));
            }
        }
    }
    img
}

// ===== Determinism =====

#[test]
fn signals_are_bit_reproducible() {
    let baseline = asphalt(48, 32);
    let frame = with_object_rows(&baseline, 11);
    let gray = with_bars(4);

    let diff_first = shadow_robust_diff_ratio(&frame, &baseline, PIXEL_THRESHOLD).unwrap();
    let edge_first = edge_ratio(&gray, LOW, HIGH);
    for _ in 0..5 {
        let diff = shadow_robust_diff_ratio(&frame, &baseline, PIXEL_THRESHOLD).unwrap();
        let edge = edge_ratio(&gray, LOW, HIGH);
        assert_eq!(diff.to_bits(), diff_first.to_bits());
        assert_eq!(edge.to_bits(), edge_first.to_bits());
    }
}

// ===== Monotonicity =====

#[test]
fn diff_ratio_grows_with_changed_area() {
    let baseline = asphalt(48, 32);
    let mut previous = shadow_robust_diff_ratio(&baseline, &baseline, PIXEL_THRESHOLD).unwrap();
    assert_eq!(previous, 0.0);

    for rows in [2, 4, 8, 12, 16, 24, 32] {
        let frame = with_object_rows(&baseline, rows);
        let ratio = shadow_robust_diff_ratio(&frame, &baseline, PIXEL_THRESHOLD).unwrap();
        assert!(
            ratio >= previous,
            "diff ratio dropped from {previous} to {ratio} at {rows} rows"
        );
        previous = ratio;
    }
    assert!(previous > 0.95, "fully covered crop should read as changed, got {previous}");
}

#[test]
fn diff_ratio_grows_with_color_divergence() {
    let baseline = RgbImage::from_pixel(32, 32, Rgb([120, 120, 120]));
    let mut previous = 0.0;
    for saturation_step in [0u8, 10, 20, 40, 80, 120] {
        let mut frame = baseline.clone();
        for y in 8..24 {
            for x in 8..24 {
                frame.put_pixel(x, y, Rgb([120, 120, 120 - saturation_step / 2]));
            }
        }
        let ratio = shadow_robust_diff_ratio(&frame, &baseline, PIXEL_THRESHOLD).unwrap();
        assert!(ratio >= previous, "ratio fell to {ratio} at step {saturation_step}");
        previous = ratio;
    }
    assert!(previous > 0.0);
}

#[test]
fn edge_ratio_grows_with_texture() {
    let mut previous = edge_ratio(&with_bars(0), LOW, HIGH);
    assert_eq!(previous, 0.0);
    for bars in 1..=6 {
        let ratio = edge_ratio(&with_bars(bars), LOW, HIGH);
        assert!(ratio > previous, "{bars} bars gave {ratio}, not above {previous}");
        previous = ratio;
    }
}

#[test]
fn signals_stay_within_unit_interval() {
    let baseline = asphalt(20, 20);
    let frame = RgbImage::from_pixel(20, 20, Rgb([0, 255, 0]));
    let diff = shadow_robust_diff_ratio(&frame, &baseline, PIXEL_THRESHOLD).unwrap();
    assert!((0.0..=1.0).contains(&diff));

    let noisy = GrayImage::from_fn(20, 20, |x, y| Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]));
    let edges = edge_ratio(&noisy, LOW, HIGH);
    assert!((0.0..=1.0).contains(&edges));
}
