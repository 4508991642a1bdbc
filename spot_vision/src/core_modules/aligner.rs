// THEORY:
// Fixed cameras still move a little: wind, vibration, a mount settling over the
// day. A one-pixel shift is enough to light up every painted line in a spot as
// "changed", so each grayscale frame is pulled back onto the baseline's
// coordinate frame before any region is measured.
//
// The model is a similarity transform (rotation, uniform scale, translation),
// estimated by Gauss-Newton on intensity gradients:
// - Both images are reduced to zero-mean, unit-norm signals so a change in
//   exposure does not bias the fit. The objective is their normalized
//   correlation and the loop stops once an iteration moves it by less than
//   `epsilon`, or after `max_iterations`.
// - Parameters are expressed around the image center so rotation/scale and
//   translation have comparable leverage in the normal equations.
// - Estimation runs coarse-to-fine over a box-filtered pyramid; translations
//   double at each finer level.
// - The frame is resampled bilinearly through the estimate with border pixels
//   replicated.
//
// Alignment is best effort. Any failure (flat input, singular system,
// divergence, or a result that correlates worse than doing nothing) makes the
// aligner hand back the input frame untouched. It never returns an error.

use image::{GrayImage, Luma};
use log::debug;
use thiserror::Error;

use crate::config::AlignmentConfig;

/// Smallest pyramid side we are willing to optimize on.
const MIN_LEVEL_SIZE: usize = 32;
/// Variance (in squared gray levels) below which an image carries no gradient signal.
const FLAT_VARIANCE: f64 = 1e-6;
/// Relative pivot size below which the normal equations count as singular.
const SINGULAR_PIVOT: f64 = 1e-9;
/// Largest plausible |scale - 1| and |sin(rotation) * scale| for camera jitter.
const MAX_LINEAR_TERM: f64 = 0.5;

/// A similarity transform in pixel coordinates:
/// `x' = (1 + a)·x − b·y + tx`, `y' = b·x + (1 + a)·y + ty`.
///
/// It maps baseline coordinates to frame coordinates, so the aligned image at
/// `(x, y)` is the frame sampled at `map(x, y)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f64,
    pub b: f64,
    pub tx: f64,
    pub ty: f64,
}

impl SimilarityTransform {
    pub fn identity() -> Self {
        Self {
            a: 0.0,
            b: 0.0,
            tx: 0.0,
            ty: 0.0,
        }
    }

    pub fn scale(&self) -> f64 {
        ((1.0 + self.a).powi(2) + self.b.powi(2)).sqrt()
    }

    pub fn rotation_radians(&self) -> f64 {
        self.b.atan2(1.0 + self.a)
    }

    pub fn map(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (1.0 + self.a) * x - self.b * y + self.tx,
            self.b * x + (1.0 + self.a) * y + self.ty,
        )
    }
}

/// Why an alignment attempt fell back to the unmodified frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AlignFailure {
    #[error("alignment disabled")]
    Disabled,
    #[error("frame and baseline differ in size")]
    SizeMismatch,
    #[error("frame or baseline has no intensity variation")]
    FlatImage,
    #[error("gradient system is singular")]
    Singular,
    #[error("optimizer diverged")]
    Diverged,
    #[error("estimate correlates worse than the identity")]
    NotImproved,
}

/// Result of one alignment attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlignmentOutcome {
    Aligned(SimilarityTransform),
    Fallback(AlignFailure),
}

impl AlignmentOutcome {
    pub fn is_aligned(&self) -> bool {
        matches!(self, AlignmentOutcome::Aligned(_))
    }
}

/// Estimates and applies frame-to-baseline similarity transforms.
#[derive(Debug, Clone)]
pub struct FrameAligner {
    config: AlignmentConfig,
}

impl FrameAligner {
    pub fn new(config: AlignmentConfig) -> Self {
        Self { config }
    }

    /// Returns `gray_frame` resampled into the baseline's coordinate frame, or an
    /// unmodified copy when alignment is not possible.
    pub fn align(&self, gray_frame: &GrayImage, gray_baseline: &GrayImage) -> GrayImage {
        self.align_with_outcome(gray_frame, gray_baseline).0
    }

    /// Like [`FrameAligner::align`], also reporting what happened.
    pub fn align_with_outcome(
        &self,
        gray_frame: &GrayImage,
        gray_baseline: &GrayImage,
    ) -> (GrayImage, AlignmentOutcome) {
        match self.estimate(gray_frame, gray_baseline) {
            Ok(transform) => (
                warp_replicate(gray_frame, &transform),
                AlignmentOutcome::Aligned(transform),
            ),
            Err(failure) => {
                debug!("alignment fell back to the raw frame: {failure}");
                (gray_frame.clone(), AlignmentOutcome::Fallback(failure))
            }
        }
    }

    /// Estimates the transform mapping baseline coordinates into `gray_frame`.
    pub fn estimate(
        &self,
        gray_frame: &GrayImage,
        gray_baseline: &GrayImage,
    ) -> Result<SimilarityTransform, AlignFailure> {
        if !self.config.enabled {
            return Err(AlignFailure::Disabled);
        }
        if gray_frame.dimensions() != gray_baseline.dimensions() {
            return Err(AlignFailure::SizeMismatch);
        }

        let frame = Plane::from_gray(gray_frame);
        let template = Plane::from_gray(gray_baseline);
        if frame.is_empty() || frame.variance() < FLAT_VARIANCE || template.variance() < FLAT_VARIANCE
        {
            return Err(AlignFailure::FlatImage);
        }

        let frame_pyramid = build_pyramid(frame, self.config.pyramid_levels as usize);
        let template_pyramid = build_pyramid(template, frame_pyramid.len());

        let mut params = [0.0f64; 4];
        for level in (0..frame_pyramid.len()).rev() {
            if level + 1 < frame_pyramid.len() {
                params[2] *= 2.0;
                params[3] *= 2.0;
            }
            self.refine_level(&frame_pyramid[level], &template_pyramid[level], &mut params)?;
        }

        let full_frame = &frame_pyramid[0];
        let full_template = &template_pyramid[0];
        let identity_score = correlation(full_frame, full_template, &[0.0; 4]);
        let aligned_score = correlation(full_frame, full_template, &params);
        match (identity_score, aligned_score) {
            (Some(before), Some(after)) if after + 1e-9 >= before => {
                Ok(to_pixel_transform(&params, full_frame))
            }
            (Some(_), Some(_)) => Err(AlignFailure::NotImproved),
            _ => Err(AlignFailure::FlatImage),
        }
    }

    /// Gauss-Newton iterations on one pyramid level. `params` holds
    /// `[a, b, tx, ty]` around the level's center.
    fn refine_level(
        &self,
        frame: &Plane,
        template: &Plane,
        params: &mut [f64; 4],
    ) -> Result<(), AlignFailure> {
        let normalized_template = template.normalized().ok_or(AlignFailure::FlatImage)?;
        let (grad_x, grad_y) = frame.gradients();
        let (cx, cy) = frame.center();
        let count = frame.data.len();

        let mut warped = vec![0.0f32; count];
        let mut jacobians = vec![[0.0f64; 4]; count];
        let mut previous_score: Option<f64> = None;

        for _ in 0..self.config.max_iterations {
            let mut sum = 0.0f64;
            let mut sum_sq = 0.0f64;
            for y in 0..frame.height {
                for x in 0..frame.width {
                    let idx = y * frame.width + x;
                    let xc = x as f64 - cx;
                    let yc = y as f64 - cy;
                    let (u, v) = centered_map(params, xc, yc, cx, cy);
                    let value = frame.sample(u, v);
                    let gx = grad_x.sample(u, v) as f64;
                    let gy = grad_y.sample(u, v) as f64;
                    warped[idx] = value;
                    jacobians[idx] = [gx * xc + gy * yc, gy * xc - gx * yc, gx, gy];
                    sum += value as f64;
                    sum_sq += (value as f64) * (value as f64);
                }
            }

            let mean = sum / count as f64;
            let norm = (sum_sq - sum * mean).max(0.0).sqrt();
            if norm < FLAT_VARIANCE.sqrt() * (count as f64).sqrt() {
                return Err(AlignFailure::FlatImage);
            }

            let mut score = 0.0f64;
            let mut jacobian_sum = [0.0f64; 4];
            let mut hessian = [[0.0f64; 4]; 4];
            let mut rhs = [0.0f64; 4];
            for idx in 0..count {
                let t = normalized_template[idx];
                let i = (warped[idx] as f64 - mean) / norm;
                score += t * i;
                let residual = t - i;
                let jac = &jacobians[idx];
                for r in 0..4 {
                    jacobian_sum[r] += jac[r];
                    rhs[r] += jac[r] * residual;
                    for c in 0..4 {
                        hessian[r][c] += jac[r] * jac[c];
                    }
                }
            }

            if let Some(previous) = previous_score {
                if (score - previous).abs() < self.config.epsilon {
                    return Ok(());
                }
            }
            previous_score = Some(score);

            // Center the Jacobian: the residual is zero-mean so only the Hessian changes.
            for r in 0..4 {
                for c in 0..4 {
                    hessian[r][c] -= jacobian_sum[r] * jacobian_sum[c] / count as f64;
                }
            }

            let delta = solve4(hessian, rhs).ok_or(AlignFailure::Singular)?;
            for k in 0..4 {
                params[k] += delta[k] * norm;
            }

            if params.iter().any(|p| !p.is_finite())
                || params[0].abs() > MAX_LINEAR_TERM
                || params[1].abs() > MAX_LINEAR_TERM
                || params[2].abs() > frame.width as f64 / 2.0
                || params[3].abs() > frame.height as f64 / 2.0
            {
                return Err(AlignFailure::Diverged);
            }
        }

        Ok(())
    }
}

/// Resamples `frame` so that output pixel `(x, y)` takes the frame value at
/// `transform.map(x, y)`, bilinearly interpolated, replicating border pixels.
pub fn warp_replicate(frame: &GrayImage, transform: &SimilarityTransform) -> GrayImage {
    let plane = Plane::from_gray(frame);
    let (width, height) = frame.dimensions();
    let mut out = GrayImage::new(width, height);
    if plane.is_empty() {
        return out;
    }
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let (u, v) = transform.map(x as f64, y as f64);
        let value = plane.sample(u, v);
        *pixel = Luma([value.round().clamp(0.0, 255.0) as u8]);
    }
    out
}

fn centered_map(params: &[f64; 4], xc: f64, yc: f64, cx: f64, cy: f64) -> (f64, f64) {
    let [a, b, tx, ty] = *params;
    (
        (1.0 + a) * xc - b * yc + cx + tx,
        b * xc + (1.0 + a) * yc + cy + ty,
    )
}

fn to_pixel_transform(params: &[f64; 4], plane: &Plane) -> SimilarityTransform {
    let [a, b, tx, ty] = *params;
    let (cx, cy) = plane.center();
    SimilarityTransform {
        a,
        b,
        tx: tx + cx - (1.0 + a) * cx + b * cy,
        ty: ty + cy - b * cx - (1.0 + a) * cy,
    }
}

/// Normalized correlation between the template and the frame warped by `params`.
fn correlation(frame: &Plane, template: &Plane, params: &[f64; 4]) -> Option<f64> {
    let normalized_template = template.normalized()?;
    let (cx, cy) = frame.center();
    let mut warped = Vec::with_capacity(frame.data.len());
    for y in 0..frame.height {
        for x in 0..frame.width {
            let (u, v) = centered_map(params, x as f64 - cx, y as f64 - cy, cx, cy);
            warped.push(frame.sample(u, v));
        }
    }
    let normalized_frame = normalize(&warped)?;
    Some(
        normalized_template
            .iter()
            .zip(normalized_frame.iter())
            .map(|(t, i)| t * i)
            .sum(),
    )
}

fn normalize(values: &[f32]) -> Option<Vec<f64>> {
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64;
    let norm = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        .sqrt();
    if norm < FLAT_VARIANCE.sqrt() * (values.len() as f64).sqrt() {
        return None;
    }
    Some(values.iter().map(|&v| (v as f64 - mean) / norm).collect())
}

/// Solves a 4×4 linear system with partial pivoting.
fn solve4(mut m: [[f64; 4]; 4], mut rhs: [f64; 4]) -> Option<[f64; 4]> {
    let scale = (0..4).map(|i| m[i][i].abs()).fold(0.0f64, f64::max);
    if !(scale > 0.0) || !scale.is_finite() {
        return None;
    }
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))?;
        if m[pivot_row][col].abs() <= SINGULAR_PIVOT * scale {
            return None;
        }
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);
        for row in (col + 1)..4 {
            let factor = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    let mut solution = [0.0f64; 4];
    for row in (0..4).rev() {
        let mut acc = rhs[row];
        for k in (row + 1)..4 {
            acc -= m[row][k] * solution[k];
        }
        solution[row] = acc / m[row][row];
    }
    solution.iter().all(|v| v.is_finite()).then_some(solution)
}

fn build_pyramid(base: Plane, requested_levels: usize) -> Vec<Plane> {
    let mut levels = vec![base];
    while levels.len() < requested_levels.max(1) {
        let Some(last) = levels.last() else { break };
        if last.width / 2 < MIN_LEVEL_SIZE || last.height / 2 < MIN_LEVEL_SIZE {
            break;
        }
        let next = last.downsample();
        levels.push(next);
    }
    levels
}

/// Row-major f32 copy of a grayscale image used by the optimizer.
#[derive(Debug, Clone)]
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(image: &GrayImage) -> Self {
        Self {
            width: image.width() as usize,
            height: image.height() as usize,
            data: image.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn center(&self) -> (f64, f64) {
        (
            (self.width as f64 - 1.0) / 2.0,
            (self.height as f64 - 1.0) / 2.0,
        )
    }

    fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    fn variance(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let n = self.data.len() as f64;
        let mean = self.data.iter().map(|&v| v as f64).sum::<f64>() / n;
        self.data.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n
    }

    fn normalized(&self) -> Option<Vec<f64>> {
        normalize(&self.data)
    }

    /// Bilinear sample, clamping coordinates to the image (replicated border).
    fn sample(&self, x: f64, y: f64) -> f32 {
        let max_x = (self.width - 1) as f64;
        let max_y = (self.height - 1) as f64;
        let x = if x.is_finite() { x.clamp(0.0, max_x) } else { 0.0 };
        let y = if y.is_finite() { y.clamp(0.0, max_y) } else { 0.0 };

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let fx = (x - x0 as f64) as f32;
        let fy = (y - y0 as f64) as f32;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);

        let p00 = self.get(x0, y0);
        let p10 = self.get(x1, y0);
        let p01 = self.get(x0, y1);
        let p11 = self.get(x1, y1);
        (1.0 - fx) * (1.0 - fy) * p00 + fx * (1.0 - fy) * p10 + (1.0 - fx) * fy * p01 + fx * fy * p11
    }

    /// Central-difference gradients with clamped borders.
    fn gradients(&self) -> (Plane, Plane) {
        let mut gx = vec![0.0f32; self.data.len()];
        let mut gy = vec![0.0f32; self.data.len()];
        for y in 0..self.height {
            let up = y.saturating_sub(1);
            let down = (y + 1).min(self.height - 1);
            for x in 0..self.width {
                let left = x.saturating_sub(1);
                let right = (x + 1).min(self.width - 1);
                let idx = y * self.width + x;
                let span_x = (right - left).max(1) as f32;
                let span_y = (down - up).max(1) as f32;
                gx[idx] = (self.get(right, y) - self.get(left, y)) / span_x;
                gy[idx] = (self.get(x, down) - self.get(x, up)) / span_y;
            }
        }
        (
            Plane {
                width: self.width,
                height: self.height,
                data: gx,
            },
            Plane {
                width: self.width,
                height: self.height,
                data: gy,
            },
        )
    }

    /// Halves both dimensions with a 2×2 box filter.
    fn downsample(&self) -> Plane {
        let width = self.width / 2;
        let height = self.height / 2;
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let sum = self.get(2 * x, 2 * y)
                    + self.get(2 * x + 1, 2 * y)
                    + self.get(2 * x, 2 * y + 1)
                    + self.get(2 * x + 1, 2 * y + 1);
                data.push(sum * 0.25);
            }
        }
        Plane {
            width,
            height,
            data,
        }
    }
}
