// THEORY:
// A `Region` is the fixed identity of one monitored spot: a rectangle in the
// frame's pixel coordinate space plus an id and a display name. It is created
// once at calibration time and never mutated afterwards. Everything stateful
// about a spot (its streaks, its confirmed state, its baseline pixels) is keyed
// by the region, never stored inside it.

use image::imageops::crop_imm;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

pub type RegionId = u32;

/// An immutable rectangular sub-area of the frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Width in pixels.
    pub w: u32,
    /// Height in pixels.
    pub h: u32,
}

impl Region {
    pub fn new(id: RegionId, name: impl Into<String>, x: u32, y: u32, w: u32, h: u32) -> Self {
        Self {
            id,
            name: name.into(),
            x,
            y,
            w,
            h,
        }
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    /// True when the rectangle covers no pixels.
    pub fn is_degenerate(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Whether the rectangle lies fully inside a frame of the given size.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        let right = self.x as u64 + self.w as u64;
        let bottom = self.y as u64 + self.h as u64;
        right <= width as u64 && bottom <= height as u64
    }

    /// Copies this region out of a grayscale image. The caller guarantees the
    /// region fits; anything outside the image is clipped away.
    pub fn crop_gray(&self, image: &GrayImage) -> GrayImage {
        crop_imm(image, self.x, self.y, self.w, self.h).to_image()
    }

    /// Copies this region out of a color image.
    pub fn crop_color(&self, image: &RgbImage) -> RgbImage {
        crop_imm(image, self.x, self.y, self.w, self.h).to_image()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_exactly_at_the_border() {
        let region = Region::new(1, "Spot 1", 90, 40, 10, 10);
        assert!(region.fits_within(100, 50));
        assert!(!region.fits_within(99, 50));
        assert!(!region.fits_within(100, 49));
    }

    #[test]
    fn bounds_check_does_not_overflow() {
        let region = Region::new(1, "far", u32::MAX, 0, 2, 1);
        assert!(!region.fits_within(u32::MAX, 10));
    }

    #[test]
    fn degenerate_when_either_side_is_zero() {
        assert!(Region::new(1, "a", 0, 0, 0, 5).is_degenerate());
        assert!(Region::new(2, "b", 0, 0, 5, 0).is_degenerate());
        assert!(!Region::new(3, "c", 0, 0, 1, 1).is_degenerate());
        assert_eq!(Region::new(4, "d", 0, 0, 3, 4).area(), 12);
    }

    #[test]
    fn crops_copy_the_right_pixels() {
        let frame = GrayImage::from_fn(10, 10, |x, y| image::Luma([(y * 10 + x) as u8]));
        let crop = Region::new(1, "a", 2, 3, 4, 2).crop_gray(&frame);
        assert_eq!(crop.dimensions(), (4, 2));
        assert_eq!(crop.get_pixel(0, 0).0[0], 32);
        assert_eq!(crop.get_pixel(3, 1).0[0], 45);
    }
}
