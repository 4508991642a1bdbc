// THEORY:
// The `BaselineManager` owns the empty-lot reference: a full-frame color image,
// its grayscale twin, and one reference edge ratio per region. It is the only
// place that writes to those buffers.
//
// Two kinds of write exist:
// 1.  **Reset**: the whole reference is replaced from a fresh frame and every
//     region's edge ratio is measured again. Used at startup and when an
//     operator asks for it.
// 2.  **Patch**: one region's pixels are overwritten in both images and only
//     that region's edge ratio is re-measured. This is how the engine absorbs
//     slow lighting drift once a spot is verifiably empty.
//
// The edge-ratio array is index-aligned with the region list, and every write
// recomputes the ratio from the buffers as they stand afterwards, so a stored
// ratio is never stale. Patches write through owned crops, so nothing the
// caller is still reading aliases the reference buffers.

use std::collections::HashMap;

use image::imageops::{grayscale, replace};
use image::{GrayImage, RgbImage};
use log::{debug, info};

use crate::config::EdgeConfig;
use crate::core_modules::features::edge_ratio;
use crate::core_modules::region::{Region, RegionId};
use crate::error::{SpotError, SpotResult};

/// Grayscale view of a color frame.
pub fn to_gray(frame: &RgbImage) -> GrayImage {
    grayscale(frame)
}

/// Owner of the reference imagery for one monitoring session.
#[derive(Debug, Clone)]
pub struct BaselineManager {
    regions: Vec<Region>,
    index_by_id: HashMap<RegionId, usize>,
    color: RgbImage,
    gray: GrayImage,
    /// Reference edge ratio per region, index-aligned with `regions`.
    edge_baselines: Vec<f64>,
    canny_low: f32,
    canny_high: f32,
}

impl BaselineManager {
    /// Seeds the reference from `color_frame`. Every region must fit inside the
    /// frame and ids must be unique.
    pub fn new(regions: Vec<Region>, color_frame: RgbImage, edge: &EdgeConfig) -> SpotResult<Self> {
        let (width, height) = color_frame.dimensions();
        if width == 0 || height == 0 {
            return Err(SpotError::EmptyFrame { width, height });
        }

        let mut index_by_id = HashMap::with_capacity(regions.len());
        for (index, region) in regions.iter().enumerate() {
            if !region.fits_within(width, height) {
                return Err(SpotError::RegionOutOfBounds {
                    id: region.id,
                    x: region.x,
                    y: region.y,
                    w: region.w,
                    h: region.h,
                    frame_width: width,
                    frame_height: height,
                });
            }
            if index_by_id.insert(region.id, index).is_some() {
                return Err(SpotError::DuplicateRegion { id: region.id });
            }
        }

        let gray = to_gray(&color_frame);
        let mut manager = Self {
            edge_baselines: vec![0.0; regions.len()],
            regions,
            index_by_id,
            color: color_frame,
            gray,
            canny_low: edge.canny_low,
            canny_high: edge.canny_high,
        };
        manager.recompute_all_edges();
        Ok(manager)
    }

    /// Replaces the whole reference with `color_frame`.
    pub fn reset(&mut self, color_frame: &RgbImage) -> SpotResult<()> {
        self.check_frame(color_frame)?;
        self.color = color_frame.clone();
        self.gray = to_gray(color_frame);
        self.recompute_all_edges();
        info!("baseline reset from current frame ({} regions)", self.regions.len());
        Ok(())
    }

    /// Overwrites one region's reference pixels with the given crops and
    /// re-measures its edge ratio. No other region's pixels or ratio change.
    pub fn patch_region(
        &mut self,
        id: RegionId,
        aligned_gray_crop: &GrayImage,
        color_crop: &RgbImage,
    ) -> SpotResult<()> {
        let index = self.index_of(id)?;
        let region = &self.regions[index];
        for (actual_width, actual_height) in [aligned_gray_crop.dimensions(), color_crop.dimensions()] {
            if (actual_width, actual_height) != (region.w, region.h) {
                return Err(SpotError::CropSizeMismatch {
                    id,
                    expected_width: region.w,
                    expected_height: region.h,
                    actual_width,
                    actual_height,
                });
            }
        }

        replace(&mut self.gray, aligned_gray_crop, region.x as i64, region.y as i64);
        replace(&mut self.color, color_crop, region.x as i64, region.y as i64);
        let refreshed = self.measure_edges(index);
        self.edge_baselines[index] = refreshed;
        debug!("patched baseline for region {id}, edge baseline now {refreshed:.4}");
        Ok(())
    }

    /// Current reference edge ratio of a region.
    pub fn edge_baseline(&self, id: RegionId) -> SpotResult<f64> {
        Ok(self.edge_baselines[self.index_of(id)?])
    }

    /// Reference edge ratios in region order.
    pub fn edge_baselines(&self) -> &[f64] {
        &self.edge_baselines
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn color(&self) -> &RgbImage {
        &self.color
    }

    pub fn gray(&self) -> &GrayImage {
        &self.gray
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.color.dimensions()
    }

    /// Rejects frames the session cannot analyze.
    pub fn check_frame(&self, frame: &RgbImage) -> SpotResult<()> {
        let (actual_width, actual_height) = frame.dimensions();
        if actual_width == 0 || actual_height == 0 {
            return Err(SpotError::EmptyFrame {
                width: actual_width,
                height: actual_height,
            });
        }
        let (expected_width, expected_height) = self.dimensions();
        if (actual_width, actual_height) != (expected_width, expected_height) {
            return Err(SpotError::FrameSizeMismatch {
                expected_width,
                expected_height,
                actual_width,
                actual_height,
            });
        }
        Ok(())
    }

    fn index_of(&self, id: RegionId) -> SpotResult<usize> {
        self.index_by_id
            .get(&id)
            .copied()
            .ok_or(SpotError::UnknownRegion { id })
    }

    fn measure_edges(&self, index: usize) -> f64 {
        let crop = self.regions[index].crop_gray(&self.gray);
        edge_ratio(&crop, self.canny_low, self.canny_high)
    }

    fn recompute_all_edges(&mut self) {
        self.edge_baselines = (0..self.regions.len())
            .map(|index| self.measure_edges(index))
            .collect();
    }
}
