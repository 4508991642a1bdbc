// THEORY:
// Operator-facing overlay: every region gets a two-pixel box, green while its
// confirmed state is free and red once it is occupied. Regions that cover no
// pixels are skipped since there is nothing to outline.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use spot_vision::{FrameReport, Region};

pub const FREE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const OCCUPIED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Copy of `frame` with the report's states drawn over their regions.
pub fn annotate(frame: &RgbImage, regions: &[Region], report: &FrameReport) -> RgbImage {
    let mut canvas = frame.clone();
    for (region, spot) in regions.iter().zip(&report.spots) {
        if region.is_degenerate() {
            continue;
        }
        let color = if spot.confirmed_occupied { OCCUPIED_COLOR } else { FREE_COLOR };
        let outer = Rect::at(region.x as i32, region.y as i32).of_size(region.w, region.h);
        draw_hollow_rect_mut(&mut canvas, outer, color);
        if region.w > 2 && region.h > 2 {
            let inner = Rect::at(region.x as i32 + 1, region.y as i32 + 1).of_size(region.w - 2, region.h - 2);
            draw_hollow_rect_mut(&mut canvas, inner, color);
        }
    }
    canvas
}
