// THEORY:
// Everything the host writes to disk besides logs: operator screenshots,
// named after the wall-clock millisecond they were taken, and the optional
// per-frame annotated output, numbered in processing order.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use image::RgbImage;

/// `frame_<unix-millis>.jpg` inside `dir`.
pub fn screenshot_path(dir: &Path, taken_at: SystemTime) -> PathBuf {
    let millis = taken_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    dir.join(format!("frame_{millis}.jpg"))
}

pub fn save_screenshot(dir: &Path, frame: &RgbImage) -> Result<PathBuf> {
    write_image(screenshot_path(dir, SystemTime::now()), frame)
}

/// Writes the annotated copy of frame number `index`.
pub fn save_annotated(dir: &Path, index: usize, frame: &RgbImage) -> Result<PathBuf> {
    write_image(dir.join(format!("annotated_{index:06}.jpg")), frame)
}

fn write_image(path: PathBuf, frame: &RgbImage) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    frame
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
