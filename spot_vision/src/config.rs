// THEORY:
// Session configuration. Every threshold the occupancy pipeline reads is
// gathered here, loaded once per session and then treated as read-only. The
// grouping mirrors how the values are consumed: the edge feature, the
// shadow-robust difference, the hysteresis machine, and the frame aligner.
//
// Files are TOML with every field optional, so a config only needs to mention
// the values it changes. Region lists are JSON arrays of `Region` records, the
// format the calibration step writes.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core_modules::region::Region;
use crate::error::{SpotError, SpotResult};

const DEFAULT_CANNY_LOW: f32 = 60.0;
const DEFAULT_CANNY_HIGH: f32 = 180.0;
const DEFAULT_EDGE_MARGIN: f64 = 0.015;
const DEFAULT_DIFF_PIXEL_THRESHOLD: f32 = 20.0;
const DEFAULT_DIFF_RATIO_THRESHOLD: f64 = 0.03;
const DEFAULT_MIN_AREA_FRACTION: f64 = 0.04;
const DEFAULT_OCCUPY_FRAMES: u32 = 6;
const DEFAULT_FREE_FRAMES: u32 = 3;
const DEFAULT_CLEAR_THRESHOLD: f64 = 0.012;
const DEFAULT_ALIGN_ITERATIONS: u32 = 30;
const DEFAULT_ALIGN_EPSILON: f64 = 1e-3;
const DEFAULT_PYRAMID_LEVELS: u32 = 2;

/// Edge feature parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Lower Canny hysteresis threshold (gradient magnitude).
    pub canny_low: f32,
    /// Upper Canny hysteresis threshold (gradient magnitude).
    pub canny_high: f32,
    /// How far the edge ratio must rise above the region's baseline edge ratio
    /// before it counts as evidence of an object.
    pub edge_margin: f64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            canny_low: DEFAULT_CANNY_LOW,
            canny_high: DEFAULT_CANNY_HIGH,
            edge_margin: DEFAULT_EDGE_MARGIN,
        }
    }
}

/// Shadow-robust difference parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Weighted HSV difference above which a pixel counts as changed.
    pub pixel_threshold: f32,
    /// Changed-pixel fraction above which the difference signal votes occupied.
    pub ratio_threshold: f64,
    /// Minimum changed-area fraction; both this and `ratio_threshold` must be exceeded.
    pub min_area_fraction: f64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: DEFAULT_DIFF_PIXEL_THRESHOLD,
            ratio_threshold: DEFAULT_DIFF_RATIO_THRESHOLD,
            min_area_fraction: DEFAULT_MIN_AREA_FRACTION,
        }
    }
}

/// Debounce parameters for the per-spot state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HysteresisConfig {
    /// Consecutive occupied votes needed to confirm OCCUPIED.
    pub occupy_frames: u32,
    /// Consecutive free votes needed (with a low difference) to confirm FREE.
    pub free_frames: u32,
    /// Difference ratio below which a spot is considered verifiably clear.
    pub clear_threshold: f64,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            occupy_frames: DEFAULT_OCCUPY_FRAMES,
            free_frames: DEFAULT_FREE_FRAMES,
            clear_threshold: DEFAULT_CLEAR_THRESHOLD,
        }
    }
}

/// Frame alignment parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    pub enabled: bool,
    /// Iteration cap per pyramid level.
    pub max_iterations: u32,
    /// Convergence threshold on the change of the normalized correlation.
    pub epsilon: f64,
    /// Number of pyramid levels, 1 means full resolution only.
    pub pyramid_levels: u32,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_iterations: DEFAULT_ALIGN_ITERATIONS,
            epsilon: DEFAULT_ALIGN_EPSILON,
            pyramid_levels: DEFAULT_PYRAMID_LEVELS,
        }
    }
}

/// All tunables of an occupancy session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub edge: EdgeConfig,
    pub diff: DiffConfig,
    pub hysteresis: HysteresisConfig,
    pub alignment: AlignmentConfig,
}

impl DetectorConfig {
    /// Parses a TOML document and validates the result.
    pub fn from_toml_str(text: &str) -> SpotResult<Self> {
        let cfg: DetectorConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads and validates a TOML config file.
    pub fn load(path: &Path) -> SpotResult<Self> {
        let text = fs::read_to_string(path).map_err(|source| SpotError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> SpotResult<()> {
        if !(self.edge.canny_low >= 0.0) {
            return Err(invalid("edge.canny_low", "must be a non-negative number"));
        }
        if !(self.edge.canny_high >= self.edge.canny_low) {
            return Err(invalid(
                "edge.canny_high",
                format!(
                    "must be >= canny_low ({} < {})",
                    self.edge.canny_high, self.edge.canny_low
                ),
            ));
        }
        check_fraction("edge.edge_margin", self.edge.edge_margin)?;
        if !(self.diff.pixel_threshold >= 0.0 && self.diff.pixel_threshold <= 255.0) {
            return Err(invalid("diff.pixel_threshold", "must be within [0, 255]"));
        }
        check_fraction("diff.ratio_threshold", self.diff.ratio_threshold)?;
        check_fraction("diff.min_area_fraction", self.diff.min_area_fraction)?;
        if self.hysteresis.occupy_frames == 0 {
            return Err(invalid("hysteresis.occupy_frames", "must be at least 1"));
        }
        if self.hysteresis.free_frames == 0 {
            return Err(invalid("hysteresis.free_frames", "must be at least 1"));
        }
        check_fraction("hysteresis.clear_threshold", self.hysteresis.clear_threshold)?;
        if self.alignment.max_iterations == 0 {
            return Err(invalid("alignment.max_iterations", "must be at least 1"));
        }
        if !(self.alignment.epsilon > 0.0 && self.alignment.epsilon.is_finite()) {
            return Err(invalid("alignment.epsilon", "must be a positive number"));
        }
        if self.alignment.pyramid_levels == 0 {
            return Err(invalid("alignment.pyramid_levels", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> SpotError {
    SpotError::InvalidConfig {
        field,
        reason: reason.into(),
    }
}

fn check_fraction(field: &'static str, value: f64) -> SpotResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(field, format!("must be within [0, 1], got {value}")))
    }
}

/// Parses a JSON region list.
pub fn regions_from_json(text: &str) -> SpotResult<Vec<Region>> {
    Ok(serde_json::from_str(text)?)
}

/// Reads a JSON region list from disk.
pub fn load_regions(path: &Path) -> SpotResult<Vec<Region>> {
    let text = fs::read_to_string(path).map_err(|source| SpotError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    regions_from_json(&text)
}

/// Writes a region list as pretty-printed JSON.
pub fn save_regions(path: &Path, regions: &[Region]) -> SpotResult<()> {
    let text = serde_json::to_string_pretty(regions)?;
    fs::write(path, text).map_err(|source| SpotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = DetectorConfig::default();
        assert_eq!(cfg.hysteresis.occupy_frames, 6);
        assert_eq!(cfg.hysteresis.free_frames, 3);
        assert_eq!(cfg.hysteresis.clear_threshold, 0.012);
        assert_eq!(cfg.edge.canny_low, 60.0);
        assert_eq!(cfg.edge.canny_high, 180.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = DetectorConfig::from_toml_str(
            r#"
            [hysteresis]
            occupy_frames = 8

            [alignment]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.hysteresis.occupy_frames, 8);
        assert_eq!(cfg.hysteresis.free_frames, 3);
        assert!(!cfg.alignment.enabled);
        assert_eq!(cfg.alignment.max_iterations, 30);
        assert_eq!(cfg.diff, DiffConfig::default());
    }

    #[test]
    fn rejects_inverted_canny_thresholds() {
        let err = DetectorConfig::from_toml_str(
            r#"
            [edge]
            canny_low = 200.0
            canny_high = 100.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SpotError::InvalidConfig { field: "edge.canny_high", .. }));
    }

    #[test]
    fn rejects_zero_frame_counts() {
        let mut cfg = DetectorConfig::default();
        cfg.hysteresis.free_frames = 0;
        assert!(matches!(
            cfg.validate(),
            Err(SpotError::InvalidConfig { field: "hysteresis.free_frames", .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_fraction() {
        let mut cfg = DetectorConfig::default();
        cfg.diff.min_area_fraction = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_region_json() {
        let regions = regions_from_json(
            r#"[{"id": 1, "name": "Spot 1", "x": 10, "y": 20, "w": 30, "h": 40}]"#,
        )
        .unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].name, "Spot 1");
        assert_eq!(regions[0].h, 40);
    }
}
