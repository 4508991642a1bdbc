// THEORY:
// The `pipeline` module is the top-level API of the occupancy engine. It wires
// the leaf components into the per-frame procedure and owns every piece of
// session state:
//
//   frame ──▶ FrameAligner ──▶ per region: crops ──▶ features ──▶ Vote
//                                                            │
//             BaselineManager ◀── patch when clear ◀── SpotState
//
// Key architectural principles:
// 1.  **Measure, then mutate**: all signals for a frame are computed before any
//     `SpotState` or baseline pixel is touched. A failed measurement aborts the
//     frame with nothing changed.
// 2.  **Arena-style state**: one `SpotState` per region, in a map keyed by
//     region id and owned by the engine. No hidden globals, nothing shared
//     between sessions.
// 3.  **Region order is report order**: the caller's region list fixes the
//     iteration order, independent of ids.
// 4.  **Split stages**: preparing a frame, cutting crops and applying signals
//     are separate steps so `parallel_pipeline` can measure regions
//     concurrently and still apply results in order.

use std::collections::HashMap;

use image::{GrayImage, RgbImage};
use log::{debug, warn};

use crate::config::DetectorConfig;
use crate::core_modules::aligner::{AlignmentOutcome, FrameAligner};
use crate::core_modules::baseline::{BaselineManager, to_gray};
use crate::core_modules::features::{RawSignal, edge_ratio, shadow_robust_diff_ratio};
use crate::core_modules::region::{Region, RegionId};
use crate::core_modules::spot_state::{SpotState, Vote};
use crate::error::{SpotError, SpotResult};

/// Per-region result for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotReport {
    pub region_id: RegionId,
    pub name: String,
    pub confirmed_occupied: bool,
    pub edge_ratio: f64,
    pub diff_ratio: f64,
    pub vote: Vote,
}

/// The engine's output for a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    /// One entry per region, in region-list order.
    pub spots: Vec<SpotReport>,
    pub free_count: usize,
    pub total_count: usize,
    /// Whether the frame was geometrically aligned or used as-is.
    pub aligned: bool,
    /// Regions whose baseline was patched while processing this frame.
    pub patched: Vec<RegionId>,
}

impl FrameReport {
    pub fn occupied_count(&self) -> usize {
        self.total_count - self.free_count
    }

    pub fn summary(&self) -> String {
        format!("Free spots: {}/{}", self.free_count, self.total_count)
    }
}

/// Raised when the session could not be seeded from the supplied baseline image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaselineWarning {
    /// No baseline image was available; the first frame was used.
    Missing,
    /// The baseline image did not match the frame size; the first frame was used.
    SizeMismatch {
        baseline_width: u32,
        baseline_height: u32,
        frame_width: u32,
        frame_height: u32,
    },
}

/// Discrete operator events consumed between frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    ResetBaseline,
    SaveFrame,
}

/// What the engine did with an operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    BaselineReset,
    /// The host should persist the current frame.
    SaveRequested,
}

/// Threshold subset needed to measure a region, cheap to copy into workers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SignalSettings {
    pub canny_low: f32,
    pub canny_high: f32,
    pub pixel_threshold: f32,
}

impl From<&DetectorConfig> for SignalSettings {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            canny_low: config.edge.canny_low,
            canny_high: config.edge.canny_high,
            pixel_threshold: config.diff.pixel_threshold,
        }
    }
}

/// Owned copies of everything one region needs to be measured.
#[derive(Debug, Clone)]
pub(crate) struct RegionCrops {
    pub aligned_gray: GrayImage,
    pub color: RgbImage,
    pub baseline_color: RgbImage,
}

impl RegionCrops {
    pub(crate) fn measure(&self, settings: &SignalSettings) -> SpotResult<RawSignal> {
        let diff_ratio =
            shadow_robust_diff_ratio(&self.color, &self.baseline_color, settings.pixel_threshold)?;
        let edge_ratio = edge_ratio(&self.aligned_gray, settings.canny_low, settings.canny_high);
        Ok(RawSignal {
            edge_ratio,
            diff_ratio,
        })
    }
}

/// A validated frame with its aligned grayscale view.
#[derive(Debug, Clone)]
pub(crate) struct PreparedFrame {
    pub aligned_gray: GrayImage,
    pub outcome: AlignmentOutcome,
}

/// The sequential occupancy engine for one monitoring session.
pub struct OccupancyEngine {
    config: DetectorConfig,
    baseline: BaselineManager,
    aligner: FrameAligner,
    spots: HashMap<RegionId, SpotState>,
}

impl OccupancyEngine {
    /// Starts a session from an explicit empty-lot baseline image.
    pub fn new(regions: Vec<Region>, baseline_frame: RgbImage, config: DetectorConfig) -> SpotResult<Self> {
        config.validate()?;
        for region in regions.iter().filter(|r| r.is_degenerate()) {
            warn!(
                "region {} ({}) covers no pixels and will always read as free",
                region.id, region.name
            );
        }
        let baseline = BaselineManager::new(regions, baseline_frame, &config.edge)?;
        let spots = baseline
            .regions()
            .iter()
            .map(|region| (region.id, SpotState::new()))
            .collect();
        Ok(Self {
            aligner: FrameAligner::new(config.alignment.clone()),
            config,
            baseline,
            spots,
        })
    }

    /// Starts a session from `baseline` when it is usable, otherwise from
    /// `first_frame`, reporting why the fallback happened.
    pub fn with_fallback_baseline(
        regions: Vec<Region>,
        baseline: Option<RgbImage>,
        first_frame: &RgbImage,
        config: DetectorConfig,
    ) -> SpotResult<(Self, Option<BaselineWarning>)> {
        let (seed, warning) = match baseline {
            Some(image) if image.dimensions() == first_frame.dimensions() => (image, None),
            Some(image) => {
                let (baseline_width, baseline_height) = image.dimensions();
                let (frame_width, frame_height) = first_frame.dimensions();
                (
                    first_frame.clone(),
                    Some(BaselineWarning::SizeMismatch {
                        baseline_width,
                        baseline_height,
                        frame_width,
                        frame_height,
                    }),
                )
            }
            None => (first_frame.clone(), Some(BaselineWarning::Missing)),
        };
        if let Some(warning) = &warning {
            warn!("baseline unusable ({warning:?}), using the first frame instead");
        }
        let engine = Self::new(regions, seed, config)?;
        Ok((engine, warning))
    }

    /// Runs the full per-frame procedure on one color frame.
    pub fn process_frame(&mut self, frame: &RgbImage) -> SpotResult<FrameReport> {
        let prepared = self.prepare_frame(frame)?;
        let settings = SignalSettings::from(&self.config);
        let signals = self
            .region_crops(&prepared, frame)
            .iter()
            .map(|crops| crops.measure(&settings))
            .collect();
        self.apply_signals(&prepared, frame, signals)
    }

    /// Validates the frame and aligns its grayscale view to the baseline.
    pub(crate) fn prepare_frame(&self, frame: &RgbImage) -> SpotResult<PreparedFrame> {
        self.baseline.check_frame(frame)?;
        let gray = to_gray(frame);
        let (aligned_gray, outcome) = self.aligner.align_with_outcome(&gray, self.baseline.gray());
        Ok(PreparedFrame {
            aligned_gray,
            outcome,
        })
    }

    /// Cuts owned crops for every region, in region order.
    pub(crate) fn region_crops(&self, prepared: &PreparedFrame, frame: &RgbImage) -> Vec<RegionCrops> {
        self.baseline
            .regions()
            .iter()
            .map(|region| RegionCrops {
                aligned_gray: region.crop_gray(&prepared.aligned_gray),
                color: region.crop_color(frame),
                baseline_color: region.crop_color(self.baseline.color()),
            })
            .collect()
    }

    /// Turns measured signals (one per region, in region order) into votes,
    /// advances every state machine and patches baselines that just cleared.
    ///
    /// Every input is validated before the first state is touched, so an
    /// error leaves all `SpotState`s and the baseline as they were.
    pub(crate) fn apply_signals(
        &mut self,
        prepared: &PreparedFrame,
        frame: &RgbImage,
        signals: Vec<SpotResult<RawSignal>>,
    ) -> SpotResult<FrameReport> {
        self.baseline.check_frame(frame)?;
        let (expected_width, expected_height) = self.baseline.dimensions();
        let (actual_width, actual_height) = prepared.aligned_gray.dimensions();
        if (actual_width, actual_height) != (expected_width, expected_height) {
            return Err(SpotError::FrameSizeMismatch {
                expected_width,
                expected_height,
                actual_width,
                actual_height,
            });
        }

        let total_count = self.baseline.regions().len();
        if signals.len() != total_count {
            return Err(SpotError::Worker(format!(
                "expected {total_count} region signals, got {}",
                signals.len()
            )));
        }
        let signals = signals.into_iter().collect::<SpotResult<Vec<RawSignal>>>()?;

        let mut spots = Vec::with_capacity(total_count);
        let mut patched = Vec::new();
        for (index, signal) in signals.into_iter().enumerate() {
            let vote = self.vote(index, &signal);
            let region = &self.baseline.regions()[index];
            let region_id = region.id;
            let name = region.name.clone();
            let update = self.spots.entry(region_id).or_default().update(
                vote.occupied_now(),
                signal.diff_ratio,
                &self.config.hysteresis,
            );

            if update.repair_due {
                let gray_crop = region.crop_gray(&prepared.aligned_gray);
                let color_crop = region.crop_color(frame);
                self.baseline.patch_region(region_id, &gray_crop, &color_crop)?;
                patched.push(region_id);
            }

            spots.push(SpotReport {
                region_id,
                name,
                confirmed_occupied: update.confirmed_occupied,
                edge_ratio: signal.edge_ratio,
                diff_ratio: signal.diff_ratio,
                vote,
            });
        }

        let free_count = spots.iter().filter(|s| !s.confirmed_occupied).count();
        if !patched.is_empty() {
            debug!("local baseline repair for regions {patched:?}");
        }
        Ok(FrameReport {
            spots,
            free_count,
            total_count,
            aligned: prepared.outcome.is_aligned(),
            patched,
        })
    }

    /// Replaces the whole baseline with `frame`. Every streak is cleared so the
    /// next frame cannot trigger a patch against the fresh reference.
    pub fn reset_baseline(&mut self, frame: &RgbImage) -> SpotResult<()> {
        self.baseline.reset(frame)?;
        for state in self.spots.values_mut() {
            state.reset_streaks();
        }
        Ok(())
    }

    pub fn apply_command(&mut self, command: OperatorCommand, frame: &RgbImage) -> SpotResult<CommandOutcome> {
        match command {
            OperatorCommand::ResetBaseline => {
                self.reset_baseline(frame)?;
                Ok(CommandOutcome::BaselineReset)
            }
            OperatorCommand::SaveFrame => Ok(CommandOutcome::SaveRequested),
        }
    }

    pub fn spot_state(&self, id: RegionId) -> Option<&SpotState> {
        self.spots.get(&id)
    }

    pub fn baseline(&self) -> &BaselineManager {
        &self.baseline
    }

    pub fn regions(&self) -> &[Region] {
        self.baseline.regions()
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn vote(&self, index: usize, signal: &RawSignal) -> Vote {
        let diff = &self.config.diff;
        let edge_reference = self.baseline.edge_baselines()[index];
        Vote {
            from_diff: signal.diff_ratio > diff.ratio_threshold && signal.diff_ratio > diff.min_area_fraction,
            from_edge: signal.edge_ratio > edge_reference + self.config.edge.edge_margin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gray_lot() -> RgbImage {
        RgbImage::from_pixel(80, 40, Rgb([128, 128, 128]))
    }

    fn regions() -> Vec<Region> {
        vec![
            Region::new(1, "Spot 1", 5, 5, 20, 30),
            Region::new(2, "Spot 2", 30, 5, 20, 30),
            Region::new(3, "Spot 3", 55, 5, 20, 30),
        ]
    }

    fn engine() -> OccupancyEngine {
        OccupancyEngine::new(regions(), gray_lot(), DetectorConfig::default()).unwrap()
    }

    fn paint(frame: &mut RgbImage, region: &Region, color: Rgb<u8>) {
        for y in region.y..region.y + region.h {
            for x in region.x..region.x + region.w {
                frame.put_pixel(x, y, color);
            }
        }
    }

    #[test]
    fn empty_lot_reports_everything_free() {
        let mut engine = engine();
        let report = engine.process_frame(&gray_lot()).unwrap();
        assert_eq!(report.free_count, 3);
        assert_eq!(report.total_count, 3);
        assert_eq!(report.summary(), "Free spots: 3/3");
        assert!(report.spots.iter().all(|s| s.diff_ratio == 0.0 && s.edge_ratio == 0.0));
        assert!(!report.aligned, "a flat baseline cannot be aligned against");
    }

    #[test]
    fn report_follows_region_order() {
        let shuffled = vec![
            Region::new(9, "nine", 5, 5, 10, 10),
            Region::new(2, "two", 30, 5, 10, 10),
        ];
        let mut engine = OccupancyEngine::new(shuffled, gray_lot(), DetectorConfig::default()).unwrap();
        let report = engine.process_frame(&gray_lot()).unwrap();
        let ids: Vec<RegionId> = report.spots.iter().map(|s| s.region_id).collect();
        assert_eq!(ids, vec![9, 2]);
    }

    #[test]
    fn wrong_size_frame_is_rejected_without_side_effects() {
        let mut engine = engine();
        engine.process_frame(&gray_lot()).unwrap();
        let before = *engine.spot_state(1).unwrap();
        let err = engine.process_frame(&RgbImage::new(81, 40)).unwrap_err();
        assert!(matches!(err, SpotError::FrameSizeMismatch { .. }));
        assert_eq!(*engine.spot_state(1).unwrap(), before);
        assert!(matches!(
            engine.process_frame(&RgbImage::new(0, 0)),
            Err(SpotError::EmptyFrame { .. })
        ));
    }

    #[test]
    fn colored_object_confirms_after_occupy_frames() {
        let mut engine = engine();
        let target = regions()[1].clone();
        let mut frame = gray_lot();
        paint(&mut frame, &target, Rgb([200, 30, 30]));

        let occupy_frames = engine.config().hysteresis.occupy_frames;
        for n in 1..=occupy_frames {
            let report = engine.process_frame(&frame).unwrap();
            let spot = &report.spots[1];
            assert!(spot.vote.from_diff);
            assert_eq!(spot.confirmed_occupied, n == occupy_frames, "frame {n}");
        }
        assert_eq!(engine.spot_state(2).unwrap().occ_streak, occupy_frames);
    }

    #[test]
    fn clear_spot_patches_its_baseline_once() {
        let mut engine = engine();
        let free_frames = engine.config().hysteresis.free_frames as usize;
        let mut patch_frames = Vec::new();
        for n in 1..=8 {
            let report = engine.process_frame(&gray_lot()).unwrap();
            if !report.patched.is_empty() {
                assert_eq!(report.patched, vec![1, 2, 3]);
                patch_frames.push(n);
            }
        }
        assert_eq!(patch_frames, vec![free_frames]);
    }

    #[test]
    fn reset_clears_streaks_but_keeps_states() {
        let mut engine = engine();
        let mut frame = gray_lot();
        paint(&mut frame, &regions()[0], Rgb([30, 30, 200]));
        for _ in 0..engine.config().hysteresis.occupy_frames {
            engine.process_frame(&frame).unwrap();
        }
        assert!(engine.spot_state(1).unwrap().confirmed_occupied);

        let outcome = engine.apply_command(OperatorCommand::ResetBaseline, &frame).unwrap();
        assert_eq!(outcome, CommandOutcome::BaselineReset);
        let state = engine.spot_state(1).unwrap();
        assert!(state.confirmed_occupied);
        assert_eq!((state.occ_streak, state.free_streak), (0, 0));
        assert_eq!(engine.baseline().color(), &frame);

        // The painted spot now matches the baseline and clears after the usual streak.
        let free_frames = engine.config().hysteresis.free_frames;
        for n in 1..=free_frames {
            let report = engine.process_frame(&frame).unwrap();
            assert_eq!(report.spots[0].confirmed_occupied, n < free_frames);
        }
    }

    #[test]
    fn save_command_is_delegated() {
        let mut engine = engine();
        let outcome = engine.apply_command(OperatorCommand::SaveFrame, &gray_lot()).unwrap();
        assert_eq!(outcome, CommandOutcome::SaveRequested);
    }

    #[test]
    fn fallback_baseline_uses_first_frame() {
        let first = gray_lot();
        let (engine, warning) =
            OccupancyEngine::with_fallback_baseline(regions(), None, &first, DetectorConfig::default()).unwrap();
        assert_eq!(warning, Some(BaselineWarning::Missing));
        assert_eq!(engine.baseline().color(), &first);

        let wrong = RgbImage::new(10, 10);
        let (_, warning) =
            OccupancyEngine::with_fallback_baseline(regions(), Some(wrong), &first, DetectorConfig::default())
                .unwrap();
        assert!(matches!(warning, Some(BaselineWarning::SizeMismatch { baseline_width: 10, .. })));

        let (_, warning) = OccupancyEngine::with_fallback_baseline(
            regions(),
            Some(first.clone()),
            &first,
            DetectorConfig::default(),
        )
        .unwrap();
        assert_eq!(warning, None);
    }

    #[test]
    fn zero_area_region_reads_as_free() {
        let regions = vec![Region::new(1, "empty", 10, 10, 0, 5)];
        let mut engine = OccupancyEngine::new(regions, gray_lot(), DetectorConfig::default()).unwrap();
        let mut frame = gray_lot();
        paint(&mut frame, &Region::new(0, "", 0, 0, 80, 40), Rgb([10, 200, 10]));
        let report = engine.process_frame(&frame).unwrap();
        assert_eq!(report.spots[0].diff_ratio, 0.0);
        assert_eq!(report.spots[0].edge_ratio, 0.0);
        assert_eq!(report.free_count, 1);
    }

    #[test]
    fn mismatched_frame_in_apply_signals_changes_nothing() {
        let mut engine = engine();
        for _ in 0..2 {
            engine.process_frame(&gray_lot()).unwrap();
        }
        let states_before: Vec<SpotState> = (1..=3).map(|id| *engine.spot_state(id).unwrap()).collect();
        let color_before = engine.baseline().color().clone();
        let edges_before = engine.baseline().edge_baselines().to_vec();

        let prepared = engine.prepare_frame(&gray_lot()).unwrap();
        let signals = (0..3).map(|_| Ok(RawSignal::default())).collect();
        let narrow = RgbImage::from_pixel(70, 40, Rgb([128, 128, 128]));
        assert!(matches!(
            engine.apply_signals(&prepared, &narrow, signals),
            Err(SpotError::FrameSizeMismatch { actual_width: 70, .. })
        ));

        let shrunk = PreparedFrame {
            aligned_gray: GrayImage::new(70, 40),
            outcome: prepared.outcome,
        };
        let signals = (0..3).map(|_| Ok(RawSignal::default())).collect();
        assert!(matches!(
            engine.apply_signals(&shrunk, &gray_lot(), signals),
            Err(SpotError::FrameSizeMismatch { actual_width: 70, .. })
        ));

        let states_after: Vec<SpotState> = (1..=3).map(|id| *engine.spot_state(id).unwrap()).collect();
        assert_eq!(states_after, states_before);
        assert_eq!(engine.baseline().color(), &color_before);
        assert_eq!(engine.baseline().edge_baselines(), edges_before.as_slice());
    }

    #[test]
    fn failed_signal_changes_nothing() {
        let mut engine = engine();
        engine.process_frame(&gray_lot()).unwrap();
        let before = *engine.spot_state(1).unwrap();

        let prepared = engine.prepare_frame(&gray_lot()).unwrap();
        let signals = vec![
            Ok(RawSignal::default()),
            Err(SpotError::Worker("lost".into())),
            Ok(RawSignal::default()),
        ];
        assert!(engine.apply_signals(&prepared, &gray_lot(), signals).is_err());
        assert_eq!(*engine.spot_state(1).unwrap(), before);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = DetectorConfig::default();
        config.hysteresis.occupy_frames = 0;
        assert!(matches!(
            OccupancyEngine::new(regions(), gray_lot(), config),
            Err(SpotError::InvalidConfig { .. })
        ));
    }
}
