// THEORY:
// This file is the main entry point for the `spot_vision` library crate. It
// exposes the occupancy engine for a fixed set of rectangular regions in a
// video stream, classifying each as FREE or OCCUPIED frame by frame.
//
// The public surface is `pipeline::OccupancyEngine` (sequential) and
// `parallel_pipeline::ParallelOccupancyEngine` (regions measured concurrently),
// plus the configuration and error types they take and return. The leaf
// components live in `core_modules` and can be used on their own: the feature
// extractors, the frame aligner, the baseline manager and the per-spot state
// machine.
//
// Capturing frames, drawing boxes and saving files are the host's business;
// the engine only sees frames as `image::RgbImage` values of a fixed size.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use config::DetectorConfig;
pub use core_modules::region::{Region, RegionId};
pub use error::{SpotError, SpotResult};
pub use parallel_pipeline::ParallelOccupancyEngine;
pub use pipeline::{
    BaselineWarning, CommandOutcome, FrameReport, OccupancyEngine, OperatorCommand, SpotReport,
};
