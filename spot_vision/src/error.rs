// THEORY:
// Every fallible operation in the engine reports through a single `SpotError`.
// Two families live here:
// 1.  **Precondition violations**: the caller handed the core something it can
//     never analyze (an empty frame, a frame of the wrong size, a region that
//     pokes outside the frame). These are returned before any state is touched,
//     so a rejected call leaves every `SpotState` and the baseline exactly as
//     they were.
// 2.  **Boundary failures**: reading a config or region file, decoding an image,
//     or a parallel worker dying. These belong to the session setup or the
//     parallel evaluator, never to the per-region math.
//
// Alignment trouble is deliberately absent: the aligner recovers by itself.

use std::path::PathBuf;

use thiserror::Error;

pub type SpotResult<T> = Result<T, SpotError>;

#[derive(Debug, Error)]
pub enum SpotError {
    #[error("precondition violated: frame is empty ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error(
        "precondition violated: frame is {actual_width}x{actual_height} but the session expects {expected_width}x{expected_height}"
    )]
    FrameSizeMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("region {id} ({x},{y} {w}x{h}) does not fit inside a {frame_width}x{frame_height} frame")]
    RegionOutOfBounds {
        id: u32,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        frame_width: u32,
        frame_height: u32,
    },

    #[error("region id {id} appears more than once")]
    DuplicateRegion { id: u32 },

    #[error("unknown region id {id}")]
    UnknownRegion { id: u32 },

    #[error("crop is {actual_width}x{actual_height} but region {id} needs {expected_width}x{expected_height}")]
    CropSizeMismatch {
        id: u32,
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("crops differ in size: {left_width}x{left_height} vs {right_width}x{right_height}")]
    CropPairMismatch {
        left_width: u32,
        left_height: u32,
        right_width: u32,
        right_height: u32,
    },

    #[error("invalid config value for '{field}': {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse region list: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to load image '{path}': {source}")]
    Image {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("region worker failed: {0}")]
    Worker(String),
}
