// THEORY:
// `spot_monitor` is the thin host around the occupancy engine. It owns
// everything the core deliberately does not: reading frames, loading the
// session's regions, baseline and thresholds, listening to the operator,
// drawing overlays and writing files. Per frame it hands a decoded image to the
// engine, logs the summary, and then applies whatever operator commands
// arrived meanwhile.

mod commands;
mod persist;
mod render;
mod source;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use image::RgbImage;
use log::{debug, error, info, warn};
use spot_vision::config::load_regions;
use spot_vision::{
    CommandOutcome, DetectorConfig, FrameReport, OccupancyEngine, OperatorCommand, ParallelOccupancyEngine,
    Region, SpotResult,
};
use tokio::sync::mpsc::error::TryRecvError;

use crate::commands::{HostCommand, spawn_stdin_reader};
use crate::source::{DirectoryFrameSource, FrameSource};

#[derive(Parser, Debug)]
#[command(name = "spot_monitor", about = "Per-spot parking occupancy from a fixed camera")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the occupancy engine over a directory of frames
    Run(RunArgs),

    /// Save the first frame of a source as the empty-lot baseline
    CaptureBaseline {
        #[arg(long)]
        frames: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },

    /// Check that a region file fits a frame
    CheckRegions {
        #[arg(long)]
        regions: PathBuf,
        #[arg(long)]
        frame: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directory of frames, processed in file-name order
    #[arg(long)]
    frames: PathBuf,
    /// JSON region list
    #[arg(long)]
    regions: PathBuf,
    /// Empty-lot baseline image; the first frame is used when absent or unusable
    #[arg(long)]
    baseline: Option<PathBuf>,
    /// TOML detector config; defaults apply when absent
    #[arg(long, env = "SPOT_MONITOR_CONFIG")]
    config: Option<PathBuf>,
    /// Write an annotated copy of every frame here
    #[arg(long)]
    annotate: Option<PathBuf>,
    /// Directory for operator screenshots
    #[arg(long, default_value = "data")]
    screenshots: PathBuf,
    /// Measure regions on the calling thread instead of the worker pool
    #[arg(long)]
    sequential: bool,
    /// Read b/s/q operator commands from stdin
    #[arg(long)]
    interactive: bool,
    /// Pause between frames, in milliseconds
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => cmd_run(args).await,
        Command::CaptureBaseline { frames, out } => cmd_capture_baseline(&frames, &out),
        Command::CheckRegions { regions, frame } => cmd_check_regions(&regions, &frame),
    }
}

/// Either engine flavour behind one call surface.
enum Evaluator {
    Sequential(OccupancyEngine),
    Parallel(ParallelOccupancyEngine),
}

impl Evaluator {
    async fn process_frame(&mut self, frame: &RgbImage) -> SpotResult<FrameReport> {
        match self {
            Evaluator::Sequential(engine) => engine.process_frame(frame),
            Evaluator::Parallel(engine) => engine.process_frame(frame).await,
        }
    }

    fn apply_command(&mut self, command: OperatorCommand, frame: &RgbImage) -> SpotResult<CommandOutcome> {
        match self {
            Evaluator::Sequential(engine) => engine.apply_command(command, frame),
            Evaluator::Parallel(engine) => engine.apply_command(command, frame),
        }
    }

    fn regions(&self) -> &[Region] {
        match self {
            Evaluator::Sequential(engine) => engine.regions(),
            Evaluator::Parallel(engine) => engine.engine().regions(),
        }
    }
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    // --- 1. Session inputs ---
    let config = match &args.config {
        Some(path) => DetectorConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => DetectorConfig::default(),
    };
    let regions = load_regions(&args.regions)
        .with_context(|| format!("loading regions {}", args.regions.display()))?;

    let mut source = DirectoryFrameSource::open(&args.frames)?;
    info!("{} frames queued from {}", source.remaining(), args.frames.display());
    let Some(first) = source.next_frame()? else {
        bail!("no frames found in {}", args.frames.display());
    };

    let baseline = args.baseline.as_deref().and_then(read_baseline);
    let (engine, _) = OccupancyEngine::with_fallback_baseline(regions, baseline, &first, config)?;

    // --- 2. Evaluator and operator input ---
    let mut evaluator = if args.sequential {
        Evaluator::Sequential(engine)
    } else {
        let parallel = ParallelOccupancyEngine::new(engine);
        info!("measuring regions on {} workers", parallel.workers());
        Evaluator::Parallel(parallel)
    };
    let mut commands = if args.interactive {
        Some(spawn_stdin_reader().context("starting the stdin command reader")?)
    } else {
        None
    };
    if commands.is_some() {
        info!("running. Commands: [q]=quit, [b]=update baseline, [s]=screenshot");
    }

    // --- 3. Main processing loop ---
    let mut next = Some(first);
    let mut index = 0usize;
    let mut processed = 0usize;
    'frames: while let Some(frame) = next.take() {
        let report = match evaluator.process_frame(&frame).await {
            Ok(report) => report,
            Err(err) => {
                warn!("skipping frame {index}: {err}");
                next = source.next_frame()?;
                index += 1;
                continue;
            }
        };
        processed += 1;
        info!("{}", report.summary());
        log_spots(&report);

        let annotated = render::annotate(&frame, evaluator.regions(), &report);
        if let Some(dir) = &args.annotate {
            persist::save_annotated(dir, index, &annotated)?;
        }

        // --- 4. Operator commands, applied between frames ---
        while let Some(receiver) = commands.as_mut() {
            let command = match receiver.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    commands = None;
                    break;
                }
            };
            match command {
                HostCommand::Quit => break 'frames,
                HostCommand::Engine(command) => match evaluator.apply_command(command, &frame) {
                    Ok(CommandOutcome::BaselineReset) => info!("baseline updated from current frame"),
                    Ok(CommandOutcome::SaveRequested) => {
                        let path = persist::save_screenshot(&args.screenshots, &annotated)?;
                        info!("screenshot saved to {}", path.display());
                    }
                    Err(err) => error!("command {command:?} failed: {err}"),
                },
            }
        }

        if args.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
        next = source.next_frame()?;
        index += 1;
    }

    info!("processed {processed} frames");
    Ok(())
}

fn read_baseline(path: &Path) -> Option<RgbImage> {
    match image::open(path) {
        Ok(image) => Some(image.to_rgb8()),
        Err(err) => {
            warn!("baseline {} unreadable: {err}", path.display());
            None
        }
    }
}

fn log_spots(report: &FrameReport) {
    for spot in &report.spots {
        debug!(
            "{}: {} (edge {:.4}, diff {:.4})",
            spot.name,
            if spot.confirmed_occupied { "OCCUPIED" } else { "FREE" },
            spot.edge_ratio,
            spot.diff_ratio
        );
    }
    if !report.patched.is_empty() {
        debug!("baseline repaired for {:?}", report.patched);
    }
}

fn cmd_capture_baseline(frames: &Path, out: &Path) -> Result<()> {
    let mut source = DirectoryFrameSource::open(frames)?;
    let Some(frame) = source.next_frame()? else {
        bail!("could not capture a baseline: no frames in {}", frames.display());
    };
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    frame
        .save(out)
        .with_context(|| format!("writing baseline {}", out.display()))?;
    info!("baseline saved to {}", out.display());
    Ok(())
}

fn cmd_check_regions(regions_path: &Path, frame_path: &Path) -> Result<()> {
    let regions = load_regions(regions_path)
        .with_context(|| format!("loading regions {}", regions_path.display()))?;
    let (width, height) = image::image_dimensions(frame_path)
        .with_context(|| format!("reading {}", frame_path.display()))?;

    let mut problems = 0;
    let mut seen = std::collections::HashSet::new();
    for region in &regions {
        if !seen.insert(region.id) {
            error!("region id {} appears more than once", region.id);
            problems += 1;
        }
        if !region.fits_within(width, height) {
            error!(
                "region {} ({}) at {},{} {}x{} leaves the {width}x{height} frame",
                region.id, region.name, region.x, region.y, region.w, region.h
            );
            problems += 1;
        } else if region.is_degenerate() {
            warn!("region {} ({}) covers no pixels", region.id, region.name);
        }
    }
    if problems > 0 {
        bail!("{problems} problem(s) in {}", regions_path.display());
    }
    info!("{} regions fit the {width}x{height} frame", regions.len());
    Ok(())
}
