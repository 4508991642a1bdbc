// THEORY:
// Regions never read each other's pixels or state, so the expensive part of a
// frame (blur, Canny, HSV conversion, median) is embarrassingly parallel. This
// module fans the measurement stage out over a pool of blocking tokio tasks and
// keeps everything else sequential:
//
// 1.  Validate and align on the caller's task.
// 2.  Cut owned crops per region, then split them into one batch per worker.
// 3.  Measure each batch on `spawn_blocking` and join all batches.
// 4.  Re-order results by region index and hand them to the engine, which
//     applies votes, state transitions and baseline patches in region order.
//
// Because every measurement is a pure function of its crops and step 4 is the
// same code the sequential engine runs, the reports are identical to
// `OccupancyEngine::process_frame` for the same frames.

use futures::future::join_all;
use image::RgbImage;

use crate::core_modules::features::RawSignal;
use crate::error::{SpotError, SpotResult};
use crate::pipeline::{
    CommandOutcome, FrameReport, OccupancyEngine, OperatorCommand, RegionCrops, SignalSettings,
};

/// Occupancy engine that measures regions concurrently.
pub struct ParallelOccupancyEngine {
    engine: OccupancyEngine,
    workers: usize,
}

impl ParallelOccupancyEngine {
    /// One worker per logical CPU.
    pub fn new(engine: OccupancyEngine) -> Self {
        Self::with_workers(engine, num_cpus::get())
    }

    pub fn with_workers(engine: OccupancyEngine, workers: usize) -> Self {
        Self {
            engine,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn process_frame(&mut self, frame: &RgbImage) -> SpotResult<FrameReport> {
        let prepared = self.engine.prepare_frame(frame)?;
        let crops = self.engine.region_crops(&prepared, frame);
        let settings = SignalSettings::from(self.engine.config());
        let total = crops.len();

        let batch_size = total.div_ceil(self.workers).max(1);
        let mut batches: Vec<Vec<(usize, RegionCrops)>> = Vec::with_capacity(self.workers);
        let mut current = Vec::with_capacity(batch_size);
        for (index, crop) in crops.into_iter().enumerate() {
            current.push((index, crop));
            if current.len() == batch_size {
                batches.push(std::mem::replace(&mut current, Vec::with_capacity(batch_size)));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let handles = batches.into_iter().map(|batch| {
            tokio::task::spawn_blocking(move || {
                batch
                    .into_iter()
                    .map(|(index, crop)| (index, crop.measure(&settings)))
                    .collect::<Vec<_>>()
            })
        });

        let mut signals: Vec<Option<SpotResult<RawSignal>>> = (0..total).map(|_| None).collect();
        for joined in join_all(handles).await {
            let batch = joined.map_err(|e| SpotError::Worker(e.to_string()))?;
            for (index, signal) in batch {
                signals[index] = Some(signal);
            }
        }

        let signals = signals
            .into_iter()
            .enumerate()
            .map(|(index, signal)| {
                signal.unwrap_or_else(|| Err(SpotError::Worker(format!("no result for region index {index}"))))
            })
            .collect();

        self.engine.apply_signals(&prepared, frame, signals)
    }

    pub fn apply_command(&mut self, command: OperatorCommand, frame: &RgbImage) -> SpotResult<CommandOutcome> {
        self.engine.apply_command(command, frame)
    }

    pub fn engine(&self) -> &OccupancyEngine {
        &self.engine
    }

    pub fn into_inner(self) -> OccupancyEngine {
        self.engine
    }
}
