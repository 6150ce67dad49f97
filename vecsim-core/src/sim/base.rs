use crate::pool::SimulatorConfig;
use anyhow::Result;
use std::collections::HashMap;

/// An RGB (or BGR, depending on the simulator) image in `H x W x 3` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Height.
    pub height: usize,

    /// Width.
    pub width: usize,

    /// Pixels, row-major with interleaved channels.
    pub data: Vec<u8>,
}

impl Frame {
    /// Creates a frame with every byte set to `value`.
    pub fn filled(height: usize, width: usize, value: u8) -> Self {
        Self {
            height,
            width,
            data: vec![value; height * width * 3],
        }
    }

    /// Returns a copy with the channel order of every pixel reversed.
    pub fn reversed_channels(&self) -> Self {
        let mut data = self.data.clone();
        for px in data.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
        Self {
            height: self.height,
            width: self.width,
            data,
        }
    }
}

/// Observation of one simulator instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// One frame per camera, in the camera order of the pool configuration.
    pub frames: Vec<Frame>,

    /// Joint state vector.
    pub state: Vec<f64>,

    /// End-effector pose used for the auxiliary trajectory.
    pub pose: Vec<f64>,
}

/// Information about a freshly set up episode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpisodeInfo {
    /// Candidate instructions keyed by instruction type, e.g. `seen` and `unseen`.
    pub instructions: HashMap<String, Vec<String>>,
}

/// A step-based simulator driven by one worker.
///
/// Every method may fail; the retry policy lives in
/// [`EnvAdapter`](crate::EnvAdapter), not here.
pub trait Simulator: Sized {
    /// Constructs a task instance. This is where task, embodiment and camera
    /// configuration is resolved.
    fn build(task_name: &str, config: &SimulatorConfig) -> Result<Self>;

    /// Sets up the episode with the given index and seed.
    fn setup(&mut self, episode: u64, seed: u64) -> Result<EpisodeInfo>;

    /// Applies the instruction of the episode.
    fn set_instruction(&mut self, instruction: &str) -> Result<()>;

    /// Returns the current observation.
    fn observe(&mut self) -> Result<Observation>;

    /// Applies one low-level action and returns `true` if the task succeeded.
    fn apply_action(&mut self, action: &[f64]) -> Result<bool>;

    /// Number of low-level steps after which an episode is truncated.
    fn step_limit(&self) -> usize;

    /// Releases simulator resources.
    fn close(&mut self) -> Result<()>;

    /// Drops cached device memory of the process before a retry.
    fn release_cache() {}
}
