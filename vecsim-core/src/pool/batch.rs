//! Batched outputs of [`SimPool`](super::SimPool).
use crate::metrics::EpisodeStats;
use ndarray::{Array1, Array2, Array3, Array5};

/// Observations of all environments.
#[derive(Debug, Clone, PartialEq)]
pub struct ObsBatch {
    /// Images `[n_envs, 2 * cameras, 3, height, width]`. The first half of the
    /// second axis holds the images before the last step of the chunk, the
    /// second half the images after it.
    pub images: Array5<u8>,

    /// States `[n_envs, state_dim]`.
    pub state: Array2<f64>,

    /// Instruction of the current episode of every environment.
    pub task_descriptions: Vec<String>,
}

/// Auxiliary outputs of all environments.
#[derive(Debug, Clone, PartialEq)]
pub struct InfoBatch {
    /// Poses visited during the chunk `[n_envs, horizon, trajectory_dim]`.
    pub return_poses: Array3<f64>,

    /// Episode statistics, if recorded.
    pub episode: Option<EpisodeStats>,
}

/// Output of [`SimPool::step`](super::SimPool::step).
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStep {
    /// Observations.
    pub obs: ObsBatch,

    /// Rewards, `None` when the step was taken without actions.
    pub reward: Option<Array1<f64>>,

    /// Episodes that ended with success.
    pub terminated: Array1<bool>,

    /// Episodes that reached the step ceiling.
    pub truncated: Array1<bool>,

    /// Auxiliary outputs.
    pub info: InfoBatch,
}

/// Output of [`SimPool::chunk_step`](super::SimPool::chunk_step).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkStep {
    /// Observations after the last sub-step, or after the automatic reset.
    pub obs: ObsBatch,

    /// Rewards `[n_envs, chunks]`.
    pub rewards: Array2<f64>,

    /// `[n_envs, chunks]`, set only at the last position, for environments
    /// that terminated at any sub-step.
    pub terminated: Array2<bool>,

    /// `[n_envs, chunks]`, set only at the last position, for environments
    /// that were truncated at any sub-step.
    pub truncated: Array2<bool>,

    /// First sub-step at which each environment ended, if any.
    pub done_step: Vec<Option<usize>>,

    /// Auxiliary outputs.
    pub info: InfoBatch,
}
