#![warn(missing_docs)]
//! A vectorized pool of simulator environments.
//!
//! [`SimPool`] drives `n_envs` simulator instances, each owned by a worker.
//! Workers run as separate processes ([`ProcessLauncher`]) or threads
//! ([`ThreadLauncher`]) and exchange data with the controller through a shared
//! memory region:
//!
//! * the controller writes a chunk of actions per environment into the region
//!   and sends a go signal to every worker,
//! * each worker applies its actions to its [`Simulator`] through an
//!   [`EnvAdapter`], writes a fixed-size result record into its own slot and
//!   replies done,
//! * once every worker has replied the controller decodes the records with
//!   [`ResultLayout`] and returns batched observations.
//!
//! Episodes that end with success are restarted by their worker with a new
//! seed within the same cycle. Seeds come from a cursor in the shared region
//! and are carried over from one pool to the next by [`SimPool::clear`].
pub mod adapter;
pub mod codec;
pub mod error;
pub mod launcher;
pub mod metrics;
pub mod obs;
pub mod pool;
pub mod shm;
pub mod signal;
pub mod sim;
pub mod video;
pub mod worker;

pub use adapter::{EnvAdapter, EpisodeState, StepInfo, StepOutcome};
pub use codec::{RecordShape, ResultLayout, ResultRecord};
pub use error::PoolError;
pub use launcher::{ProcessLauncher, ThreadLauncher, WorkerHandle, WorkerLauncher};
pub use metrics::{EpisodeStats, EpisodeTracker};
pub use pool::{ChunkStep, InfoBatch, ObsBatch, PoolConfig, PoolStep, SimPool, SimulatorConfig};
pub use sim::{EpisodeInfo, Frame, Observation, ScriptedParams, ScriptedSimulator, Simulator};
pub use video::VideoConfig;
pub use worker::{run_worker, WorkerArgs};
