//! Worker loop driving one simulator instance.
//!
//! A worker waits for a go signal, runs one cycle and publishes its result
//! record into its own slot of the shared region before sending done. A cycle
//! is one of:
//!
//! * the first cycle, which publishes the initial observation,
//! * a reset cycle, when the reset flag of the slot is set, which rebuilds the
//!   episode with a freshly claimed seed,
//! * a step cycle, which applies up to `horizon` actions from the slot's row of
//!   the action buffer and stops early when the episode terminates.
use crate::{
    adapter::EnvAdapter,
    codec::{fill_trajectory, ResultLayout, ResultRecord},
    error::PoolError,
    pool::PoolConfig,
    shm::SharedRegion,
    signal::{ToWorker, WorkerLink},
    sim::{Frame, Observation, Simulator},
};
use anyhow::Result;
use log::{debug, error, info, trace};
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

const RESEED_BACKOFF_MS: u64 = 100;
const RESEED_BACKOFF_MAX_MS: u64 = 5_000;

/// Everything a worker needs to attach to a pool.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    /// Slot of the worker.
    pub index: usize,

    /// Name of the controller's socket.
    pub socket_name: String,

    /// Path of the shared region file.
    pub shm_path: PathBuf,

    /// Configuration of the pool.
    pub config: PoolConfig,
}

/// Runs a worker until the controller halts it or goes away.
///
/// `init_lock` serializes simulator construction among workers of the same
/// process. An error the worker cannot recover from is reported to the
/// controller before it is returned.
pub fn run_worker<S: Simulator>(args: &WorkerArgs, init_lock: Arc<Mutex<()>>) -> Result<()> {
    let mut link = WorkerLink::connect(&args.socket_name, args.index)?;
    let mut worker = match Worker::<S>::build(args, init_lock) {
        Ok(worker) => worker,
        Err(e) => {
            error!("worker {} failed to start: {:#}", args.index, e);
            if let Err(e) = link.fatal(format!("{:#}", e)) {
                debug!("worker {} could not report failure: {:#}", args.index, e);
            }
            return Err(e);
        }
    };
    info!("worker {} ready", args.index);

    let res = loop {
        match link.wait() {
            Ok(ToWorker::Go) => {}
            Ok(ToWorker::Halt) => {
                info!("worker {} halted", args.index);
                break Ok(());
            }
            Err(e) => {
                info!("worker {} lost the controller: {:#}", args.index, e);
                break Ok(());
            }
        }

        match worker.cycle() {
            Ok(instruction) => {
                if let Err(e) = link.done(&instruction) {
                    break Err(e);
                }
            }
            Err(e) => {
                error!("worker {} failed: {:#}", args.index, e);
                if let Err(e) = link.fatal(format!("{:#}", e)) {
                    debug!("worker {} could not report failure: {:#}", args.index, e);
                }
                break Err(e);
            }
        }
    };

    worker.adapter.close();
    res
}

struct Worker<S: Simulator> {
    index: usize,
    config: PoolConfig,
    region: SharedRegion,
    layout: ResultLayout,
    init_lock: Arc<Mutex<()>>,
    adapter: EnvAdapter<S>,

    /// Observation the next chunk starts from, `None` before the first cycle.
    prev_obs: Option<Observation>,
}

impl<S: Simulator> Worker<S> {
    fn build(args: &WorkerArgs, init_lock: Arc<Mutex<()>>) -> Result<Self> {
        let config = args.config.clone();
        let region = SharedRegion::open(&args.shm_path, config.region_shape())?;
        let layout = ResultLayout::new(config.record_shape());
        let adapter = EnvAdapter::new(
            config.task_name.clone(),
            config.simulator.clone(),
            0,
            0,
            init_lock.clone(),
        );
        adapter.initialize()?;

        Ok(Self {
            index: args.index,
            config,
            region,
            layout,
            init_lock,
            adapter,
            prev_obs: None,
        })
    }

    /// Runs one cycle and returns the instruction of the current episode.
    fn cycle(&mut self) -> Result<String> {
        let record = if self.prev_obs.is_none() {
            trace!("worker {}: first cycle", self.index);
            let obs = self.adapter.get_obs()?;
            self.start_record(obs, false)?
        } else if self.region.reset_requested(self.index) {
            trace!("worker {}: reset cycle", self.index);
            let obs = self.reseed();
            self.start_record(obs, true)?
        } else {
            trace!("worker {}: step cycle", self.index);
            self.rollout()?
        };

        self.layout
            .encode(&record, self.region.result_slot_mut(self.index))?;
        Ok(self.adapter.instruction()?.unwrap_or_default())
    }

    /// Record of a freshly started episode. `truncated` marks a reset.
    fn start_record(&mut self, obs: Observation, truncated: bool) -> Result<ResultRecord> {
        self.check_observation(&obs)?;
        let frames = self.frames(&obs);
        let trajectory = fill_trajectory(
            obs.pose.clone(),
            self.config.horizon,
            self.config.trajectory_dim,
        );
        let record = ResultRecord::from_frames(
            &frames,
            &frames,
            obs.state.clone(),
            0.0,
            false,
            truncated,
            trajectory,
        );
        self.prev_obs = Some(obs);
        Ok(record)
    }

    fn rollout(&mut self) -> Result<ResultRecord> {
        let actions = self.region.read_actions(self.index);
        let prev = self
            .prev_obs
            .take()
            .ok_or_else(|| PoolError::Protocol("step before the first cycle".to_string()))?;

        let mut observations: Vec<Observation> = vec![];
        let mut poses = vec![];
        let (mut reward, mut terminated, mut truncated) = (0.0, false, false);
        for action in actions.chunks_exact(self.config.action_dim) {
            let out = self.adapter.step(&[action])?;
            // Keep the latest observation if it could not be refreshed
            let obs = match out.obs {
                Some(obs) => obs,
                None => observations.last().unwrap_or(&prev).clone(),
            };
            self.check_observation(&obs)?;
            poses.extend_from_slice(&obs.pose);
            observations.push(obs);

            reward = out.reward;
            terminated = out.terminated;
            truncated = out.truncated;
            if terminated {
                break;
            }
        }

        let n = observations.len();
        let after = observations.last().unwrap_or(&prev);
        let before = if n >= 2 { &observations[n - 2] } else { &prev };
        if poses.is_empty() {
            poses = prev.pose.clone();
        }

        let record = ResultRecord::from_frames(
            &self.frames(before),
            &self.frames(after),
            after.state.clone(),
            reward,
            terminated,
            truncated,
            fill_trajectory(poses, self.config.horizon, self.config.trajectory_dim),
        );

        let next = if terminated {
            debug!("worker {}: episode succeeded, reseeding", self.index);
            let obs = self.reseed();
            self.check_observation(&obs)?;
            obs
        } else {
            after.clone()
        };
        self.prev_obs = Some(next);
        Ok(record)
    }

    /// Replaces the episode with one built from a newly claimed seed.
    ///
    /// Retries with a fresh seed until construction succeeds.
    fn reseed(&mut self) -> Observation {
        let mut attempt: u64 = 0;
        loop {
            let seed = self.region.claim_seed();
            self.adapter.close();
            let adapter = EnvAdapter::new(
                self.config.task_name.clone(),
                self.config.simulator.clone(),
                seed,
                seed,
                self.init_lock.clone(),
            );
            match adapter.initialize().and_then(|_| adapter.get_obs()) {
                Ok(obs) => {
                    info!("worker {} started episode with seed {}", self.index, seed);
                    self.adapter = adapter;
                    return obs;
                }
                Err(e) => {
                    adapter.close();
                    attempt += 1;
                    error!(
                        "worker {} failed to reseed with seed {} (attempt {}): {:#}",
                        self.index, seed, attempt, e
                    );
                    let backoff = (RESEED_BACKOFF_MS * attempt).min(RESEED_BACKOFF_MAX_MS);
                    thread::sleep(Duration::from_millis(backoff));
                }
            }
        }
    }

    fn frames(&self, obs: &Observation) -> Vec<Frame> {
        if self.config.reverse_channels {
            obs.frames.iter().map(Frame::reversed_channels).collect()
        } else {
            obs.frames.clone()
        }
    }

    fn check_observation(&self, obs: &Observation) -> Result<()> {
        let c = &self.config;
        let frames_ok = obs.frames.len() == c.cameras.len()
            && obs
                .frames
                .iter()
                .all(|f| f.height == c.camera_height && f.width == c.camera_width);
        if !frames_ok {
            return Err(PoolError::LayoutMismatch(format!(
                "observation has {} frame(s), expected {} of {}x{}",
                obs.frames.len(),
                c.cameras.len(),
                c.camera_height,
                c.camera_width
            ))
            .into());
        }
        if obs.state.len() != c.state_dim || obs.pose.len() != c.trajectory_dim {
            return Err(PoolError::LayoutMismatch(format!(
                "observation has state {} and pose {}, expected {} and {}",
                obs.state.len(),
                obs.pose.len(),
                c.state_dim,
                c.trajectory_dim
            ))
            .into());
        }
        Ok(())
    }
}
