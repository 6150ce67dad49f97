//! Controller of the worker pool.
use super::{ChunkStep, InfoBatch, ObsBatch, PoolConfig, PoolStep};
use crate::{
    codec::{ResultLayout, ResultRecord},
    error::PoolError,
    launcher::{terminate_all, WorkerHandle, WorkerLauncher, EXIT_GRACE},
    metrics::EpisodeTracker,
    obs::ImageProcessor,
    shm::{persisted_seed, SharedRegion},
    signal::{socket_name, ControllerLink, SignalServer},
    video::{tile_images, to_rgb_image, VideoRecorder},
    worker::WorkerArgs,
};
use anyhow::Result;
use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, Array3, Array5, ArrayView3, ArrayView4, Axis};
use std::{fs, path::PathBuf, time::Duration};

/// Resources of an initialized pool.
struct Running {
    config: PoolConfig,
    region: SharedRegion,
    config_path: PathBuf,
    link: ControllerLink,
    handles: Vec<Box<dyn WorkerHandle>>,
    layout: ResultLayout,
    processor: ImageProcessor,
    tracker: Option<EpisodeTracker>,
    video: Option<VideoRecorder>,

    /// Latest instruction reported by every worker.
    instructions: Vec<String>,
}

/// Outputs decoded from the result slots of all workers.
struct Gathered {
    obs: ObsBatch,
    reward: Array1<f64>,
    terminated: Array1<bool>,
    truncated: Array1<bool>,
    return_poses: Array3<f64>,
}

/// A vectorized environment whose instances run on separate workers.
///
/// Each call to [`SimPool::step`] is one cycle: actions are written into the
/// shared region, every worker receives a go signal, and the results are read
/// after every worker has reported done.
///
/// ```no_run
/// use vecsim_core::{PoolConfig, ProcessLauncher, SimPool};
///
/// # fn main() -> anyhow::Result<()> {
/// let config = PoolConfig::default().n_envs(4).horizon(5);
/// let mut pool = SimPool::build(ProcessLauncher::new("vecsim-worker"));
/// let (obs, _info) = pool.initialize(&config)?;
/// let step = pool.step(None)?;
/// pool.clear()?;
/// # Ok(())
/// # }
/// ```
pub struct SimPool<L: WorkerLauncher> {
    launcher: L,
    seed: u64,
    running: Option<Running>,
    broken: bool,
}

impl<L: WorkerLauncher> SimPool<L> {
    /// Creates a pool that starts workers with `launcher`. No worker runs
    /// before [`SimPool::initialize`].
    pub fn build(launcher: L) -> Self {
        Self {
            launcher,
            seed: 0,
            running: None,
            broken: false,
        }
    }

    /// Sets the value of the seed cursor used by the next [`SimPool::initialize`].
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Seed cursor carried over from the last [`SimPool::clear`].
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of environments, 0 if the pool is not initialized.
    pub fn n_envs(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.config.n_envs)
    }

    /// Current value of the shared seed cursor.
    pub fn seed_cursor(&self) -> Result<u64> {
        Ok(self.running()?.region.seed_cursor())
    }

    /// Starts the workers and returns the initial observations.
    ///
    /// An initialized pool is cleared first.
    pub fn initialize(&mut self, config: &PoolConfig) -> Result<(ObsBatch, InfoBatch)> {
        if self.broken {
            return Err(PoolError::PoolBroken.into());
        }
        if self.running.is_some() {
            info!("clearing the running pool before initialization");
            self.clear()?;
        }
        config.validate()?;

        match self.start(config) {
            Ok(running) => self.running = Some(running),
            Err(e) => {
                self.broken = true;
                return Err(e);
            }
        }

        let all: Vec<usize> = (0..config.n_envs).collect();
        self.cycle(&all)?;
        let g = self.gather()?;
        Ok((g.obs, self.info(g.return_poses)?))
    }

    fn start(&mut self, config: &PoolConfig) -> Result<Running> {
        let name = socket_name();
        let dir = config.resolved_shm_dir();
        let shm_path = dir.join(format!("{}.shm", name));
        let config_path = dir.join(format!("{}.yaml", name));

        let region = SharedRegion::create(&shm_path, config.region_shape(), self.seed)?;
        let remove_files = |region: SharedRegion| {
            if let Err(e) = region.remove() {
                warn!("{:#}", e);
            }
            if let Err(e) = fs::remove_file(&config_path) {
                debug!("removing {:?}: {}", config_path, e);
            }
        };
        let server = match config
            .save(&config_path)
            .and_then(|_| SignalServer::bind(name.clone()))
        {
            Ok(server) => server,
            Err(e) => {
                remove_files(region);
                return Err(e);
            }
        };

        let mut handles: Vec<Box<dyn WorkerHandle>> = vec![];
        let mut launched = Ok(());
        for index in 0..config.n_envs {
            let args = WorkerArgs {
                index,
                socket_name: name.clone(),
                shm_path: shm_path.clone(),
                config: config.clone(),
            };
            match self.launcher.launch(&args, &config_path) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    launched = Err(PoolError::Handshake(format!(
                        "launching worker {}: {:#}",
                        index, e
                    )));
                    break;
                }
            }
        }

        let handshake = Duration::from_secs(config.handshake_timeout_secs);
        let link = launched
            .map_err(anyhow::Error::from)
            .and_then(|_| server.accept(config.n_envs, handshake));
        let link = match link {
            Ok(link) => link,
            Err(e) => {
                terminate_all(&mut handles, EXIT_GRACE);
                remove_files(region);
                return Err(e);
            }
        };
        info!("{} workers connected", config.n_envs);

        let layout = ResultLayout::new(config.record_shape());
        let processor =
            ImageProcessor::new(*layout.shape(), config.image_size, config.jpeg_quality);
        Ok(Running {
            config: config.clone(),
            region,
            config_path,
            link,
            handles,
            layout,
            processor,
            tracker: config
                .record_metrics
                .then(|| EpisodeTracker::new(config.n_envs)),
            video: config.video.clone().map(VideoRecorder::new),
            instructions: vec![String::new(); config.n_envs],
        })
    }

    fn running(&self) -> Result<&Running> {
        if self.broken {
            return Err(PoolError::PoolBroken.into());
        }
        Ok(self.running.as_ref().ok_or(PoolError::NotInitialized)?)
    }

    fn running_mut(&mut self) -> Result<&mut Running> {
        if self.broken {
            return Err(PoolError::PoolBroken.into());
        }
        Ok(self.running.as_mut().ok_or(PoolError::NotInitialized)?)
    }

    /// Runs one cycle on the given workers. Any failure breaks the pool.
    fn cycle(&mut self, indices: &[usize]) -> Result<()> {
        let running = self.running()?;
        let timeout = running.config.cycle_timeout_secs.map(Duration::from_secs);
        match running.link.cycle(indices, timeout) {
            Ok(instructions) => {
                let running = self.running_mut()?;
                for (&i, instruction) in indices.iter().zip(instructions) {
                    running.instructions[i] = instruction;
                }
                Ok(())
            }
            Err(e) => {
                warn!("cycle failed, the pool is broken: {:#}", e);
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Decodes and post-processes the result slots of all workers.
    fn gather(&self) -> Result<Gathered> {
        let running = self.running()?;
        let config = &running.config;
        let n = config.n_envs;
        let [num_images, channels, height, width] = running.processor.output_shape();

        let mut images = Array5::zeros((n, num_images, channels, height, width));
        let mut state = Vec::with_capacity(n * config.state_dim);
        let mut poses = Vec::with_capacity(n * config.horizon * config.trajectory_dim);
        let mut reward = Array1::zeros(n);
        let mut terminated = Array1::from_elem(n, false);
        let mut truncated = Array1::from_elem(n, false);

        for i in 0..n {
            let ResultRecord {
                images: raw,
                state: s,
                reward: r,
                terminated: te,
                truncated: tr,
                trajectory,
            } = running.layout.decode(running.region.result_slot(i))?;
            running
                .processor
                .process_into(&raw, images.index_axis_mut(Axis(0), i))?;
            state.extend(s);
            poses.extend(trajectory);
            reward[i] = r;
            terminated[i] = te;
            truncated[i] = tr;
        }

        Ok(Gathered {
            obs: ObsBatch {
                images,
                state: Array2::from_shape_vec((n, config.state_dim), state)?,
                task_descriptions: running.instructions.clone(),
            },
            reward,
            terminated,
            truncated,
            return_poses: Array3::from_shape_vec(
                (n, config.horizon, config.trajectory_dim),
                poses,
            )?,
        })
    }

    fn info(&self, return_poses: Array3<f64>) -> Result<InfoBatch> {
        let running = self.running()?;
        Ok(InfoBatch {
            return_poses,
            episode: running.tracker.as_ref().map(|t| t.stats().clone()),
        })
    }

    /// Adds the after image of the first camera of every environment as a video frame.
    fn record_frame(&mut self, obs: &ObsBatch) -> Result<()> {
        let running = self.running_mut()?;
        let cameras = running.config.cameras.len();
        if let Some(video) = running.video.as_mut() {
            let frames: Vec<_> = obs
                .images
                .outer_iter()
                .map(|env| to_rgb_image(env.slice(s![cameras, .., .., ..])))
                .collect();
            let nrows = ((frames.len() as f64).sqrt() as usize).max(1);
            video.add_frame(tile_images(&frames, nrows)?);
        }
        Ok(())
    }

    /// Runs one chunk of actions `[n_envs, horizon, action_dim]` on every environment.
    ///
    /// Without actions every environment receives zero actions and the
    /// returned reward is `None`.
    pub fn step(&mut self, actions: Option<ArrayView3<f64>>) -> Result<PoolStep> {
        let running = self.running_mut()?;
        let c = &running.config;
        let expected = [c.n_envs, c.horizon, c.action_dim];
        let flat = match &actions {
            Some(actions) => {
                if actions.shape() != expected {
                    return Err(PoolError::ShapeMismatch {
                        expected: expected.to_vec(),
                        actual: actions.shape().to_vec(),
                    }
                    .into());
                }
                actions.iter().copied().collect()
            }
            None => vec![0.0; expected.iter().product()],
        };
        running.region.write_actions(&flat)?;

        let all: Vec<usize> = (0..expected[0]).collect();
        self.cycle(&all)?;
        let g = self.gather()?;

        let running = self.running_mut()?;
        if actions.is_some() {
            if let Some(tracker) = running.tracker.as_mut() {
                let (rewards, terminated) = (g.reward.to_vec(), g.terminated.to_vec());
                tracker.update(&rewards, &terminated);
            }
        }
        self.record_frame(&g.obs)?;

        Ok(PoolStep {
            info: self.info(g.return_poses)?,
            obs: g.obs,
            reward: actions.map(|_| g.reward),
            terminated: g.terminated,
            truncated: g.truncated,
        })
    }

    /// Starts a new episode with a fresh seed on every environment.
    pub fn reset(&mut self) -> Result<(ObsBatch, InfoBatch)> {
        let all: Vec<usize> = (0..self.running()?.config.n_envs).collect();
        self.reset_envs(&all)
    }

    /// Starts a new episode with a fresh seed on the given environments.
    ///
    /// Only those workers run a cycle; the outputs of the other environments
    /// are the ones of their latest cycle.
    pub fn reset_envs(&mut self, indices: &[usize]) -> Result<(ObsBatch, InfoBatch)> {
        let running = self.running()?;
        let n_envs = running.config.n_envs;
        let mut targets = indices.to_vec();
        targets.sort_unstable();
        targets.dedup();
        if let Some(&index) = targets.iter().find(|&&i| i >= n_envs) {
            return Err(PoolError::IndexOutOfRange { index, n_envs }.into());
        }
        debug!("resetting environments {:?}", targets);

        for &i in &targets {
            running.region.set_reset(i, true);
        }
        let res = self.cycle(&targets);
        if let Some(running) = self.running.as_ref() {
            for &i in &targets {
                running.region.set_reset(i, false);
            }
        }
        res?;

        if let Some(tracker) = self.running_mut()?.tracker.as_mut() {
            tracker.reset(&targets);
        }
        let g = self.gather()?;
        Ok((g.obs, self.info(g.return_poses)?))
    }

    /// Runs `chunks` consecutive steps from actions `[n_envs, chunks, horizon, action_dim]`.
    ///
    /// Termination and truncation are reported at the last position of the
    /// chunk axis; `done_step` holds the sub-step at which each environment
    /// actually ended. With `auto_reset`, environments truncated at the last
    /// sub-step are reset and the returned observations are the ones after
    /// the reset.
    pub fn chunk_step(&mut self, actions: ArrayView4<f64>) -> Result<ChunkStep> {
        let c = &self.running()?.config;
        let (n, k) = (c.n_envs, actions.shape()[1]);
        let expected = [n, k.max(1), c.horizon, c.action_dim];
        if k == 0 || actions.shape() != expected {
            return Err(PoolError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: actions.shape().to_vec(),
            }
            .into());
        }
        let auto_reset = c.auto_reset;

        let mut rewards = Array2::zeros((n, k));
        let mut raw_terminated = Array2::from_elem((n, k), false);
        let mut raw_truncated = Array2::from_elem((n, k), false);
        let mut last = None;
        for j in 0..k {
            let step = self.step(Some(actions.index_axis(Axis(1), j)))?;
            if let Some(reward) = step.reward.as_ref() {
                rewards.column_mut(j).assign(reward);
            }
            raw_terminated.column_mut(j).assign(&step.terminated);
            raw_truncated.column_mut(j).assign(&step.truncated);
            last = Some(step);
        }

        let done_step: Vec<Option<usize>> = (0..n)
            .map(|i| (0..k).find(|&j| raw_terminated[[i, j]] || raw_truncated[[i, j]]))
            .collect();
        let mut terminated = Array2::from_elem((n, k), false);
        let mut truncated = Array2::from_elem((n, k), false);
        for i in 0..n {
            terminated[[i, k - 1]] = raw_terminated.row(i).iter().any(|&v| v);
            truncated[[i, k - 1]] = raw_truncated.row(i).iter().any(|&v| v);
        }

        let (mut obs, mut info) = match last {
            Some(step) => (step.obs, step.info),
            None => return Err(PoolError::Protocol("empty chunk".to_string()).into()),
        };
        if auto_reset {
            let targets: Vec<usize> = (0..n)
                .filter(|&i| raw_truncated[[i, k - 1]] && !raw_terminated[[i, k - 1]])
                .collect();
            if !targets.is_empty() {
                debug!("auto reset of {:?}", targets);
                (obs, info) = self.reset_envs(&targets)?;
            }
        }

        Ok(ChunkStep {
            obs,
            rewards,
            terminated,
            truncated,
            done_step,
            info,
        })
    }

    /// Writes the buffered video frames, see [`VideoRecorder::flush`].
    ///
    /// Returns `None` if frame logging is disabled.
    pub fn flush_video(&mut self, sub_dir: Option<&str>) -> Result<Option<PathBuf>> {
        let seed = self.seed;
        match self.running_mut()?.video.as_mut() {
            Some(video) => Ok(Some(video.flush(seed, sub_dir)?)),
            None => Ok(None),
        }
    }

    /// Stops every worker, keeps the seed cursor for the next initialization
    /// and removes the shared files.
    ///
    /// Clearing an uninitialized pool does nothing; clearing a broken pool
    /// makes it usable again.
    pub fn clear(&mut self) -> Result<()> {
        self.broken = false;
        let mut running = match self.running.take() {
            Some(running) => running,
            None => return Ok(()),
        };

        running.link.halt();
        terminate_all(&mut running.handles, EXIT_GRACE);

        self.seed = persisted_seed(running.region.seed_cursor());
        info!("pool cleared, next seed {}", self.seed);

        let Running {
            region,
            config_path,
            link,
            ..
        } = running;
        drop(link);
        region.remove()?;
        fs::remove_file(&config_path)?;
        Ok(())
    }
}

impl<L: WorkerLauncher> Drop for SimPool<L> {
    fn drop(&mut self) {
        if let Err(e) = self.clear() {
            warn!("clearing the pool: {:#}", e);
        }
    }
}
