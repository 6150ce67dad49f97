//! Wrapper of one simulator instance.
use crate::{
    pool::SimulatorConfig,
    sim::{EpisodeInfo, Observation, Simulator},
};
use anyhow::{anyhow, Result};
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};

/// Progress of the current episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeState {
    /// Number of low-level actions applied in the episode.
    pub finish_step: usize,

    /// The episode has not ended yet.
    pub active: bool,

    /// The episode ended with success.
    pub complete: bool,
}

impl Default for EpisodeState {
    fn default() -> Self {
        Self {
            finish_step: 0,
            active: true,
            complete: false,
        }
    }
}

/// Flags describing how a step ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepInfo {
    /// The task succeeded.
    pub success: bool,

    /// Neither success nor timeout.
    pub fail: bool,

    /// The step ceiling was reached without success.
    pub timeout: bool,
}

/// Result of [`EnvAdapter::step`].
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Observation after the actions, `None` if it could not be refreshed.
    pub obs: Option<Observation>,

    /// Sparse reward, 1.0 on success.
    pub reward: f64,

    /// The episode ended with success.
    pub terminated: bool,

    /// The episode reached the step ceiling without success.
    pub truncated: bool,

    /// Step flags.
    pub info: StepInfo,
}

struct Inner<S> {
    sim: Option<S>,
    state: EpisodeState,
    instruction: Option<String>,
}

/// Owns one simulator instance and applies the retry policy around it.
///
/// Every call takes the adapter's own lock. [`EnvAdapter::initialize`] also
/// takes `init_lock`, shared by every adapter that lives in the same process,
/// because simulator setup is not re-entrant.
pub struct EnvAdapter<S: Simulator> {
    task_name: String,
    config: SimulatorConfig,
    episode: u64,
    seed: u64,
    init_lock: Arc<Mutex<()>>,
    inner: Mutex<Inner<S>>,
}

impl<S: Simulator> EnvAdapter<S> {
    /// Creates an adapter for an episode. No simulator is built until
    /// [`EnvAdapter::initialize`].
    pub fn new(
        task_name: impl Into<String>,
        config: SimulatorConfig,
        episode: u64,
        seed: u64,
        init_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            task_name: task_name.into(),
            config,
            episode,
            seed,
            init_lock,
            inner: Mutex::new(Inner {
                sim: None,
                state: EpisodeState::default(),
                instruction: None,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<S>>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("adapter lock of {} is poisoned", self.task_name))
    }

    fn build_and_setup(&self) -> Result<(S, EpisodeInfo)> {
        let mut sim = S::build(&self.task_name, &self.config)?;
        match sim.setup(self.episode, self.seed) {
            Ok(info) => Ok((sim, info)),
            Err(e) => {
                if let Err(e) = sim.close() {
                    debug!("close after failed setup: {:#}", e);
                }
                Err(e)
            }
        }
    }

    /// Builds the simulator, sets up the episode and applies its instruction.
    ///
    /// A failed construction is retried once after releasing cached memory.
    /// The second failure is returned.
    pub fn initialize(&self) -> Result<()> {
        let _guard = self
            .init_lock
            .lock()
            .map_err(|_| anyhow!("construction lock is poisoned"))?;
        let mut inner = self.lock()?;

        let (mut sim, info) = match self.build_and_setup() {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "setup of {} (episode {}, seed {}) failed, retrying: {:#}",
                    self.task_name, self.episode, self.seed, e
                );
                S::release_cache();
                self.build_and_setup()?
            }
        };

        let instruction = self.choose_instruction(&info);
        sim.set_instruction(&instruction)?;
        debug!(
            "initialized {} episode {} seed {}: {}",
            self.task_name, self.episode, self.seed, instruction
        );

        inner.sim = Some(sim);
        inner.state = EpisodeState::default();
        inner.instruction = Some(instruction);
        Ok(())
    }

    /// Picks the instruction from the candidates of the configured type.
    ///
    /// The choice depends only on the episode index and the seed.
    fn choose_instruction(&self, info: &EpisodeInfo) -> String {
        match info.instructions.get(&self.config.instruction_type) {
            Some(candidates) if !candidates.is_empty() => {
                let rng =
                    fastrand::Rng::with_seed(self.episode.wrapping_mul(0x9e37_79b9) ^ self.seed);
                candidates[rng.usize(..candidates.len())].clone()
            }
            _ => {
                warn!(
                    "no `{}` instruction for {}, using the task name",
                    self.config.instruction_type, self.task_name
                );
                self.task_name.clone()
            }
        }
    }

    /// Returns the current observation, retrying once after releasing cached memory.
    pub fn get_obs(&self) -> Result<Observation> {
        let mut inner = self.lock()?;
        let sim = inner
            .sim
            .as_mut()
            .ok_or_else(|| anyhow!("{} is not initialized", self.task_name))?;
        match sim.observe() {
            Ok(obs) => Ok(obs),
            Err(e) => {
                warn!("observation of {} failed, retrying: {:#}", self.task_name, e);
                S::release_cache();
                sim.observe()
            }
        }
    }

    /// Applies `actions` in order.
    ///
    /// An action that fails counts as no success and the remaining actions are
    /// still applied. Application stops at the first success. The observation
    /// is refreshed afterwards whatever happened to the actions.
    pub fn step(&self, actions: &[&[f64]]) -> Result<StepOutcome> {
        let mut inner = self.lock()?;
        let Inner { sim, state, .. } = &mut *inner;
        let sim = sim
            .as_mut()
            .ok_or_else(|| anyhow!("{} is not initialized", self.task_name))?;

        let mut success = false;
        for action in actions {
            match sim.apply_action(action) {
                Ok(true) => {
                    success = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => warn!("action execution error in {}: {:#}", self.task_name, e),
            }
        }

        let obs = match sim.observe() {
            Ok(obs) => Some(obs),
            Err(e) => {
                warn!("observation of {} failed: {:#}", self.task_name, e);
                None
            }
        };

        state.finish_step += actions.len();
        let timeout = state.finish_step >= sim.step_limit();
        let terminated = success;
        let truncated = timeout && !terminated;
        if terminated || truncated {
            state.active = false;
            state.complete = success;
        }

        Ok(StepOutcome {
            obs,
            reward: if success { 1.0 } else { 0.0 },
            terminated,
            truncated,
            info: StepInfo {
                success,
                fail: !success && !timeout,
                timeout: timeout && !success,
            },
        })
    }

    /// Releases the simulator. Errors are logged; calling it twice is harmless.
    pub fn close(&self) {
        let sim = match self.lock() {
            Ok(mut inner) => inner.sim.take(),
            Err(e) => {
                warn!("{:#}", e);
                None
            }
        };
        if let Some(mut sim) = sim {
            if let Err(e) = sim.close() {
                warn!("closing {} failed: {:#}", self.task_name, e);
            }
        }
    }

    /// Progress of the current episode.
    pub fn episode_state(&self) -> Result<EpisodeState> {
        Ok(self.lock()?.state)
    }

    /// Instruction of the current episode.
    pub fn instruction(&self) -> Result<Option<String>> {
        Ok(self.lock()?.instruction.clone())
    }

    /// Seed of the episode.
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{Frame, ScriptedParams, ScriptedSimulator};
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn adapter(params: ScriptedParams, seed: u64) -> EnvAdapter<ScriptedSimulator> {
        let params = ScriptedParams {
            camera_height: 2,
            camera_width: 2,
            ..params
        };
        let config = SimulatorConfig::default().params(&params).unwrap();
        EnvAdapter::new("place_shoe", config, seed, seed, Arc::new(Mutex::new(())))
    }

    static SETUP_FAILURES: AtomicUsize = AtomicUsize::new(0);
    static OBSERVE_FAILURES: AtomicUsize = AtomicUsize::new(0);

    /// Fails setup and observation as many times as the counters say.
    struct FlakySim;

    impl Simulator for FlakySim {
        fn build(_: &str, _: &SimulatorConfig) -> Result<Self> {
            Ok(FlakySim)
        }

        fn setup(&mut self, _: u64, _: u64) -> Result<EpisodeInfo> {
            if SETUP_FAILURES
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("device busy");
            }
            Ok(EpisodeInfo::default())
        }

        fn set_instruction(&mut self, _: &str) -> Result<()> {
            Ok(())
        }

        fn observe(&mut self) -> Result<Observation> {
            if OBSERVE_FAILURES
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("render failed");
            }
            Ok(Observation {
                frames: vec![Frame::filled(1, 1, 0)],
                state: vec![],
                pose: vec![],
            })
        }

        fn apply_action(&mut self, _: &[f64]) -> Result<bool> {
            Ok(false)
        }

        fn step_limit(&self) -> usize {
            10
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_initialize_retries_once() -> Result<()> {
        SETUP_FAILURES.store(1, Ordering::SeqCst);
        OBSERVE_FAILURES.store(1, Ordering::SeqCst);
        let adapter: EnvAdapter<FlakySim> = EnvAdapter::new(
            "flaky",
            SimulatorConfig::default(),
            0,
            0,
            Arc::new(Mutex::new(())),
        );
        adapter.initialize()?;
        assert_eq!(adapter.instruction()?, Some("flaky".to_string()));
        adapter.get_obs()?;
        Ok(())
    }

    #[test]
    fn test_initialize_fails_twice() {
        let adapter = adapter(ScriptedParams::default().fail_seeds(vec![7]), 7);
        assert!(adapter.initialize().is_err());
        assert!(adapter.get_obs().is_err());
    }

    #[test]
    fn test_instruction_is_deterministic() -> Result<()> {
        let a = adapter(ScriptedParams::default(), 3);
        let b = adapter(ScriptedParams::default(), 3);
        a.initialize()?;
        b.initialize()?;
        assert!(a.instruction()?.is_some());
        assert_eq!(a.instruction()?, b.instruction()?);
        Ok(())
    }

    #[test]
    fn test_step_success() -> Result<()> {
        let adapter = adapter(ScriptedParams::default().success_at(Some(2)), 0);
        adapter.initialize()?;
        let a = [0.0; 4];
        let out = adapter.step(&[&a])?;
        assert!(!out.terminated && !out.truncated);
        assert_eq!(out.reward, 0.0);
        assert!(out.info.fail);

        let out = adapter.step(&[&a, &a])?;
        assert!(out.terminated);
        assert!(!out.truncated);
        assert_eq!(out.reward, 1.0);
        assert!(out.info.success);
        let state = adapter.episode_state()?;
        assert!(!state.active);
        assert!(state.complete);
        assert_eq!(state.finish_step, 3);
        Ok(())
    }

    #[test]
    fn test_step_timeout() -> Result<()> {
        let adapter = adapter(ScriptedParams::default().step_limit(3), 0);
        adapter.initialize()?;
        let a = [0.0; 4];
        assert!(!adapter.step(&[&a, &a])?.truncated);
        let out = adapter.step(&[&a, &a])?;
        assert!(!out.terminated);
        assert!(out.truncated);
        assert!(out.info.timeout);
        assert_eq!(out.reward, 0.0);
        assert!(!adapter.episode_state()?.active);
        Ok(())
    }

    #[test]
    fn test_step_swallows_action_errors() -> Result<()> {
        let adapter = adapter(ScriptedParams::default().fail_actions(true), 0);
        adapter.initialize()?;
        let out = adapter.step(&[&[1.0]])?;
        assert!(out.obs.is_some());
        assert_eq!(out.reward, 0.0);
        assert!(!out.terminated);
        Ok(())
    }

    #[test]
    fn test_close_is_idempotent() -> Result<()> {
        let adapter = adapter(ScriptedParams::default(), 0);
        adapter.initialize()?;
        adapter.close();
        adapter.close();
        assert!(adapter.get_obs().is_err());
        Ok(())
    }
}
