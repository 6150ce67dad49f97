//! A deterministic simulator driven by a script of parameters.
//!
//! It backs the `vecsim-worker` executable and the tests of the pool. Every
//! observation is a pure function of the episode seed and the number of
//! applied actions, so results can be checked from the controller side.
use super::{EpisodeInfo, Frame, Observation, Simulator};
use crate::pool::{PoolConfig, SimulatorConfig};
use anyhow::{bail, Result};
use log::trace;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, thread, time::Duration};

/// Parameters of [`ScriptedSimulator`], read from [`SimulatorConfig::params`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedParams {
    /// Number of low-level steps after which an episode is truncated.
    pub step_limit: usize,

    /// Episode step (1-based) at which the task succeeds.
    pub success_at: Option<usize>,

    /// Seeds for which episode setup fails.
    pub fail_seeds: Vec<u64>,

    /// Makes every action application fail.
    pub fail_actions: bool,

    /// Delay of every observation in milliseconds.
    pub observe_delay_ms: u64,

    /// Number of cameras.
    pub num_cameras: usize,

    /// Height of camera images.
    pub camera_height: usize,

    /// Width of camera images.
    pub camera_width: usize,

    /// Dimension of the state vector.
    pub state_dim: usize,

    /// Dimension of the pose.
    pub pose_dim: usize,
}

impl Default for ScriptedParams {
    fn default() -> Self {
        Self {
            step_limit: 100,
            success_at: None,
            fail_seeds: vec![],
            fail_actions: false,
            observe_delay_ms: 0,
            num_cameras: 3,
            camera_height: 240,
            camera_width: 320,
            state_dim: 14,
            pose_dim: 6,
        }
    }
}

impl ScriptedParams {
    /// Parameters producing observations of the shape expected by `config`.
    pub fn for_pool(config: &PoolConfig) -> Self {
        Self {
            num_cameras: config.cameras.len(),
            camera_height: config.camera_height,
            camera_width: config.camera_width,
            state_dim: config.state_dim,
            pose_dim: config.trajectory_dim,
            ..Self::default()
        }
    }

    /// Sets the step limit.
    pub fn step_limit(mut self, v: usize) -> Self {
        self.step_limit = v;
        self
    }

    /// Sets the step at which the task succeeds.
    pub fn success_at(mut self, v: Option<usize>) -> Self {
        self.success_at = v;
        self
    }

    /// Sets the seeds whose setup fails.
    pub fn fail_seeds(mut self, v: Vec<u64>) -> Self {
        self.fail_seeds = v;
        self
    }

    /// Makes action application fail.
    pub fn fail_actions(mut self, v: bool) -> Self {
        self.fail_actions = v;
        self
    }

    /// Sets the observation delay.
    pub fn observe_delay_ms(mut self, v: u64) -> Self {
        self.observe_delay_ms = v;
        self
    }
}

/// Simulator whose behaviour is fixed by [`ScriptedParams`].
pub struct ScriptedSimulator {
    task_name: String,
    params: ScriptedParams,
    seed: u64,
    steps: usize,
    instruction: Option<String>,
    closed: bool,
}

impl ScriptedSimulator {
    /// Instruction currently applied.
    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref()
    }

    /// Pixel value of frames for the given seed and step.
    pub fn pixel(seed: u64, steps: usize) -> u8 {
        ((seed as usize * 16 + steps) % 256) as u8
    }
}

impl Simulator for ScriptedSimulator {
    fn build(task_name: &str, config: &SimulatorConfig) -> Result<Self> {
        let params = match &config.params {
            serde_yaml::Value::Null => ScriptedParams::default(),
            v => serde_yaml::from_value(v.clone())?,
        };
        Ok(Self {
            task_name: task_name.to_string(),
            params,
            seed: 0,
            steps: 0,
            instruction: None,
            closed: false,
        })
    }

    fn setup(&mut self, episode: u64, seed: u64) -> Result<EpisodeInfo> {
        if self.params.fail_seeds.contains(&seed) {
            bail!("setup of {} failed for seed {}", self.task_name, seed);
        }
        self.seed = seed;
        self.steps = 0;

        let mut instructions = HashMap::new();
        instructions.insert(
            "seen".to_string(),
            vec![format!("{} (episode {})", self.task_name, episode)],
        );
        instructions.insert(
            "unseen".to_string(),
            vec![
                format!("do {} in episode {}", self.task_name, episode),
                format!("complete {} with seed {}", self.task_name, seed),
            ],
        );
        Ok(EpisodeInfo { instructions })
    }

    fn set_instruction(&mut self, instruction: &str) -> Result<()> {
        self.instruction = Some(instruction.to_string());
        Ok(())
    }

    fn observe(&mut self) -> Result<Observation> {
        if self.closed {
            bail!("simulator is closed");
        }
        if self.params.observe_delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.params.observe_delay_ms));
        }
        let p = &self.params;
        let value = Self::pixel(self.seed, self.steps);
        let mut state = vec![0.0; p.state_dim];
        if let Some(v) = state.get_mut(0) {
            *v = self.steps as f64;
        }
        if let Some(v) = state.get_mut(1) {
            *v = self.seed as f64;
        }
        Ok(Observation {
            frames: vec![Frame::filled(p.camera_height, p.camera_width, value); p.num_cameras],
            state,
            pose: vec![self.steps as f64; p.pose_dim],
        })
    }

    fn apply_action(&mut self, action: &[f64]) -> Result<bool> {
        trace!("apply_action({:?})", action);
        self.steps += 1;
        if self.params.fail_actions {
            bail!("action {} rejected", self.steps);
        }
        Ok(self.params.success_at == Some(self.steps))
    }

    fn step_limit(&self) -> usize {
        self.params.step_limit
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
