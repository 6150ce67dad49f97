//! Configuration of [`SimPool`](super::SimPool).
use crate::{
    codec::{RecordShape, ResultLayout},
    error::PoolError,
    shm::RegionShape,
    video::VideoConfig,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

/// Settings handed to the simulator when an episode is built.
///
/// Task, embodiment and camera files are resolved by the simulator itself;
/// the pool only carries the identifiers.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct SimulatorConfig {
    /// Task configuration identifier.
    pub task_config: String,

    /// Checkpoint setting identifier.
    pub ckpt_setting: String,

    /// Which instruction set the episode instruction is drawn from.
    pub instruction_type: String,

    /// Simulator specific settings.
    #[serde(default)]
    pub params: serde_yaml::Value,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            task_config: "demo_clean".to_string(),
            ckpt_setting: "demo_clean".to_string(),
            instruction_type: "unseen".to_string(),
            params: serde_yaml::Value::Null,
        }
    }
}

impl SimulatorConfig {
    /// Sets the task configuration identifier.
    pub fn task_config(mut self, v: impl Into<String>) -> Self {
        self.task_config = v.into();
        self
    }

    /// Sets the checkpoint setting identifier.
    pub fn ckpt_setting(mut self, v: impl Into<String>) -> Self {
        self.ckpt_setting = v.into();
        self
    }

    /// Sets the instruction type.
    pub fn instruction_type(mut self, v: impl Into<String>) -> Self {
        self.instruction_type = v.into();
        self
    }

    /// Sets simulator specific settings from any serializable value.
    pub fn params<T: Serialize>(mut self, v: &T) -> Result<Self> {
        self.params = serde_yaml::to_value(v)?;
        Ok(self)
    }
}

/// Configuration of [`SimPool`](super::SimPool).
///
/// Every worker receives the same configuration, so the result layout derived
/// from it is identical on both sides of the shared region.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct PoolConfig {
    /// Number of environments, one worker each.
    pub n_envs: usize,

    /// Maximum number of low-level steps per chunk.
    pub horizon: usize,

    /// Dimension of a low-level action.
    pub action_dim: usize,

    /// Name of the task built by the simulator.
    pub task_name: String,

    /// Camera names, in the order they are packed into a record.
    pub cameras: Vec<String>,

    /// Height of a captured camera image.
    pub camera_height: usize,

    /// Width of a captured camera image.
    pub camera_width: usize,

    /// Dimension of the state vector.
    pub state_dim: usize,

    /// Dimension of one pose of the auxiliary trajectory.
    pub trajectory_dim: usize,

    /// Size `(height, width)` of images handed to the caller.
    pub image_size: (usize, usize),

    /// JPEG quality used to recode images. `None` skips recoding.
    pub jpeg_quality: Option<u8>,

    /// Flips the channel order of captured images (BGR to RGB).
    pub reverse_channels: bool,

    /// Resets environments whose episode was truncated at the end of a chunk.
    pub auto_reset: bool,

    /// Tracks returns and success of running episodes.
    pub record_metrics: bool,

    /// Seconds to wait for all workers to connect.
    pub handshake_timeout_secs: u64,

    /// Seconds to wait for a cycle. `None` blocks until every worker reports.
    pub cycle_timeout_secs: Option<u64>,

    /// Directory of the shared region file.
    pub shm_dir: Option<PathBuf>,

    /// Settings of the simulator.
    pub simulator: SimulatorConfig,

    /// Frame logging.
    pub video: Option<VideoConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            n_envs: 1,
            horizon: 1,
            action_dim: 14,
            task_name: "place_shoe".to_string(),
            cameras: vec![
                "head_camera".to_string(),
                "right_camera".to_string(),
                "left_camera".to_string(),
            ],
            camera_height: 240,
            camera_width: 320,
            state_dim: 14,
            trajectory_dim: 6,
            image_size: (224, 224),
            jpeg_quality: Some(95),
            reverse_channels: true,
            auto_reset: false,
            record_metrics: true,
            handshake_timeout_secs: 120,
            cycle_timeout_secs: None,
            shm_dir: None,
            simulator: SimulatorConfig::default(),
            video: None,
        }
    }
}

impl PoolConfig {
    /// Sets the number of environments.
    pub fn n_envs(mut self, v: usize) -> Self {
        self.n_envs = v;
        self
    }

    /// Sets the horizon of a chunk.
    pub fn horizon(mut self, v: usize) -> Self {
        self.horizon = v;
        self
    }

    /// Sets the dimension of actions.
    pub fn action_dim(mut self, v: usize) -> Self {
        self.action_dim = v;
        self
    }

    /// Sets the task name.
    pub fn task_name(mut self, v: impl Into<String>) -> Self {
        self.task_name = v.into();
        self
    }

    /// Sets the camera names.
    pub fn cameras(mut self, v: Vec<String>) -> Self {
        self.cameras = v;
        self
    }

    /// Sets the shape `(height, width)` of captured images.
    pub fn camera_shape(mut self, height: usize, width: usize) -> Self {
        self.camera_height = height;
        self.camera_width = width;
        self
    }

    /// Sets the dimension of the state vector.
    pub fn state_dim(mut self, v: usize) -> Self {
        self.state_dim = v;
        self
    }

    /// Sets the size `(height, width)` of output images.
    pub fn image_size(mut self, height: usize, width: usize) -> Self {
        self.image_size = (height, width);
        self
    }

    /// Sets the JPEG quality of recoding.
    pub fn jpeg_quality(mut self, v: Option<u8>) -> Self {
        self.jpeg_quality = v;
        self
    }

    /// Sets the channel flip.
    pub fn reverse_channels(mut self, v: bool) -> Self {
        self.reverse_channels = v;
        self
    }

    /// Sets auto reset at the end of chunks.
    pub fn auto_reset(mut self, v: bool) -> Self {
        self.auto_reset = v;
        self
    }

    /// Sets episode metrics recording.
    pub fn record_metrics(mut self, v: bool) -> Self {
        self.record_metrics = v;
        self
    }

    /// Sets the handshake timeout in seconds.
    pub fn handshake_timeout_secs(mut self, v: u64) -> Self {
        self.handshake_timeout_secs = v;
        self
    }

    /// Sets the cycle timeout in seconds.
    pub fn cycle_timeout_secs(mut self, v: Option<u64>) -> Self {
        self.cycle_timeout_secs = v;
        self
    }

    /// Sets the directory of the shared region file.
    pub fn shm_dir(mut self, v: impl Into<PathBuf>) -> Self {
        self.shm_dir = Some(v.into());
        self
    }

    /// Sets the simulator configuration.
    pub fn simulator(mut self, v: SimulatorConfig) -> Self {
        self.simulator = v;
        self
    }

    /// Sets frame logging.
    pub fn video(mut self, v: Option<VideoConfig>) -> Self {
        self.video = v;
        self
    }

    /// Number of images in a record, a before and an after image per camera.
    pub fn num_images(&self) -> usize {
        2 * self.cameras.len()
    }

    /// Shape of one result record.
    pub fn record_shape(&self) -> RecordShape {
        RecordShape {
            num_images: self.num_images(),
            image_height: self.camera_height,
            image_width: self.camera_width,
            state_dim: self.state_dim,
            horizon: self.horizon,
            trajectory_dim: self.trajectory_dim,
        }
    }

    /// Shape of the shared region.
    pub fn region_shape(&self) -> RegionShape {
        RegionShape {
            n_envs: self.n_envs,
            horizon: self.horizon,
            action_dim: self.action_dim,
            record_size: ResultLayout::new(self.record_shape()).record_size(),
        }
    }

    /// Directory in which the shared region and the worker config are placed.
    pub fn resolved_shm_dir(&self) -> PathBuf {
        match &self.shm_dir {
            Some(dir) => dir.clone(),
            None => {
                let dev_shm = Path::new("/dev/shm");
                if dev_shm.is_dir() {
                    dev_shm.to_path_buf()
                } else {
                    std::env::temp_dir()
                }
            }
        }
    }

    /// Checks that the configuration describes a pool.
    pub fn validate(&self) -> Result<()> {
        let check = |ok: bool, msg: &str| -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(PoolError::InvalidConfig(msg.to_string()).into())
            }
        };
        check(self.n_envs > 0, "n_envs must be positive")?;
        check(self.horizon > 0, "horizon must be positive")?;
        check(self.action_dim > 0, "action_dim must be positive")?;
        check(!self.cameras.is_empty(), "at least one camera is required")?;
        check(
            self.camera_height > 0 && self.camera_width > 0,
            "camera shape must be positive",
        )?;
        check(
            self.image_size.0 > 0 && self.image_size.1 > 0,
            "image_size must be positive",
        )?;
        check(self.trajectory_dim > 0, "trajectory_dim must be positive")?;
        check(
            self.jpeg_quality.map_or(true, |q| (1..=100).contains(&q)),
            "jpeg_quality must be in 1..=100",
        )?;
        Ok(())
    }

    /// Constructs [`PoolConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`PoolConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn test_serde_pool_config() -> Result<()> {
        let config = PoolConfig::default()
            .n_envs(4)
            .horizon(5)
            .cycle_timeout_secs(Some(30))
            .simulator(SimulatorConfig::default().instruction_type("seen"));

        let dir = TempDir::new("pool_config")?;
        let path = dir.path().join("pool_config.yaml");
        config.save(&path)?;
        let config_ = PoolConfig::load(&path)?;
        assert_eq!(config, config_);
        Ok(())
    }

    #[test]
    fn test_validate() {
        assert!(PoolConfig::default().validate().is_ok());

        let err = PoolConfig::default().n_envs(0).validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PoolError>(),
            Some(PoolError::InvalidConfig(_))
        ));

        let err = PoolConfig::default()
            .jpeg_quality(Some(0))
            .validate()
            .unwrap_err();
        assert!(err.downcast_ref::<PoolError>().is_some());
    }

    #[test]
    fn test_record_shape() {
        let shape = PoolConfig::default().horizon(3).record_shape();
        assert_eq!(shape.num_images, 6);
        assert_eq!(shape.image_height, 240);
        assert_eq!(shape.image_width, 320);
        assert_eq!(shape.horizon, 3);
    }
}
