use anyhow::Result;
use ndarray::{s, Array3, Array4};
use tempdir::TempDir;
use test_log::test;
use vecsim_core::{
    PoolConfig, PoolError, ScriptedParams, ScriptedSimulator, SimPool, SimulatorConfig,
    ThreadLauncher,
};

type Pool = SimPool<ThreadLauncher<ScriptedSimulator>>;

fn pool() -> Pool {
    SimPool::build(ThreadLauncher::new())
}

/// Small pool configuration whose simulator is set up by `params`.
fn config(
    dir: &TempDir,
    n_envs: usize,
    horizon: usize,
    f: impl FnOnce(ScriptedParams) -> ScriptedParams,
) -> PoolConfig {
    let config = PoolConfig::default()
        .n_envs(n_envs)
        .horizon(horizon)
        .action_dim(4)
        .camera_shape(8, 8)
        .image_size(8, 8)
        .jpeg_quality(None)
        .handshake_timeout_secs(30)
        .cycle_timeout_secs(Some(30))
        .shm_dir(dir.path());
    let params = f(ScriptedParams::for_pool(&config));
    let simulator = SimulatorConfig::default().params(&params).unwrap();
    config.simulator(simulator)
}

#[test]
fn test_initialize() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 3, 2, |p| p);
    let mut pool = pool();
    let (obs, info) = pool.initialize(&config)?;

    assert_eq!(obs.images.shape(), &[3, 6, 3, 8, 8]);
    assert_eq!(obs.state.shape(), &[3, 14]);
    assert_eq!(obs.task_descriptions.len(), 3);
    assert!(obs.task_descriptions.iter().all(|d| !d.is_empty()));
    assert!(obs.images.iter().all(|&v| v == 0));
    assert_eq!(info.return_poses.shape(), &[3, 2, 6]);
    let episode = info.episode.unwrap();
    assert_eq!(episode.episode_len.to_vec(), vec![0, 0, 0]);

    // No action taken yet
    let step = pool.step(None)?;
    assert!(step.reward.is_none());
    assert_eq!(step.terminated.to_vec(), vec![false; 3]);
    assert_eq!(step.truncated.to_vec(), vec![false; 3]);

    pool.clear()?;
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    Ok(())
}

#[test]
fn test_step_limit_truncates() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 2, 3, |p| p.step_limit(3));
    let mut pool = pool();
    pool.initialize(&config)?;

    let actions = Array3::<f64>::zeros((2, 3, 4));
    let step = pool.step(Some(actions.view()))?;
    assert_eq!(step.truncated.to_vec(), vec![true, true]);
    assert_eq!(step.terminated.to_vec(), vec![false, false]);
    assert_eq!(step.reward.unwrap().to_vec(), vec![0.0, 0.0]);
    assert_eq!(step.obs.state.column(0).to_vec(), vec![3.0, 3.0]);

    // Trajectory holds the poses of the three steps
    let poses = step.info.return_poses;
    assert_eq!(poses.slice(s![0, .., 0]).to_vec(), vec![1.0, 2.0, 3.0]);
    Ok(())
}

#[test]
fn test_truncated_chunk_applies_every_action() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 1, 3, |p| p.step_limit(2));
    let mut pool = pool();
    pool.initialize(&config)?;

    let actions = Array3::<f64>::zeros((1, 3, 4));
    let step = pool.step(Some(actions.view()))?;
    assert_eq!(step.truncated.to_vec(), vec![true]);
    assert_eq!(step.terminated.to_vec(), vec![false]);
    assert_eq!(step.obs.state[[0, 0]], 3.0);
    let poses = step.info.return_poses;
    assert_eq!(poses.slice(s![0, .., 0]).to_vec(), vec![1.0, 2.0, 3.0]);

    // Truncation alone does not start a new episode
    assert_eq!(pool.seed_cursor()?, 0);
    Ok(())
}

#[test]
fn test_chunk_step_success() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 1, 1, |p| p.success_at(Some(1)));
    let mut pool = pool();
    pool.initialize(&config)?;

    let actions = Array4::<f64>::zeros((1, 1, 1, 4));
    let chunk = pool.chunk_step(actions.view())?;
    assert_eq!(chunk.terminated.shape(), &[1, 1]);
    assert!(chunk.terminated[[0, 0]]);
    assert!(!chunk.truncated[[0, 0]]);
    assert_eq!(chunk.rewards[[0, 0]], 1.0);
    assert_eq!(chunk.done_step, vec![Some(0)]);

    let episode = chunk.info.episode.unwrap();
    assert!(episode.success_once[0]);
    assert_eq!(episode.returns[0], 1.0);

    // The worker started a new episode with the first seed of the cursor
    assert_eq!(pool.seed_cursor()?, 1);
    Ok(())
}

#[test]
fn test_chunk_flags_at_last_position() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 2, 1, |p| p.step_limit(2)).auto_reset(true);
    let mut pool = pool();
    pool.initialize(&config)?;

    let actions = Array4::<f64>::zeros((2, 3, 1, 4));
    let chunk = pool.chunk_step(actions.view())?;
    assert_eq!(chunk.done_step, vec![Some(1), Some(1)]);
    assert_eq!(chunk.truncated.row(0).to_vec(), vec![false, false, true]);
    assert_eq!(chunk.terminated.row(0).to_vec(), vec![false, false, false]);

    // Truncated environments were reset, which claimed two seeds
    assert_eq!(pool.seed_cursor()?, 2);
    assert_eq!(chunk.obs.state.column(0).to_vec(), vec![0.0, 0.0]);
    let seeds = chunk.obs.state.column(1).to_vec();
    assert!(seeds.contains(&0.0) && seeds.contains(&1.0));
    Ok(())
}

#[test]
fn test_reset_claims_seeds() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 3, 1, |p| p);
    let mut pool = pool().with_seed(28);
    pool.initialize(&config)?;

    let (obs, info) = pool.reset()?;
    let mut seeds = obs.state.column(1).to_vec();
    seeds.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(seeds, vec![0.0, 28.0, 29.0]);
    assert!(seeds.iter().all(|&s| (0.0..30.0).contains(&s)));
    assert_eq!(pool.seed_cursor()?, 1);
    assert_eq!(info.episode.unwrap().episode_len.to_vec(), vec![0, 0, 0]);

    // Partial reset only touches the given environment
    let actions = Array3::<f64>::zeros((3, 1, 4));
    pool.step(Some(actions.view()))?;
    let (obs, _) = pool.reset_envs(&[1])?;
    assert_eq!(obs.state.column(0).to_vec(), vec![1.0, 0.0, 1.0]);
    assert_eq!(obs.state[[1, 1]], 1.0);
    assert_eq!(pool.seed_cursor()?, 2);

    let err = pool.reset_envs(&[3]).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PoolError>(),
        Some(PoolError::IndexOutOfRange { index: 3, .. })
    ));
    Ok(())
}

#[test]
fn test_seed_cursor_at_max_value() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 1, 1, |p| p);
    let mut pool = pool().with_seed(u64::MAX);
    pool.initialize(&config)?;

    let (obs, _) = pool.reset()?;
    assert_eq!(obs.state[[0, 1]], (u64::MAX % 30) as f64);
    assert_eq!(pool.seed_cursor()?, u64::MAX % 30 + 1);
    Ok(())
}

#[test]
fn test_reseed_skips_failing_seed() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 1, 1, |p| p.fail_seeds(vec![1]));
    let mut pool = pool().with_seed(1);
    pool.initialize(&config)?;

    let (obs, _) = pool.reset()?;
    assert_eq!(obs.state[[0, 0]], 0.0);
    assert_eq!(obs.state[[0, 1]], 2.0);
    assert_eq!(pool.seed_cursor()?, 3);

    // The pool keeps working after the retried reseed
    let actions = Array3::<f64>::zeros((1, 1, 4));
    let step = pool.step(Some(actions.view()))?;
    assert_eq!(step.obs.state[[0, 0]], 1.0);
    Ok(())
}

#[test]
fn test_clear_and_initialize() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 2, 1, |p| p);
    let mut pool = pool().with_seed(5);
    pool.initialize(&config)?;
    pool.reset()?;
    pool.clear()?;
    assert_eq!(pool.seed(), 7);
    assert!(pool.step(None).is_err());

    // A fresh pool starts from the persisted cursor
    let (obs, _) = pool.initialize(&config)?;
    assert_eq!(obs.state.column(1).to_vec(), vec![0.0, 0.0]);
    assert_eq!(pool.seed_cursor()?, 7);
    let (obs, _) = pool.reset()?;
    let mut seeds = obs.state.column(1).to_vec();
    seeds.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(seeds, vec![7.0, 8.0]);
    Ok(())
}

#[test]
fn test_no_tearing_with_slow_simulator() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 3, 2, |p| p.observe_delay_ms(5));
    let mut pool = pool();
    pool.initialize(&config)?;

    let actions = Array3::<f64>::zeros((3, 2, 4));
    for cycle in 1..=4 {
        let step = pool.step(Some(actions.view()))?;
        let steps = 2.0 * cycle as f64;
        assert_eq!(step.obs.state.column(0).to_vec(), vec![steps; 3]);
        let pixel = ScriptedSimulator::pixel(0, 2 * cycle);
        assert!(step.obs.images.slice(s![.., 3.., .., .., ..]).iter().all(|&v| v == pixel));
    }
    Ok(())
}

#[test]
fn test_shape_mismatch() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 2, 2, |p| p);
    let mut pool = pool();

    let actions = Array3::<f64>::zeros((2, 2, 4));
    let err = pool.step(Some(actions.view())).unwrap_err();
    assert_eq!(
        err.downcast_ref::<PoolError>(),
        Some(&PoolError::NotInitialized)
    );

    pool.initialize(&config)?;
    let actions = Array3::<f64>::zeros((2, 1, 4));
    let err = pool.step(Some(actions.view())).unwrap_err();
    assert_eq!(
        err.downcast_ref::<PoolError>(),
        Some(&PoolError::ShapeMismatch {
            expected: vec![2, 2, 4],
            actual: vec![2, 1, 4]
        })
    );

    // A rejected batch does not break the pool
    assert!(pool.step(None).is_ok());
    Ok(())
}

#[test]
fn test_failed_worker_breaks_pool() -> Result<()> {
    let dir = TempDir::new("pool")?;
    let config = config(&dir, 2, 1, |p| p.fail_seeds(vec![0]));
    let mut pool = pool();
    let err = pool.initialize(&config).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PoolError>(),
        Some(PoolError::WorkerFailed { .. })
    ));
    assert_eq!(
        pool.step(None).unwrap_err().downcast_ref::<PoolError>(),
        Some(&PoolError::PoolBroken)
    );

    pool.clear()?;
    let config = self::config(&dir, 2, 1, |p| p);
    assert!(pool.initialize(&config).is_ok());
    Ok(())
}
