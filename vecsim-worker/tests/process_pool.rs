use anyhow::Result;
use ndarray::{Array3, Array4};
use tempdir::TempDir;
use test_log::test;
use vecsim_core::{PoolConfig, ProcessLauncher, ScriptedParams, SimPool, SimulatorConfig};

fn config(
    dir: &TempDir,
    n_envs: usize,
    params: impl FnOnce(ScriptedParams) -> ScriptedParams,
) -> PoolConfig {
    let config = PoolConfig::default()
        .n_envs(n_envs)
        .horizon(2)
        .action_dim(4)
        .camera_shape(16, 16)
        .image_size(8, 8)
        .handshake_timeout_secs(60)
        .cycle_timeout_secs(Some(60))
        .shm_dir(dir.path());
    let params = params(ScriptedParams::for_pool(&config));
    config.simulator(SimulatorConfig::default().params(&params).unwrap())
}

fn launcher() -> ProcessLauncher {
    ProcessLauncher::new(env!("CARGO_BIN_EXE_vecsim-worker"))
}

#[test]
fn test_process_pool() -> Result<()> {
    let dir = TempDir::new("process_pool")?;
    let config = config(&dir, 2, |p| p.step_limit(4).success_at(Some(3)));
    let mut pool = SimPool::build(launcher());

    let (obs, info) = pool.initialize(&config)?;
    assert_eq!(obs.images.shape(), &[2, 6, 3, 8, 8]);
    assert_eq!(info.return_poses.shape(), &[2, 2, 6]);

    // Steps 1 and 2, then success at step 3 followed by a new episode
    let actions = Array4::<f64>::zeros((2, 2, 2, 4));
    let chunk = pool.chunk_step(actions.view())?;
    assert_eq!(chunk.done_step, vec![Some(1), Some(1)]);
    assert!(chunk.terminated[[0, 1]] && chunk.terminated[[1, 1]]);
    assert_eq!(chunk.rewards.row(0).to_vec(), vec![0.0, 1.0]);
    assert_eq!(pool.seed_cursor()?, 2);

    let actions = Array3::<f64>::zeros((2, 2, 4));
    let step = pool.step(Some(actions.view()))?;
    assert_eq!(step.obs.state.column(0).to_vec(), vec![2.0, 2.0]);
    let mut seeds = step.obs.state.column(1).to_vec();
    seeds.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(seeds, vec![0.0, 1.0]);

    pool.clear()?;
    assert_eq!(pool.seed(), 2);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);

    // Workers are spawned again for the next pool
    let (obs, _) = pool.initialize(&config)?;
    assert_eq!(obs.state.shape(), &[2, 14]);
    let (obs, _) = pool.reset()?;
    let mut seeds = obs.state.column(1).to_vec();
    seeds.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(seeds, vec![2.0, 3.0]);
    Ok(())
}
