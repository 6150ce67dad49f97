//! Worker process of a `vecsim` pool, driving the scripted simulator.
//!
//! Started by [`ProcessLauncher`](vecsim_core::ProcessLauncher); not meant to
//! be run by hand.
use anyhow::Result;
use clap::Parser;
use log::info;
use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};
use vecsim_core::{run_worker, PoolConfig, ScriptedSimulator, WorkerArgs};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Slot of this worker in the pool
    #[arg(long)]
    index: usize,

    /// Name of the controller's local socket
    #[arg(long)]
    socket_name: String,

    /// Path of the shared region file
    #[arg(long)]
    shm_path: PathBuf,

    /// Pool configuration in YAML
    #[arg(long)]
    config: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = PoolConfig::load(&args.config)?;
    info!("worker {} starting on {}", args.index, args.socket_name);

    let worker_args = WorkerArgs {
        index: args.index,
        socket_name: args.socket_name,
        shm_path: args.shm_path,
        config,
    };
    run_worker::<ScriptedSimulator>(&worker_args, Arc::new(Mutex::new(())))
}
