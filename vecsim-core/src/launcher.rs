//! Starting and stopping workers.
use crate::{
    sim::Simulator,
    worker::{run_worker, WorkerArgs},
};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::{
    marker::PhantomData,
    path::{Path, PathBuf},
    process::{Child, Command},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Time workers get to exit on their own before they are stopped forcibly.
pub const EXIT_GRACE: Duration = Duration::from_secs(2);

/// A running worker.
pub trait WorkerHandle: Send {
    /// Stops the worker, forcibly if it has not exited by `deadline`.
    fn terminate(&mut self, deadline: Instant) -> Result<()>;
}

/// Stops every worker within one shared grace period.
///
/// Failures are logged and do not keep the remaining workers running.
pub fn terminate_all(handles: &mut [Box<dyn WorkerHandle>], grace: Duration) {
    let deadline = Instant::now() + grace;
    for (index, handle) in handles.iter_mut().enumerate() {
        if let Err(e) = handle.terminate(deadline) {
            warn!("terminating worker {}: {:#}", index, e);
        }
    }
}

/// Starts workers of a pool.
pub trait WorkerLauncher {
    /// Starts a worker. `config_path` is the pool configuration saved as YAML.
    fn launch(&mut self, args: &WorkerArgs, config_path: &Path) -> Result<Box<dyn WorkerHandle>>;
}

/// Runs every worker in its own process.
///
/// The program must accept `--index`, `--socket-name`, `--shm-path` and
/// `--config`, like the `vecsim-worker` executable.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    /// Creates a launcher of `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self, args: &WorkerArgs, config_path: &Path) -> Result<Box<dyn WorkerHandle>> {
        let child = Command::new(&self.program)
            .arg("--index")
            .arg(args.index.to_string())
            .arg("--socket-name")
            .arg(&args.socket_name)
            .arg("--shm-path")
            .arg(&args.shm_path)
            .arg("--config")
            .arg(config_path)
            .spawn()
            .with_context(|| format!("spawning {:?}", self.program))?;
        info!("spawned worker {} (pid {})", args.index, child.id());
        Ok(Box::new(ProcessHandle {
            index: args.index,
            child,
        }))
    }
}

struct ProcessHandle {
    index: usize,
    child: Child,
}

impl WorkerHandle for ProcessHandle {
    fn terminate(&mut self, deadline: Instant) -> Result<()> {
        loop {
            if let Some(status) = self.child.try_wait()? {
                debug!("worker {} exited with {}", self.index, status);
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        warn!("killing worker {} (pid {})", self.index, self.child.id());
        self.child.kill()?;
        self.child.wait()?;
        Ok(())
    }
}

/// Runs every worker on a thread of the current process.
///
/// All workers share one construction lock.
pub struct ThreadLauncher<S> {
    init_lock: Arc<Mutex<()>>,
    phantom: PhantomData<fn() -> S>,
}

impl<S> ThreadLauncher<S> {
    /// Creates a launcher.
    pub fn new() -> Self {
        Self {
            init_lock: Arc::new(Mutex::new(())),
            phantom: PhantomData,
        }
    }
}

impl<S> Default for ThreadLauncher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Simulator + 'static> WorkerLauncher for ThreadLauncher<S> {
    fn launch(&mut self, args: &WorkerArgs, _config_path: &Path) -> Result<Box<dyn WorkerHandle>> {
        let args = args.clone();
        let init_lock = self.init_lock.clone();
        let index = args.index;
        let thread = thread::Builder::new()
            .name(format!("vecsim-worker-{}", index))
            .spawn(move || run_worker::<S>(&args, init_lock))?;
        Ok(Box::new(ThreadHandle {
            index,
            thread: Some(thread),
        }))
    }
}

struct ThreadHandle {
    index: usize,
    thread: Option<JoinHandle<Result<()>>>,
}

impl WorkerHandle for ThreadHandle {
    fn terminate(&mut self, deadline: Instant) -> Result<()> {
        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return Ok(()),
        };
        while !thread.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if !thread.is_finished() {
            warn!("worker thread {} did not exit, detaching it", self.index);
            return Ok(());
        }
        match thread.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!("worker {} ended with: {:#}", self.index, e);
                Ok(())
            }
            Err(_) => anyhow::bail!("worker thread {} panicked", self.index),
        }
    }
}
