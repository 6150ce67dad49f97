//! Errors in the library.
use thiserror::Error;

/// Structural errors of the pool.
///
/// Transient simulator errors never show up here; they are retried and logged
/// by the adapter and the worker loop. Everything in this enum aborts the call
/// that hit it, and the synchronization variants leave the pool unusable until
/// [`SimPool::clear`](crate::SimPool::clear) and a new
/// [`SimPool::initialize`](crate::SimPool::initialize).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    /// The configuration cannot describe a pool.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A buffer or header disagrees with the result layout.
    #[error("Layout mismatch: {0}")]
    LayoutMismatch(String),

    /// An action batch does not have the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Given shape.
        actual: Vec<usize>,
    },

    /// An environment index is not below the number of environments.
    #[error("Environment index {index} out of range for {n_envs} environment(s)")]
    IndexOutOfRange {
        /// Given index.
        index: usize,
        /// Number of environments.
        n_envs: usize,
    },

    /// The pool has no workers.
    #[error("Pool is not initialized")]
    NotInitialized,

    /// A previous synchronization failure left the pool unusable.
    #[error("Pool is broken after a synchronization failure")]
    PoolBroken,

    /// Spawning or connecting workers failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Workers did not finish a cycle in time.
    #[error("Cycle timed out with {pending} worker(s) pending")]
    CycleTimeout {
        /// Number of workers that did not report.
        pending: usize,
    },

    /// A worker reported an unrecoverable error.
    #[error("Worker {index} failed: {message}")]
    WorkerFailed {
        /// Slot of the worker.
        index: usize,
        /// Error reported by the worker.
        message: String,
    },

    /// The connection to a worker was lost.
    #[error("Worker {index} exited")]
    WorkerExited {
        /// Slot of the worker.
        index: usize,
    },

    /// A message arrived out of protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
