//! Controller side of the pool.
mod base;
mod batch;
mod config;
pub use base::SimPool;
pub use batch::{ChunkStep, InfoBatch, ObsBatch, PoolStep};
pub use config::{PoolConfig, SimulatorConfig};
