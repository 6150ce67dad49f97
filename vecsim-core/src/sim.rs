//! Interface to the external simulator.
mod base;
mod scripted;
pub use base::{EpisodeInfo, Frame, Observation, Simulator};
pub use scripted::{ScriptedParams, ScriptedSimulator};
