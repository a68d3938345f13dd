//! Environment.
use crate::record::Record;
use anyhow::Result;

/// Outcome of an environment step.
#[derive(Debug, Clone)]
pub struct Step {
    /// Observation after the step.
    pub next_obs: Vec<f32>,

    /// Reward of the step.
    pub reward: f32,

    /// Whether the episode has terminated.
    pub done: bool,

    /// Additional information from the environment.
    pub info: Record,
}

/// An environment with vector observations and discrete actions.
pub trait Env {
    /// Resets the environment and returns the initial observation.
    fn reset(&mut self) -> Result<Vec<f32>>;

    /// Performs an environment step with action index `ctl`.
    fn step(&mut self, ctl: usize) -> Result<Step>;
}
