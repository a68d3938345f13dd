//! Agent.
use crate::{
    record::{Logger, Record},
    replay_buffer::EpisodeReplayBuffer,
};
use anyhow::Result;

/// A trainable agent owning its replay buffer, as driven by [`Trainer`](crate::Trainer).
pub trait Agent {
    /// Sets the agent to training mode.
    fn train(&mut self);

    /// Sets the agent to evaluation mode.
    fn eval(&mut self);

    /// Returns if it is in training mode.
    fn is_train(&self) -> bool;

    /// Resets the internal state at the beginning of an episode.
    fn reset(&mut self);

    /// Chooses an action given an observation and updates the internal state.
    fn choose_action(&mut self, obs: &[f32]) -> Result<usize>;

    /// Returns the internal state, stored in the replay buffer as `state`.
    fn state(&self) -> Result<Vec<f32>>;

    /// Returns the replay buffer the agent is trained from.
    fn replay_buffer_mut(&mut self) -> &mut EpisodeReplayBuffer;

    /// Performs a series of gradient steps.
    ///
    /// Metrics of every inner iteration are pushed to `logger` when given;
    /// the returned record holds their averages.
    fn take_gradient_step(&mut self, logger: Option<&mut Logger>) -> Result<Record>;

    /// Called at the end of every epoch.
    fn on_epoch_end(&mut self) {}
}
