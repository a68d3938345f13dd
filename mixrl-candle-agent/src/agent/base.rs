use anyhow::Result;
use candle_core::{Tensor, Var};
use mixrl_core::record::Record;

/// Output of [`MixtureAgent::forward`] on a time-major batch `[seq_len, batch, ...]`.
pub struct AgentOutput {
    /// Action probabilities, `[seq_len, batch, act_dim]`.
    pub act_probs: Tensor,

    /// Belief over the latent state before observing `obs_t`, `[seq_len, batch, state_dim]`.
    pub prior: Tensor,

    /// Belief over the latent state after observing `obs_t`, `[seq_len, batch, state_dim]`.
    pub belief: Tensor,
}

/// An agent with a latent belief state and a discrete action policy.
///
/// The belief returned by [`state`](MixtureAgent::state) is what the replay
/// buffer stores as `state` and what the critic is conditioned on.
pub trait MixtureAgent {
    /// Dimension of observations.
    fn obs_dim(&self) -> usize;

    /// Number of actions.
    fn act_dim(&self) -> usize;

    /// Dimension of the belief state.
    fn state_dim(&self) -> usize;

    /// Clears the belief at the beginning of an episode.
    fn reset(&mut self);

    /// Updates the belief with `obs` `[1, obs_dim]` and returns an action index.
    fn choose_action(&mut self, obs: &Tensor) -> Result<usize>;

    /// The current belief, `[1, state_dim]`.
    fn state(&self) -> Result<Tensor>;

    /// Runs the agent over episode windows.
    ///
    /// `obs` is `[seq_len, batch, obs_dim]` and `ctl` holds `u32` action
    /// indices, `[seq_len, batch]`.
    fn forward(&mut self, obs: &Tensor, ctl: &Tensor) -> Result<AgentOutput>;

    /// Loss of the observation model on masked episode windows.
    fn obs_loss(
        &mut self,
        obs: &Tensor,
        ctl: &Tensor,
        mask: &Tensor,
        out: &AgentOutput,
    ) -> Result<(Tensor, Record)>;

    /// Receives running observation statistics of the replay buffer.
    fn set_obs_stats(&mut self, _mean: &Tensor, _variance: &Tensor) -> Result<()> {
        Ok(())
    }

    /// Sets training mode.
    fn train(&mut self);

    /// Sets evaluation mode.
    fn eval(&mut self);

    /// Trainable variables.
    fn vars(&self) -> Vec<Var>;
}
