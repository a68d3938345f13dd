//! Batches sampled from [`EpisodeReplayBuffer`](super::EpisodeReplayBuffer).
use ndarray::{Array1, Array2, Array3};

/// A batch of i.i.d. transitions.
///
/// Leading axis is the batch axis.
#[derive(Debug, Clone)]
pub struct TransitionBatch {
    /// Internal state of the agent at the current step, `[batch, state_dim]`.
    pub state: Array2<f32>,

    /// Observation at the current step, `[batch, obs_dim]`.
    pub obs: Array2<f32>,

    /// Action index taken at the current step, `[batch]`.
    pub ctl: Array1<u32>,

    /// Reward, `[batch]`.
    pub rwd: Array1<f32>,

    /// Internal state of the agent at the next step, `[batch, state_dim]`.
    pub next_state: Array2<f32>,

    /// Observation at the next step, `[batch, obs_dim]`.
    pub next_obs: Array2<f32>,

    /// `1.0` if the next step is terminal, `[batch]`.
    pub done: Array1<f32>,
}

impl TransitionBatch {
    /// Returns the batch size.
    pub fn len(&self) -> usize {
        self.rwd.len()
    }

    /// Returns `true` if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.rwd.is_empty()
    }
}

/// A padded batch of episode windows.
///
/// Arrays are time-major: the first axis is time and the second is batch.
/// Padded entries are zero and masked out by `mask`.
#[derive(Debug, Clone)]
pub struct EpisodeBatch {
    /// `[seq_len, batch, obs_dim]`.
    pub obs: Array3<f32>,

    /// `[seq_len, batch]`.
    pub ctl: Array2<u32>,

    /// `[seq_len, batch, state_dim]`.
    pub state: Array3<f32>,

    /// `[seq_len, batch]`.
    pub rwd: Array2<f32>,

    /// `[seq_len, batch]`.
    pub done: Array2<f32>,

    /// `1.0` on valid steps and `0.0` on padding, `[seq_len, batch]`.
    pub mask: Array2<f32>,
}

impl EpisodeBatch {
    /// Returns the length of the time axis.
    pub fn seq_len(&self) -> usize {
        self.mask.shape()[0]
    }

    /// Returns the batch size.
    pub fn batch_size(&self) -> usize {
        self.mask.shape()[1]
    }
}
