//! Episodic replay buffer.
//!
//! Steps are appended one by one with
//! [`push_step`](EpisodeReplayBuffer::push_step) and grouped into episodes by
//! an explicit [`close_episode`](EpisodeReplayBuffer::close_episode). Two
//! sampling modes are available:
//!
//! * [`sample_random`](EpisodeReplayBuffer::sample_random) draws i.i.d.
//!   transitions for the critic,
//! * [`sample_episodes`](EpisodeReplayBuffer::sample_episodes) draws padded,
//!   time-major windows of episodes with a validity mask for the actor.
mod base;
mod batch;
mod config;
mod running_stats;
pub use base::EpisodeReplayBuffer;
pub use batch::{EpisodeBatch, TransitionBatch};
pub use config::ReplayBufferConfig;
pub use running_stats::RunningMeanStd;
