#![warn(missing_docs)]
//! Core components of mixrl.
//!
//! This crate does not depend on any tensor backend. It provides
//!
//! * [`record`] - records of scalar metrics and the [`Logger`](record::Logger) aggregating them,
//! * [`replay_buffer`] - an episodic replay buffer with random-transition and
//!   episode-window sampling,
//! * [`Env`] and [`Agent`] - the interfaces the training loop talks to,
//! * [`Trainer`] - the training loop itself.
pub mod error;
pub mod record;
pub mod replay_buffer;

mod base;
pub use base::{Agent, Env, Step};

mod trainer;
pub use trainer::{CustomReward, Trainer, TrainerConfig};
