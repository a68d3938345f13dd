//! Soft actor-critic (SAC) over agents with discrete actions and latent beliefs.
//!
//! The critic is trained toward the soft Bellman target
//!
//! ```text
//! r + (1 - done) * gamma * beta * logsumexp(min(q1', q2') / beta)
//! ```
//!
//! computed with a polyak-averaged target critic, and the agent is trained to
//! match the Boltzmann policy `softmax(min(q1, q2) / beta)` in KL divergence.
mod base;
mod config;
mod critic;
pub use base::{soft_value, Sac};
pub use config::SacConfig;
pub use critic::{DoubleCritic, DoubleCriticConfig};
