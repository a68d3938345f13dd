//! Agents trained by [`Sac`](crate::sac::Sac).
mod base;
mod belief;
pub use base::{AgentOutput, MixtureAgent};
pub use belief::{BeliefAgent, BeliefAgentConfig};
