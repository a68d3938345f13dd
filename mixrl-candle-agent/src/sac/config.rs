//! Configuration of SAC trainer.
use super::DoubleCriticConfig;
use crate::{opt::OptimizerConfig, Device};
use anyhow::Result;
use log::info;
use mixrl_core::replay_buffer::ReplayBufferConfig;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [`Sac`](super::Sac).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct SacConfig {
    /// Configuration of the critic.
    pub critic_config: DoubleCriticConfig,

    /// Configuration of the optimizer of the agent.
    pub actor_opt_config: OptimizerConfig,

    /// Configuration of the replay buffer.
    pub buffer_config: ReplayBufferConfig,

    /// Discount factor.
    pub gamma: f64,

    /// Temperature of the Boltzmann policy.
    pub beta: f64,

    /// Polyak averaging factor of the target critic.
    pub polyak: f64,

    /// If `true`, observations fed to the critic are normalized with the
    /// running statistics of the replay buffer.
    pub norm_obs: bool,

    /// Batch size of transitions for the critic.
    pub batch_size: usize,

    /// Batch size of episodes for the agent.
    pub a_batch_size: usize,

    /// Maximum length of episode windows for the agent.
    pub rnn_len: usize,

    /// Number of gradient steps per call of `take_gradient_step`.
    pub a_steps: usize,

    /// Maximum gradient norm.
    pub grad_clip: Option<f64>,

    /// Weight of the observation loss of the agent.
    pub obs_penalty: f64,

    /// Device for the critic.
    pub device: Option<Device>,
}

impl Default for SacConfig {
    fn default() -> Self {
        Self {
            critic_config: DoubleCriticConfig::default(),
            actor_opt_config: OptimizerConfig::default(),
            buffer_config: ReplayBufferConfig::default(),
            gamma: 0.9,
            beta: 0.2,
            polyak: 0.995,
            norm_obs: false,
            batch_size: 100,
            a_batch_size: 32,
            rnn_len: 10,
            a_steps: 50,
            grad_clip: None,
            obs_penalty: 1.0,
            device: None,
        }
    }
}

impl SacConfig {
    /// Sets the configuration of the critic.
    pub fn critic_config(mut self, v: DoubleCriticConfig) -> Self {
        self.critic_config = v;
        self
    }

    /// Sets the optimizer of the agent.
    pub fn actor_opt_config(mut self, v: OptimizerConfig) -> Self {
        self.actor_opt_config = v;
        self
    }

    /// Sets the configuration of the replay buffer.
    pub fn buffer_config(mut self, v: ReplayBufferConfig) -> Self {
        self.buffer_config = v;
        self
    }

    /// Discount factor.
    pub fn gamma(mut self, v: f64) -> Self {
        self.gamma = v;
        self
    }

    /// Temperature.
    pub fn beta(mut self, v: f64) -> Self {
        self.beta = v;
        self
    }

    /// Polyak averaging factor.
    pub fn polyak(mut self, v: f64) -> Self {
        self.polyak = v;
        self
    }

    /// Observation normalization for the critic.
    pub fn norm_obs(mut self, v: bool) -> Self {
        self.norm_obs = v;
        self
    }

    /// Batch size of transitions.
    pub fn batch_size(mut self, v: usize) -> Self {
        self.batch_size = v;
        self
    }

    /// Batch size of episodes.
    pub fn a_batch_size(mut self, v: usize) -> Self {
        self.a_batch_size = v;
        self
    }

    /// Length of episode windows.
    pub fn rnn_len(mut self, v: usize) -> Self {
        self.rnn_len = v;
        self
    }

    /// Gradient steps per call.
    pub fn a_steps(mut self, v: usize) -> Self {
        self.a_steps = v;
        self
    }

    /// Gradient clipping.
    pub fn grad_clip(mut self, v: Option<f64>) -> Self {
        self.grad_clip = v;
        self
    }

    /// Weight of the observation loss.
    pub fn obs_penalty(mut self, v: f64) -> Self {
        self.obs_penalty = v;
        self
    }

    /// Device.
    pub fn device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Constructs [`SacConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!("Load config of SAC agent from {}", path_.to_str().unwrap_or("?"));
        Ok(b)
    }

    /// Saves [`SacConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!("Save config of SAC agent into {}", path_.to_str().unwrap_or("?"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Activation;
    use tempdir::TempDir;

    #[test]
    fn test_serde_sac_config() -> Result<()> {
        let config = SacConfig::default()
            .critic_config(
                DoubleCriticConfig::default()
                    .units(vec![32, 32])
                    .activation(Activation::ReLU),
            )
            .actor_opt_config(OptimizerConfig::AdamW {
                lr: 3e-4,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                weight_decay: 1e-4,
            })
            .grad_clip(Some(10.0))
            .a_steps(5)
            .device(Device::Cpu);

        let dir = TempDir::new("sac_config")?;
        let path = dir.path().join("sac.yaml");
        config.save(&path)?;
        let config_ = SacConfig::load(&path)?;
        assert_eq!(config, config_);
        Ok(())
    }
}
