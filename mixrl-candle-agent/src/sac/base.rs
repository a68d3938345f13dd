use super::{DoubleCritic, SacConfig};
use crate::{
    agent::MixtureAgent,
    opt::{clip_grad_norm, Optimizer},
    util::{array_to_tensor, kl_divergence, logsumexp, masked_mean},
};
use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{loss::mse, ops::softmax};
use log::{info, trace};
use mixrl_core::{
    error::MixrlError,
    record::{Logger, Record, RecordValue},
    replay_buffer::EpisodeReplayBuffer,
    Agent,
};

/// Soft state value `beta * logsumexp(min(q1, q2) / beta)` along the last axis.
pub fn soft_value(q1: &Tensor, q2: &Tensor, beta: f64) -> Result<Tensor> {
    let q = q1.minimum(q2)?;
    Ok(logsumexp(&q.affine(1.0 / beta, 0.0)?)?.affine(beta, 0.0)?)
}

/// Soft actor-critic trainer of a [`MixtureAgent`].
///
/// The trainer owns the agent, the critic with its target network, the
/// optimizers and the replay buffer. The critic takes the agent's belief
/// concatenated with the (optionally normalized) observation.
///
/// Tensors sampled from the replay buffer are created on the device of the
/// critic, which must be the device of the agent.
pub struct Sac<A: MixtureAgent> {
    agent: A,
    critic: DoubleCritic,
    actor_opt: Optimizer,
    buffer: EpisodeReplayBuffer,
    gamma: f64,
    beta: f64,
    norm_obs: bool,
    batch_size: usize,
    a_batch_size: usize,
    rnn_len: usize,
    a_steps: usize,
    grad_clip: Option<f64>,
    obs_penalty: f64,
    obs_mean: Tensor,
    obs_variance: Tensor,
    train: bool,
    n_opts: usize,
    device: Device,
}

fn check_config(config: &SacConfig) -> Result<(), MixrlError> {
    let invalid = |msg: &str| Err(MixrlError::InvalidConfig(msg.to_string()));
    if !(0.0..=1.0).contains(&config.gamma) {
        return invalid("gamma must be in [0, 1]");
    }
    if config.beta <= 0.0 {
        return invalid("beta must be positive");
    }
    if !(0.0..=1.0).contains(&config.polyak) {
        return invalid("polyak must be in [0, 1]");
    }
    if config.batch_size == 0 || config.a_batch_size == 0 {
        return invalid("batch sizes must be positive");
    }
    if config.rnn_len == 0 {
        return invalid("rnn_len must be positive");
    }
    if config.a_steps == 0 {
        return invalid("a_steps must be positive");
    }
    Ok(())
}

impl<A: MixtureAgent> Sac<A> {
    /// Constructs the trainer for `agent`.
    pub fn build(config: SacConfig, agent: A) -> Result<Self> {
        check_config(&config)?;
        let device = config.device.unwrap_or_default().create()?;
        let (obs_dim, act_dim, state_dim) = (agent.obs_dim(), agent.act_dim(), agent.state_dim());

        let critic = DoubleCritic::build(
            config.critic_config.clone(),
            state_dim + obs_dim,
            act_dim,
            config.polyak,
            &device,
        )?;
        let actor_opt = config.actor_opt_config.build(agent.vars())?;
        let buffer = EpisodeReplayBuffer::build(&config.buffer_config, obs_dim, act_dim, state_dim);
        info!(
            "Build SAC trainer, obs_dim: {}, act_dim: {}, state_dim: {}",
            obs_dim, act_dim, state_dim
        );

        Ok(Self {
            agent,
            critic,
            actor_opt,
            buffer,
            gamma: config.gamma,
            beta: config.beta,
            norm_obs: config.norm_obs,
            batch_size: config.batch_size,
            a_batch_size: config.a_batch_size,
            rnn_len: config.rnn_len,
            a_steps: config.a_steps,
            grad_clip: config.grad_clip,
            obs_penalty: config.obs_penalty,
            obs_mean: Tensor::zeros(obs_dim, DType::F32, &device)?,
            obs_variance: Tensor::ones(obs_dim, DType::F32, &device)?,
            train: false,
            n_opts: 0,
            device,
        })
    }

    /// The agent.
    pub fn agent(&self) -> &A {
        &self.agent
    }

    /// The agent, mutably.
    pub fn agent_mut(&mut self) -> &mut A {
        &mut self.agent
    }

    /// The critic.
    pub fn critic(&self) -> &DoubleCritic {
        &self.critic
    }

    /// The replay buffer.
    pub fn replay_buffer(&self) -> &EpisodeReplayBuffer {
        &self.buffer
    }

    /// The device of the critic.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Number of gradient steps taken so far.
    pub fn n_opts(&self) -> usize {
        self.n_opts
    }

    /// `(obs - mean) / sqrt(variance)` with the current statistics.
    pub fn normalize_obs(&self, obs: &Tensor) -> Result<Tensor> {
        Ok(obs
            .broadcast_sub(&self.obs_mean)?
            .broadcast_div(&self.obs_variance.sqrt()?)?)
    }

    /// Copies the observation statistics of the replay buffer to the trainer
    /// and the agent. Does nothing unless `norm_obs` is enabled.
    pub fn update_normalization_stats(&mut self) -> Result<()> {
        if self.norm_obs {
            self.obs_mean = array_to_tensor::<_, _, f32, f32>(&self.buffer.obs_mean(), &self.device)?;
            self.obs_variance =
                array_to_tensor::<_, _, f32, f32>(&self.buffer.obs_variance(), &self.device)?;
            self.agent.set_obs_stats(&self.obs_mean, &self.obs_variance)?;
        }
        Ok(())
    }

    fn critic_input(&self, state: &Tensor, obs: &Tensor) -> Result<Tensor> {
        Ok(Tensor::cat(&[state, &self.normalize_obs(obs)?], D::Minus1)?)
    }

    /// Mean squared soft Bellman error of both Q-networks on a random batch.
    pub fn compute_critic_loss(&mut self) -> Result<Tensor> {
        let batch = self.buffer.sample_random(self.batch_size)?;
        let state = array_to_tensor::<_, _, f32, f32>(&batch.state, &self.device)?;
        let obs = array_to_tensor::<_, _, f32, f32>(&batch.obs, &self.device)?;
        let ctl = array_to_tensor::<_, _, u32, u32>(&batch.ctl, &self.device)?;
        let rwd = array_to_tensor::<_, _, f32, f32>(&batch.rwd, &self.device)?;
        let next_state = array_to_tensor::<_, _, f32, f32>(&batch.next_state, &self.device)?;
        let next_obs = array_to_tensor::<_, _, f32, f32>(&batch.next_obs, &self.device)?;
        let done = array_to_tensor::<_, _, f32, f32>(&batch.done, &self.device)?;

        let q_target = {
            let (q1_next, q2_next) = self
                .critic
                .forward_tgt(&self.critic_input(&next_state, &next_obs)?)?;
            let v_next = soft_value(&q1_next, &q2_next, self.beta)?;
            let not_done = done.affine(-1.0, 1.0)?;
            (rwd + (not_done * v_next)?.affine(self.gamma, 0.0)?)?
        }
        .detach();

        let (q1, q2) = self.critic.forward(&self.critic_input(&state, &obs)?)?;
        let ix = ctl.unsqueeze(1)?;
        let q1 = q1.gather(&ix, 1)?.squeeze(1)?;
        let q2 = q2.gather(&ix, 1)?.squeeze(1)?;

        Ok(((mse(&q1, &q_target)? + mse(&q2, &q_target)?)? / 2.0)?)
    }

    /// Masked KL divergence from the agent's action probabilities to the
    /// Boltzmann policy of the critic, on episode windows.
    pub fn compute_actor_loss(&mut self) -> Result<Tensor> {
        let batch = self
            .buffer
            .sample_episodes(self.a_batch_size, self.rnn_len, false)?;
        let state = array_to_tensor::<_, _, f32, f32>(&batch.state, &self.device)?;
        let obs = array_to_tensor::<_, _, f32, f32>(&batch.obs, &self.device)?;
        let ctl = array_to_tensor::<_, _, u32, u32>(&batch.ctl, &self.device)?;
        let mask = array_to_tensor::<_, _, f32, f32>(&batch.mask, &self.device)?;

        let out = self.agent.forward(&obs, &ctl)?;

        let a_target = {
            let (q1, q2) = self.critic.forward(&self.critic_input(&state, &obs)?)?;
            let q = q1.minimum(&q2)?.affine(1.0 / self.beta, 0.0)?;
            softmax(&q, D::Minus1)?.detach()
        };

        let kl = kl_divergence(&out.act_probs, &a_target)?;
        masked_mean(&kl, &mask)
    }

    /// Observation loss of the agent on a separate batch of episode windows.
    pub fn compute_obs_loss(&mut self) -> Result<Tensor> {
        let batch = self
            .buffer
            .sample_episodes(self.a_batch_size, self.rnn_len, false)?;
        let obs = array_to_tensor::<_, _, f32, f32>(&batch.obs, &self.device)?;
        let ctl = array_to_tensor::<_, _, u32, u32>(&batch.ctl, &self.device)?;
        let mask = array_to_tensor::<_, _, f32, f32>(&batch.mask, &self.device)?;

        let out = self.agent.forward(&obs, &ctl)?;
        let (obs_loss, _) = self.agent.obs_loss(&obs, &ctl, &mask, &out)?;
        Ok(obs_loss.mean_all()?)
    }

    fn opt_(&mut self, mut logger: Option<&mut Logger>) -> Result<Record> {
        let mut critic_loss_sum = 0f32;
        let mut actor_loss_sum = 0f32;
        let mut obs_loss_sum = 0f32;

        for _ in 0..self.a_steps {
            trace!("compute_critic_loss()");
            let critic_loss = self.compute_critic_loss()?;
            self.critic.backward_step(&critic_loss, self.grad_clip)?;

            trace!("compute_actor_loss()");
            let actor_loss = self.compute_actor_loss()?;
            let obs_loss = self.compute_obs_loss()?;
            let total_loss = (&actor_loss + obs_loss.affine(self.obs_penalty, 0.0)?)?;
            let mut grads = total_loss.backward()?;
            if let Some(max_norm) = self.grad_clip {
                clip_grad_norm(&mut grads, &self.agent.vars(), max_norm)?;
            }
            self.actor_opt.step(&grads)?;

            self.critic.soft_update()?;
            self.n_opts += 1;

            let critic_loss = critic_loss.to_scalar::<f32>()?;
            let actor_loss = actor_loss.to_scalar::<f32>()?;
            let obs_loss = obs_loss.to_scalar::<f32>()?;
            critic_loss_sum += critic_loss;
            actor_loss_sum += actor_loss;
            obs_loss_sum += obs_loss;

            if let Some(logger) = logger.as_mut() {
                logger.push(Record::from_slice(&[
                    ("critic_loss", RecordValue::Scalar(critic_loss)),
                    ("actor_loss", RecordValue::Scalar(actor_loss)),
                    ("obs_loss", RecordValue::Scalar(obs_loss)),
                ]));
            }
        }

        let n = self.a_steps as f32;
        Ok(Record::from_slice(&[
            ("critic_loss", RecordValue::Scalar(critic_loss_sum / n)),
            ("actor_loss", RecordValue::Scalar(actor_loss_sum / n)),
            ("obs_loss", RecordValue::Scalar(obs_loss_sum / n)),
        ]))
    }
}

impl<A: MixtureAgent> Agent for Sac<A> {
    fn train(&mut self) {
        self.train = true;
        self.agent.train();
    }

    fn eval(&mut self) {
        self.train = false;
        self.agent.eval();
    }

    fn is_train(&self) -> bool {
        self.train
    }

    fn reset(&mut self) {
        self.agent.reset();
    }

    fn choose_action(&mut self, obs: &[f32]) -> Result<usize> {
        let obs = Tensor::from_slice(obs, (1, obs.len()), &self.device)?;
        self.agent.choose_action(&obs)
    }

    fn state(&self) -> Result<Vec<f32>> {
        Ok(self
            .agent
            .state()?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?)
    }

    fn replay_buffer_mut(&mut self) -> &mut EpisodeReplayBuffer {
        &mut self.buffer
    }

    fn take_gradient_step(&mut self, logger: Option<&mut Logger>) -> Result<Record> {
        self.train();
        let record = self
            .update_normalization_stats()
            .and_then(|_| self.opt_(logger));
        self.eval();
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_value_of_equal_q_values() -> Result<()> {
        let beta = 0.2;
        let q1 = Tensor::new(&[[1.5f32, 1.5, 1.5], [-2.0, -2.0, -2.0]], &Device::Cpu)?;
        let v = soft_value(&q1, &q1, beta)?.to_vec1::<f32>()?;
        let bonus = beta as f32 * 3f32.ln();
        assert!((v[0] - (1.5 + bonus)).abs() < 1e-5);
        assert!((v[1] - (-2.0 + bonus)).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_soft_value_takes_minimum() -> Result<()> {
        let q1 = Tensor::new(&[[0f32, 10.0]], &Device::Cpu)?;
        let q2 = Tensor::new(&[[10f32, 0.0]], &Device::Cpu)?;
        let v = soft_value(&q1, &q2, 1.0)?.to_vec1::<f32>()?;
        assert!((v[0] - 2f32.ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_invalid_config() {
        let config = SacConfig::default().beta(0.0);
        assert!(matches!(
            check_config(&config),
            Err(MixrlError::InvalidConfig(_))
        ));
        let config = SacConfig::default().polyak(1.5);
        assert!(check_config(&config).is_err());
        assert!(check_config(&SacConfig::default()).is_ok());
    }
}
