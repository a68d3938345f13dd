//! Train [`Agent`].
mod config;
use crate::{
    error::MixrlError,
    record::{Logger, Record, RecordValue},
    Agent, Env,
};
use anyhow::Result;
pub use config::TrainerConfig;
use itertools::Itertools;
use log::{debug, info};
use std::time::SystemTime;

/// Reward computed from the next observation, replacing the one returned by the environment.
pub type CustomReward = Box<dyn Fn(&[f32]) -> f32>;

#[cfg_attr(doc, aquamarine::aquamarine)]
/// Manages the training loop.
///
/// # Training loop
///
/// The loop runs `epochs * steps_per_epoch` environment steps `t`:
///
/// 1. The agent chooses an action `a_t` given `o_t`, then [`Env`] returns
///    `o_t+1` and `r_t`. If a custom reward is set, `r_t` is replaced with
///    its value on `o_t+1`.
/// 2. `(o_t, a_t, b_t, r_t, d_t)` is appended to the agent's replay buffer, where
///    `b_t` is the internal state of the agent after observing `o_t` and
///    `d_t` is the termination flag received with `o_t`.
/// 3. If the episode is done or reaches `max_steps`, the terminal step is
///    recorded with an extra action choice, the episode is closed and
///    `eps_return` (mean reward per step) and `eps_len` are pushed to the
///    [`Logger`]. The agent and the environment are then reset.
/// 4. If `t >= update_after` and `t % update_every == 0`,
///    [`Agent::take_gradient_step`] is called.
/// 5. At the end of an epoch, `epoch` and `time` are pushed, the logger is
///    flushed and [`Agent::on_epoch_end`] is called. With
///    [`train_with_callback`](Trainer::train_with_callback), the callback then
///    receives the agent and the logger once `t > update_after`.
///
/// ```mermaid
/// graph LR
///     A[Agent]-->|ctl|B[Env]
///     B -->|Step|A
///     A -->|push_step|C[EpisodeReplayBuffer]
///     C -->|batches|A
///     A -->|Record|D[Logger]
/// ```
pub struct Trainer {
    config: TrainerConfig,
    custom_reward: Option<CustomReward>,
}

fn check_config(config: &TrainerConfig) -> Result<(), MixrlError> {
    if config.steps_per_epoch == 0 {
        return Err(MixrlError::InvalidConfig(
            "steps_per_epoch must be positive".to_string(),
        ));
    }
    if config.update_every == 0 {
        return Err(MixrlError::InvalidConfig(
            "update_every must be positive".to_string(),
        ));
    }
    Ok(())
}

impl Trainer {
    /// Constructs a trainer.
    pub fn build(config: TrainerConfig) -> Result<Self> {
        check_config(&config)?;
        Ok(Self {
            config,
            custom_reward: None,
        })
    }

    /// Sets a custom reward function of the next observation.
    pub fn custom_reward(mut self, f: impl Fn(&[f32]) -> f32 + 'static) -> Self {
        self.custom_reward = Some(Box::new(f));
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    fn record_step<A: Agent>(
        agent: &mut A,
        obs: &[f32],
        ctl: usize,
        reward: f32,
        done: bool,
    ) -> Result<()> {
        let state = agent.state()?;
        agent
            .replay_buffer_mut()
            .push_step(obs, ctl, &state, reward, done)
    }

    /// Trains the agent in the environment.
    pub fn train<E: Env, A: Agent>(
        &mut self,
        env: &mut E,
        agent: &mut A,
        logger: &mut Logger,
    ) -> Result<()> {
        self.train_with_callback(env, agent, logger, |_, _| Ok(()))
    }

    /// Same as [`train`](Self::train), calling `callback` at the end of every
    /// epoch after `update_after` steps.
    pub fn train_with_callback<E, A, F>(
        &mut self,
        env: &mut E,
        agent: &mut A,
        logger: &mut Logger,
        mut callback: F,
    ) -> Result<()>
    where
        E: Env,
        A: Agent,
        F: FnMut(&mut A, &Logger) -> Result<()>,
    {
        let total_steps = self.config.epochs * self.config.steps_per_epoch;
        let start_time = SystemTime::now();

        agent.eval();
        agent.reset();
        let mut obs = env.reset()?;
        let (mut eps_return, mut eps_len, mut done) = (0f32, 0usize, false);

        for t in 0..total_steps {
            let ctl = agent.choose_action(&obs)?;
            let step = env.step(ctl)?;
            let reward = match &self.custom_reward {
                Some(f) => f(&step.next_obs),
                None => step.reward,
            };
            eps_return += reward;
            eps_len += 1;

            Self::record_step(agent, &obs, ctl, reward, done)?;
            obs = step.next_obs;
            done = step.done;

            if done || eps_len + 1 >= self.config.max_steps {
                let ctl = agent.choose_action(&obs)?;
                Self::record_step(agent, &obs, ctl, reward, done)?;
                agent.replay_buffer_mut().close_episode();

                logger.push(Record::from_scalar(
                    "eps_return",
                    eps_return / eps_len as f32,
                ));
                logger.push(Record::from_scalar("eps_len", eps_len as f32));
                debug!("Episode finished at step {} with length {}", t, eps_len);

                agent.reset();
                obs = env.reset()?;
                eps_return = 0.0;
                eps_len = 0;
                done = false;
            }

            if t >= self.config.update_after && t % self.config.update_every == 0 {
                let record = agent.take_gradient_step(Some(logger))?;
                if self.config.verbose {
                    info!("t: {}, {}", t, format_scalars(&record));
                }
            }

            if (t + 1) % self.config.steps_per_epoch == 0 {
                let epoch = (t + 1) / self.config.steps_per_epoch;
                logger.push(Record::from_scalar("epoch", epoch as f32));
                logger.push(Record::from_scalar(
                    "time",
                    start_time.elapsed()?.as_secs_f32(),
                ));
                logger.flush(t as i64 + 1);
                agent.on_epoch_end();

                if t > self.config.update_after {
                    callback(agent, logger)?;
                }
            }
        }

        Ok(())
    }
}

fn format_scalars(record: &Record) -> String {
    record
        .iter()
        .sorted_by(|(k1, _), (k2, _)| k1.cmp(k2))
        .filter_map(|(k, v)| match v {
            RecordValue::Scalar(v) => Some(format!("{}: {:.4}", k, v)),
            _ => None,
        })
        .join(", ")
}
