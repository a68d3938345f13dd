//! A discrete-state belief filter with a Gaussian-mixture observation model.
use super::{AgentOutput, MixtureAgent};
use crate::{
    dist::{ConditionalGaussian, ConditionalGaussianConfig, CovarianceType, Mode},
    mlp::{Mlp, MlpConfig},
    model::SubModel1,
    util::masked_mean,
    Activation,
};
use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{ops::softmax, Init, VarBuilder, VarMap};
use log::info;
use mixrl_core::record::{Record, RecordValue};
use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::SmallRng,
    SeedableRng,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [`BeliefAgent`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct BeliefAgentConfig {
    /// Dimension of observations.
    pub obs_dim: usize,

    /// Number of actions.
    pub act_dim: usize,

    /// Number of latent states.
    pub state_dim: usize,

    /// Covariance structure of the observation model.
    pub cov: CovarianceType,

    /// Batch normalization of observations in the observation model.
    pub batch_norm: bool,

    /// Hidden units of the policy head.
    pub units: Vec<usize>,

    /// Activation function of the policy head.
    pub activation: Activation,

    /// Seed of the action sampler.
    pub seed: u64,
}

impl BeliefAgentConfig {
    /// Creates a configuration with default settings.
    pub fn new(obs_dim: usize, act_dim: usize, state_dim: usize) -> Self {
        Self {
            obs_dim,
            act_dim,
            state_dim,
            cov: CovarianceType::Full,
            batch_norm: true,
            units: vec![64],
            activation: Activation::SiLU,
            seed: 42,
        }
    }

    /// Sets the covariance structure.
    pub fn cov(mut self, v: CovarianceType) -> Self {
        self.cov = v;
        self
    }

    /// Enables or disables batch normalization.
    pub fn batch_norm(mut self, v: bool) -> Self {
        self.batch_norm = v;
        self
    }

    /// Sets hidden units of the policy head.
    pub fn units(mut self, v: Vec<usize>) -> Self {
        self.units = v;
        self
    }

    /// Sets the activation function of the policy head.
    pub fn activation(mut self, v: Activation) -> Self {
        self.activation = v;
        self
    }

    /// Sets the seed.
    pub fn seed(mut self, v: u64) -> Self {
        self.seed = v;
        self
    }

    /// Constructs [`BeliefAgentConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!("Load config of belief agent from {}", path_.to_str().unwrap_or("?"));
        Ok(b)
    }

    /// Saves [`BeliefAgentConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!("Save config of belief agent into {}", path_.to_str().unwrap_or("?"));
        Ok(())
    }
}

/// Belief filter over `state_dim` latent states.
///
/// * initial belief `softmax(b0)`,
/// * transition matrices `softmax(T[a])`, `[act_dim, state_dim, state_dim]`,
///   rows indexed by the current state,
/// * observation model `p(o | s)`, a [`ConditionalGaussian`],
/// * policy `softmax(mlp(b))` over the posterior belief `b`.
///
/// The prior at step `t` is `b_{t-1} T[a_{t-1}]` and the posterior is
/// obtained with [`ConditionalGaussian::infer`]. Actions are sampled from
/// the policy.
pub struct BeliefAgent {
    config: BeliefAgentConfig,
    varmap: VarMap,
    device: Device,
    b0: Tensor,
    transition: Tensor,
    obs_model: ConditionalGaussian,
    policy: Mlp,
    belief: Option<Tensor>,
    prev_ctl: Option<usize>,
    train: bool,
    rng: SmallRng,
}

impl BeliefAgent {
    /// Constructs the agent on `device`.
    pub fn build(config: BeliefAgentConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let (o, a, z) = (config.obs_dim, config.act_dim, config.state_dim);

        let b0 = vb.get_with_hints(z, "b0", Init::Const(0.0))?;
        let transition = vb.get_with_hints(
            (a, z, z),
            "transition",
            Init::Randn {
                mean: 0.0,
                stdev: 0.1,
            },
        )?;
        let obs_model = ConditionalGaussian::build(
            vb.pp("obs_model"),
            ConditionalGaussianConfig::new(o, z)
                .cov(config.cov)
                .batch_norm(config.batch_norm),
        )?;
        let policy = Mlp::build(
            vb.pp("policy"),
            MlpConfig::new(z, config.units.clone(), a).activation(config.activation),
        )?;
        let rng = SmallRng::seed_from_u64(config.seed);

        Ok(Self {
            config,
            varmap,
            device: device.clone(),
            b0,
            transition,
            obs_model,
            policy,
            belief: None,
            prev_ctl: None,
            train: false,
            rng,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BeliefAgentConfig {
        &self.config
    }

    /// The observation model.
    pub fn obs_model(&self) -> &ConditionalGaussian {
        &self.obs_model
    }

    /// Returns `true` in training mode.
    pub fn is_train(&self) -> bool {
        self.train
    }

    fn initial_belief(&self) -> Result<Tensor> {
        Ok(softmax(&self.b0, 0)?.unsqueeze(0)?)
    }

    /// Action probabilities given beliefs `[..., state_dim]`.
    pub fn policy(&self, belief: &Tensor) -> Result<Tensor> {
        Ok(softmax(&self.policy.forward(belief)?, D::Minus1)?)
    }
}

impl MixtureAgent for BeliefAgent {
    fn obs_dim(&self) -> usize {
        self.config.obs_dim
    }

    fn act_dim(&self) -> usize {
        self.config.act_dim
    }

    fn state_dim(&self) -> usize {
        self.config.state_dim
    }

    fn reset(&mut self) {
        self.belief = None;
        self.prev_ctl = None;
    }

    fn choose_action(&mut self, obs: &Tensor) -> Result<usize> {
        let obs = obs.to_device(&self.device)?;
        let prior = match (&self.belief, self.prev_ctl) {
            (Some(b), Some(a)) => {
                let t_a = softmax(&self.transition.get(a)?, D::Minus1)?;
                b.matmul(&t_a)?
            }
            _ => self.initial_belief()?,
        };
        let belief = self.obs_model.infer(&prior, &obs, None)?.detach();

        let probs = self.policy(&belief)?.squeeze(0)?.to_vec1::<f32>()?;
        let ctl = WeightedIndex::new(&probs)?.sample(&mut self.rng);

        self.belief = Some(belief);
        self.prev_ctl = Some(ctl);
        Ok(ctl)
    }

    fn state(&self) -> Result<Tensor> {
        match &self.belief {
            Some(b) => Ok(b.clone()),
            None => self.initial_belief(),
        }
    }

    fn forward(&mut self, obs: &Tensor, ctl: &Tensor) -> Result<AgentOutput> {
        let (seq_len, batch_size) = ctl.dims2()?;
        let z = self.config.state_dim;
        let mode = if self.train { Mode::Train } else { Mode::Eval };

        let trans = softmax(&self.transition, D::Minus1)?;
        let b0 = self
            .initial_belief()?
            .broadcast_as((batch_size, z))?
            .contiguous()?;
        let logp_x = self.obs_model.log_prob_with_mode(obs, mode)?;

        let mut priors = Vec::with_capacity(seq_len);
        let mut beliefs: Vec<Tensor> = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let prior = match beliefs.last() {
                None => b0.clone(),
                Some(b_prev) => {
                    let t_a = trans.index_select(&ctl.get(t - 1)?, 0)?;
                    b_prev.unsqueeze(1)?.matmul(&t_a)?.squeeze(1)?
                }
            };
            let belief = self
                .obs_model
                .infer(&prior, &obs.get(t)?, Some(&logp_x.get(t)?))?;
            priors.push(prior);
            beliefs.push(belief);
        }

        let prior = Tensor::stack(&priors, 0)?;
        let belief = Tensor::stack(&beliefs, 0)?;
        let act_probs = self.policy(&belief)?;

        Ok(AgentOutput {
            act_probs,
            prior,
            belief,
        })
    }

    fn obs_loss(
        &mut self,
        obs: &Tensor,
        _ctl: &Tensor,
        mask: &Tensor,
        out: &AgentOutput,
    ) -> Result<(Tensor, Record)> {
        let logp = self.obs_model.mixture_log_prob(&out.prior, obs)?;
        let loss = masked_mean(&logp, mask)?.neg()?;

        let record = Record::from_slice(&[(
            "obs_logp",
            RecordValue::Scalar(-loss.to_scalar::<f32>()?),
        )]);
        Ok((loss, record))
    }

    fn set_obs_stats(&mut self, mean: &Tensor, variance: &Tensor) -> Result<()> {
        self.obs_model.init_batch_norm(mean, variance)
    }

    fn train(&mut self) {
        self.train = true;
    }

    fn eval(&mut self) {
        self.train = false;
    }

    fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }
}
