//! Gaussian components of a mixture model conditioned on a discrete latent.
use super::{
    gumbel_softmax, inverse_transforms, make_covariance_matrix, BatchNormConfig, Mode,
    MultivariateNormal, Rectify, Transform, TransformKind, TransformedGaussian,
};
use crate::util::logsumexp;
use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{ops::softmax, Init, VarBuilder};
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-6;

/// Structure of the component covariance matrices.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default)]
pub enum CovarianceType {
    /// Independent diagonal covariance per component.
    Diag,

    /// Independent full covariance per component.
    #[default]
    Full,

    /// A single full covariance shared by all components.
    Tied,
}

/// Configuration of [`ConditionalGaussian`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ConditionalGaussianConfig {
    /// Dimension of observations.
    pub x_dim: usize,

    /// Number of components.
    pub z_dim: usize,

    /// Covariance structure.
    #[serde(default)]
    pub cov: CovarianceType,

    /// Transforms applied to the Gaussian components, in forward order.
    #[serde(default = "default_transforms")]
    pub transforms: Vec<TransformKind>,

    /// Positivity map of the log-scale parameters.
    #[serde(default)]
    pub rectify: Rectify,
}

fn default_transforms() -> Vec<TransformKind> {
    vec![TransformKind::BatchNorm]
}

impl ConditionalGaussianConfig {
    /// Creates a configuration with full covariance and batch normalization.
    pub fn new(x_dim: usize, z_dim: usize) -> Self {
        Self {
            x_dim,
            z_dim,
            cov: CovarianceType::Full,
            transforms: default_transforms(),
            rectify: Rectify::Exp,
        }
    }

    /// Sets the covariance structure.
    pub fn cov(mut self, v: CovarianceType) -> Self {
        self.cov = v;
        self
    }

    /// Enables or disables batch normalization of observations.
    pub fn batch_norm(mut self, v: bool) -> Self {
        self.transforms = if v { default_transforms() } else { vec![] };
        self
    }

    /// Sets the positivity map.
    pub fn rectify(mut self, v: Rectify) -> Self {
        self.rectify = v;
        self
    }
}

/// Gaussian distributions `p(x | z = k)` for `k = 0, ..., z_dim - 1`.
///
/// Parameters are a mean `mu` `[z_dim, x_dim]`, a log-scale `lv` and, unless
/// the covariance is diagonal, the strictly lower triangular part of the
/// scale matrix `tl`. With [`CovarianceType::Tied`] `lv` is `[1, x_dim]` and
/// `tl` is `[1, x_dim, x_dim]`.
///
/// Observations are modeled in a batch-normalized space; the batch norm
/// statistics are fixed unless set with [`init_batch_norm`](Self::init_batch_norm).
pub struct ConditionalGaussian {
    config: ConditionalGaussianConfig,
    mu: Tensor,
    lv: Tensor,
    tl: Option<Tensor>,
    transforms: Vec<Transform>,
}

impl ConditionalGaussian {
    /// Builds the component parameters with `vb`.
    pub fn build(vb: VarBuilder, config: ConditionalGaussianConfig) -> Result<Self> {
        let (x, z) = (config.x_dim, config.z_dim);
        let mu = vb.get_with_hints((z, x), "mu", Init::Uniform { lo: -1.0, up: 1.0 })?;
        let (lv, tl) = match config.cov {
            CovarianceType::Diag => (vb.get_with_hints((z, x), "lv", Init::Const(0.0))?, None),
            CovarianceType::Full => (
                vb.get_with_hints((z, x), "lv", Init::Const(0.0))?,
                Some(vb.get_with_hints((z, x, x), "tl", Init::Const(0.0))?),
            ),
            CovarianceType::Tied => (
                vb.get_with_hints((1, x), "lv", Init::Const(0.0))?,
                Some(vb.get_with_hints((1, x, x), "tl", Init::Const(0.0))?),
            ),
        };

        let bn_config = BatchNormConfig::new(x)
            .momentum(0.1)
            .affine(false)
            .update_stats(false);
        let transforms = config
            .transforms
            .iter()
            .enumerate()
            .map(|(i, kind)| Transform::build(*kind, vb.pp(format!("t{}", i)), bn_config.clone()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            mu,
            lv,
            tl,
            transforms,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ConditionalGaussianConfig {
        &self.config
    }

    /// Sets the batch norm statistics to the given observation statistics.
    pub fn init_batch_norm(&mut self, mean: &Tensor, variance: &Tensor) -> Result<()> {
        for t in self.transforms.iter_mut() {
            match t {
                Transform::BatchNorm(bn) => bn.set_stats(mean, variance)?,
            }
        }
        Ok(())
    }

    /// Lower triangular scale matrices, `[z_dim, x_dim, x_dim]` (`[1, ...]` when tied).
    pub fn scale_tril(&self) -> Result<Tensor> {
        make_covariance_matrix(&self.lv, self.tl.as_ref(), true, self.config.rectify)
    }

    fn base(&self) -> Result<MultivariateNormal> {
        MultivariateNormal::new(self.mu.clone(), self.scale_tril()?)
    }

    /// The component distributions in the observation space.
    pub fn distribution(&self) -> Result<TransformedGaussian<'_>> {
        Ok(TransformedGaussian::new(self.base()?, &self.transforms))
    }

    /// Component means, `[z_dim, x_dim]`.
    pub fn mean(&self) -> Result<Tensor> {
        self.distribution()?.mean()
    }

    /// Component variances, `[z_dim, x_dim]`.
    pub fn variance(&self) -> Result<Tensor> {
        self.distribution()?.variance()
    }

    /// Component entropies, `[z_dim]`.
    pub fn entropy(&self) -> Result<Tensor> {
        self.distribution()?.entropy()
    }

    /// Component log likelihoods, `[..., x_dim] -> [..., z_dim]`.
    pub fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.unsqueeze(x.rank() - 1)?;
        self.distribution()?.log_prob(&x)
    }

    /// Same as [`log_prob`](Self::log_prob), but the transforms see the batch
    /// in the given mode.
    pub fn log_prob_with_mode(&mut self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        let y = x.unsqueeze(x.rank() - 1)?;
        let (x, log_det) = inverse_transforms(&mut self.transforms, &y, mode)?;
        let log_prob = self.base()?.log_prob(&x)?;
        match log_det {
            Some(ld) => Ok(log_prob.broadcast_sub(&ld)?),
            None => Ok(log_prob),
        }
    }

    /// Mixture log likelihood under mixing weights `pi` `[..., z_dim]`.
    ///
    /// `pi` broadcasts against the batch axes of `x`.
    pub fn mixture_log_prob(&self, pi: &Tensor, x: &Tensor) -> Result<Tensor> {
        let logp_pi = pi.affine(1.0, EPS)?.log()?;
        let logp_x = self.log_prob(x)?;
        logsumexp(&logp_pi.broadcast_add(&logp_x)?)
    }

    /// Reparametrized component samples, `[sample_shape..., z_dim, x_dim]`.
    pub fn sample(&self, sample_shape: &[usize]) -> Result<Tensor> {
        self.distribution()?.rsample(sample_shape)
    }

    /// Posterior over components given `prior` `[..., z_dim]` and observations
    /// `x` `[..., x_dim]`.
    ///
    /// `logp_x` can be given to avoid recomputing the component log likelihoods.
    pub fn infer(&self, prior: &Tensor, x: &Tensor, logp_x: Option<&Tensor>) -> Result<Tensor> {
        let logp_x = match logp_x {
            Some(logp_x) => logp_x.clone(),
            None => self.log_prob(x)?,
        };
        let logits = prior.affine(1.0, EPS)?.log()?.broadcast_add(&logp_x)?;
        Ok(softmax(&logits, D::Minus1)?)
    }

    /// Average of the component means weighted by `pi` `[..., z_dim]`.
    pub fn bayesian_average(&self, pi: &Tensor) -> Result<Tensor> {
        let mu = self.mean()?;
        let x = pi
            .unsqueeze(pi.rank())?
            .broadcast_mul(&mu)?
            .sum(pi.rank() - 1)?;
        Ok(x)
    }

    /// Samples observations by first drawing components from `pi` `[..., z_dim]`.
    ///
    /// Components are drawn with Gumbel-softmax of temperature `tau`. If
    /// `sample_mean` is `true` the component means are returned instead of
    /// component samples. Returns `[num_samples, ..., x_dim]`.
    pub fn ancestral_sample(
        &self,
        pi: &Tensor,
        num_samples: usize,
        sample_mean: bool,
        tau: f64,
        hard: bool,
    ) -> Result<Tensor> {
        let mut shape = vec![num_samples];
        shape.extend_from_slice(pi.dims());
        let log_pi = pi.affine(1.0, EPS)?.log()?.unsqueeze(0)?.broadcast_as(shape)?;
        let z = gumbel_softmax(&log_pi, tau, hard)?;
        let z = z.unsqueeze(z.rank())?;

        let x = if sample_mean {
            self.mean()?
        } else {
            let mut sample_shape = vec![num_samples];
            sample_shape.extend_from_slice(&pi.dims()[..pi.rank() - 1]);
            self.sample(&sample_shape)?
        };

        Ok(z.broadcast_mul(&x)?.sum(z.rank() - 2)?)
    }
}
