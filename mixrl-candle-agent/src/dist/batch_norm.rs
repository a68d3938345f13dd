//! Masked batch normalization as a bijective transform.
use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};
use log::trace;
use serde::{Deserialize, Serialize};

/// Whether the inverse pass may update the moving statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Normalize with batch statistics and fold them into the moving ones.
    Train,

    /// Normalize with the moving statistics.
    Eval,
}

/// Configuration of [`BatchNormTransform`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct BatchNormConfig {
    /// Dimension of the feature axis.
    pub input_dim: usize,

    /// Factor of the exponential moving average.
    pub momentum: f64,

    /// Added to variances before taking the square root.
    pub epsilon: f64,

    /// If `true`, `gamma` and `beta` are trainable.
    pub affine: bool,

    /// If `false`, moving statistics are never updated.
    pub update_stats: bool,
}

impl BatchNormConfig {
    /// Creates a configuration with `momentum = 0.1` and `epsilon = 1e-5`.
    pub fn new(input_dim: usize) -> Self {
        Self {
            input_dim,
            momentum: 0.1,
            epsilon: 1e-5,
            affine: false,
            update_stats: true,
        }
    }

    /// Sets the momentum.
    pub fn momentum(mut self, v: f64) -> Self {
        self.momentum = v;
        self
    }

    /// Sets epsilon.
    pub fn epsilon(mut self, v: f64) -> Self {
        self.epsilon = v;
        self
    }

    /// Enables trainable `gamma` and `beta`.
    pub fn affine(mut self, v: bool) -> Self {
        self.affine = v;
        self
    }

    /// Enables updates of the moving statistics.
    pub fn update_stats(mut self, v: bool) -> Self {
        self.update_stats = v;
        self
    }
}

/// Moving statistics of [`BatchNormTransform`].
#[derive(Debug, Clone)]
pub struct BatchNormStats {
    /// Moving mean, `[input_dim]`.
    pub moving_mean: Tensor,

    /// Moving variance, `[input_dim]`.
    pub moving_variance: Tensor,
}

/// Batch normalization transform ignoring zero-padded samples.
///
/// The forward direction maps normalized values to the data space:
///
/// ```text
/// forward(x) = (x - beta) / gamma+ * sqrt(moving_variance + epsilon) + moving_mean
/// ```
///
/// where `gamma+ = relu(gamma) + 1e-6`. The inverse direction normalizes data.
/// Samples whose features are all exactly zero are treated as padding when
/// batch statistics are computed.
pub struct BatchNormTransform {
    config: BatchNormConfig,
    gamma: Tensor,
    beta: Tensor,
    stats: BatchNormStats,
}

impl BatchNormTransform {
    /// Constructs the transform. `gamma` and `beta` are taken from `vb` only
    /// when `affine` is enabled.
    pub fn build(vb: VarBuilder, config: BatchNormConfig) -> Result<Self> {
        let dim = config.input_dim;
        let device = vb.device().clone();
        let (gamma, beta) = if config.affine {
            (
                vb.get_with_hints(dim, "gamma", Init::Const(1.0))?,
                vb.get_with_hints(dim, "beta", Init::Const(0.0))?,
            )
        } else {
            (
                Tensor::ones(dim, DType::F32, &device)?,
                Tensor::zeros(dim, DType::F32, &device)?,
            )
        };
        let stats = BatchNormStats {
            moving_mean: Tensor::zeros(dim, DType::F32, &device)?,
            moving_variance: Tensor::ones(dim, DType::F32, &device)?,
        };

        Ok(Self {
            config,
            gamma,
            beta,
            stats,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }

    /// Returns the moving statistics.
    pub fn stats(&self) -> &BatchNormStats {
        &self.stats
    }

    /// Overwrites the moving statistics.
    pub fn set_stats(&mut self, mean: &Tensor, variance: &Tensor) -> Result<()> {
        self.stats = BatchNormStats {
            moving_mean: mean.to_dtype(DType::F32)?.detach(),
            moving_variance: variance.to_dtype(DType::F32)?.detach(),
        };
        Ok(())
    }

    /// `relu(gamma) + 1e-6`.
    pub fn constrained_gamma(&self) -> Result<Tensor> {
        Ok(self.gamma.relu()?.affine(1.0, 1e-6)?)
    }

    /// Maps normalized values to the data space with the moving statistics.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let std = self.stats.moving_variance.affine(1.0, self.config.epsilon)?.sqrt()?;
        Ok(x
            .broadcast_sub(&self.beta)?
            .broadcast_div(&self.constrained_gamma()?)?
            .broadcast_mul(&std)?
            .broadcast_add(&self.stats.moving_mean)?)
    }

    /// Normalizes `y` with given statistics.
    ///
    /// Returns the normalized values and the log absolute determinant of the
    /// forward Jacobian per feature, `[input_dim]`.
    fn normalize(&self, y: &Tensor, mean: &Tensor, var: &Tensor) -> Result<(Tensor, Tensor)> {
        let gamma = self.constrained_gamma()?;
        let std = var.affine(1.0, self.config.epsilon)?.sqrt()?;
        let x = y
            .broadcast_sub(mean)?
            .broadcast_mul(&gamma)?
            .broadcast_div(&std)?
            .broadcast_add(&self.beta)?;
        let log_det = (std.log()? - gamma.log()?)?;
        Ok((x, log_det))
    }

    /// Normalizes with the moving statistics.
    pub fn inverse(&self, y: &Tensor) -> Result<(Tensor, Tensor)> {
        self.normalize(y, &self.stats.moving_mean, &self.stats.moving_variance)
    }

    /// Normalizes with the statistics of the batch `y` and updates the moving
    /// statistics.
    ///
    /// All axes but the last are reduced. Falls back to [`inverse`](Self::inverse)
    /// if `update_stats` is disabled.
    pub fn inverse_train(&mut self, y: &Tensor) -> Result<(Tensor, Tensor)> {
        if !self.config.update_stats {
            return self.inverse(y);
        }

        let dim = self.config.input_dim;
        let flat = y.reshape((y.elem_count() / dim, dim))?;
        let is_pad = flat.eq(0f64)?.to_dtype(flat.dtype())?.min_keepdim(1)?;
        let mask = is_pad.affine(-1.0, 1.0)?;
        let denom = mask.sum_all()?.affine(1.0, 1e-6)?;

        let mean = flat.broadcast_mul(&mask)?.sum(0)?.broadcast_div(&denom)?;
        let var = flat
            .broadcast_sub(&mean)?
            .sqr()?
            .broadcast_mul(&mask)?
            .sum(0)?
            .broadcast_div(&denom)?;
        trace!("Batch statistics over {:?} samples", flat.dims()[0]);

        let m = self.config.momentum;
        self.stats = BatchNormStats {
            moving_mean: (self.stats.moving_mean.affine(1.0 - m, 0.0)?
                + mean.detach().affine(m, 0.0)?)?,
            moving_variance: (self.stats.moving_variance.affine(1.0 - m, 0.0)?
                + var.detach().affine(m, 0.0)?)?,
        };

        self.normalize(y, &mean, &var)
    }

    /// Dispatches to [`inverse_train`](Self::inverse_train) or [`inverse`](Self::inverse).
    pub fn inverse_with_mode(&mut self, y: &Tensor, mode: Mode) -> Result<(Tensor, Tensor)> {
        match mode {
            Mode::Train => self.inverse_train(y),
            Mode::Eval => self.inverse(y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    fn build(affine: bool, update_stats: bool) -> Result<(VarMap, BatchNormTransform)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = BatchNormConfig::new(3).affine(affine).update_stats(update_stats);
        let bn = BatchNormTransform::build(vb.pp("bn"), config)?;
        Ok((varmap, bn))
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        for affine in [false, true] {
            let (varmap, mut bn) = build(affine, true)?;
            bn.set_stats(
                &Tensor::new(&[1f32, -2.0, 0.5], &Device::Cpu)?,
                &Tensor::new(&[4f32, 0.25, 1.0], &Device::Cpu)?,
            )?;
            if affine {
                assert_eq!(varmap.all_vars().len(), 2);
                let data = varmap.data().lock().unwrap();
                data["bn.gamma"].set(&Tensor::new(&[2f32, 0.5, 1.5], &Device::Cpu)?)?;
                data["bn.beta"].set(&Tensor::new(&[0.3f32, -0.1, 0.0], &Device::Cpu)?)?;
            } else {
                assert!(varmap.all_vars().is_empty());
            }

            let y = Tensor::randn(0f32, 3f32, (7, 2, 3), &Device::Cpu)?;
            let (x, _) = bn.inverse(&y)?;
            let y_ = bn.forward(&x)?;
            assert!(max_abs_diff(&y, &y_)? < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_log_det_matches_forward_slope() -> Result<()> {
        let (_, mut bn) = build(false, true)?;
        bn.set_stats(
            &Tensor::new(&[0f32, 0.0, 0.0], &Device::Cpu)?,
            &Tensor::new(&[4f32, 0.25, 1.0], &Device::Cpu)?,
        )?;
        let x0 = Tensor::zeros((1, 3), DType::F32, &Device::Cpu)?;
        let x1 = Tensor::ones((1, 3), DType::F32, &Device::Cpu)?;
        let slope = (bn.forward(&x1)? - bn.forward(&x0)?)?.squeeze(0)?;

        let (_, log_det) = bn.inverse(&x0)?;
        assert!(max_abs_diff(&log_det, &slope.log()?)? < 1e-4);
        Ok(())
    }

    #[test]
    fn test_moving_stats_ignore_padding() -> Result<()> {
        let (_, mut bn) = build(false, true)?;
        let y = Tensor::new(
            &[[1f32, 2.0, 3.0], [3.0, 6.0, 3.0], [0.0, 0.0, 0.0]],
            &Device::Cpu,
        )?;
        let (x, log_det) = bn.inverse_with_mode(&y, Mode::Train)?;

        // batch mean (2, 4, 3), batch variance (1, 4, 0)
        let mean: Vec<f32> = bn.stats().moving_mean.to_vec1()?;
        let var: Vec<f32> = bn.stats().moving_variance.to_vec1()?;
        for (m, e) in mean.iter().zip([0.2f32, 0.4, 0.3]) {
            assert!((m - e).abs() < 1e-4);
        }
        for (v, e) in var.iter().zip([1.0f32, 1.3, 0.9]) {
            assert!((v - e).abs() < 1e-4);
        }

        // normalized with batch statistics
        let x = x.to_vec2::<f32>()?;
        assert!((x[0][0] + 1.0).abs() < 1e-3);
        assert!((x[1][1] - 1.0).abs() < 1e-3);
        let log_det: Vec<f32> = log_det.to_vec1()?;
        assert!((log_det[1] - 0.5 * (4f32 + 1e-5).ln()).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn test_eval_and_frozen_stats_are_not_updated() -> Result<()> {
        let y = Tensor::new(&[[1f32, 2.0, 3.0], [3.0, 6.0, 3.0]], &Device::Cpu)?;

        let (_, mut bn) = build(false, true)?;
        bn.inverse_with_mode(&y, Mode::Eval)?;
        assert_eq!(bn.stats().moving_mean.to_vec1::<f32>()?, vec![0.0; 3]);

        let (_, mut bn) = build(false, false)?;
        bn.inverse_with_mode(&y, Mode::Train)?;
        assert_eq!(bn.stats().moving_variance.to_vec1::<f32>()?, vec![1.0; 3]);
        Ok(())
    }
}
