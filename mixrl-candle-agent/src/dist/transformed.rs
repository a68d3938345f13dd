//! Gaussian distributions pushed through bijective transforms.
use super::{BatchNormConfig, BatchNormTransform, Mode, MultivariateNormal};
use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::VarBuilder;
use mixrl_core::error::MixrlError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Kinds of transforms that can be composed with a Gaussian.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy)]
#[serde(try_from = "String", into = "String")]
pub enum TransformKind {
    /// [`BatchNormTransform`].
    BatchNorm,
}

impl FromStr for TransformKind {
    type Err = MixrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch_norm" => Ok(Self::BatchNorm),
            _ => Err(MixrlError::UnsupportedTransform(s.to_string())),
        }
    }
}

impl TryFrom<String> for TransformKind {
    type Error = MixrlError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TransformKind> for String {
    fn from(kind: TransformKind) -> Self {
        match kind {
            TransformKind::BatchNorm => "batch_norm".to_string(),
        }
    }
}

/// Bijective transforms with closed-form moments.
pub enum Transform {
    /// Masked batch normalization.
    BatchNorm(BatchNormTransform),
}

impl Transform {
    /// Builds a transform of the given kind on `dim`-dimensional values.
    pub fn build(kind: TransformKind, vb: VarBuilder, bn_config: BatchNormConfig) -> Result<Self> {
        match kind {
            TransformKind::BatchNorm => Ok(Self::BatchNorm(BatchNormTransform::build(
                vb.pp("bn"),
                bn_config,
            )?)),
        }
    }

    /// Maps base values to the data space.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::BatchNorm(bn) => bn.forward(x),
        }
    }

    /// Maps data to the base space without side effects.
    ///
    /// Returns the mapped values and the log absolute determinant of the
    /// forward Jacobian per feature.
    pub fn inverse(&self, y: &Tensor) -> Result<(Tensor, Tensor)> {
        match self {
            Self::BatchNorm(bn) => bn.inverse(y),
        }
    }

    /// Maps data to the base space, updating internal statistics in [`Mode::Train`].
    pub fn inverse_with_mode(&mut self, y: &Tensor, mode: Mode) -> Result<(Tensor, Tensor)> {
        match self {
            Self::BatchNorm(bn) => bn.inverse_with_mode(y, mode),
        }
    }

    /// Factor by which the transform scales the standard deviation, per feature.
    fn scale(&self) -> Result<Tensor> {
        match self {
            Self::BatchNorm(bn) => Ok(bn
                .stats()
                .moving_variance
                .sqrt()?
                .div(&bn.constrained_gamma()?)?),
        }
    }
}

/// A [`MultivariateNormal`] followed by a sequence of transforms.
pub struct TransformedGaussian<'a> {
    base: MultivariateNormal,
    transforms: &'a [Transform],
}

impl<'a> TransformedGaussian<'a> {
    /// Constructs the distribution.
    pub fn new(base: MultivariateNormal, transforms: &'a [Transform]) -> Self {
        Self { base, transforms }
    }

    /// The base distribution.
    pub fn base(&self) -> &MultivariateNormal {
        &self.base
    }

    /// Mean, the base mean pushed through the transforms.
    pub fn mean(&self) -> Result<Tensor> {
        let mut mean = self.base.mean().clone();
        for t in self.transforms.iter() {
            mean = t.forward(&mean)?;
        }
        Ok(mean)
    }

    /// Diagonal of the covariance matrix.
    pub fn variance(&self) -> Result<Tensor> {
        let mut variance = self.base.variance()?;
        for t in self.transforms.iter() {
            variance = variance.broadcast_mul(&t.scale()?.sqr()?)?;
        }
        Ok(variance)
    }

    /// Differential entropy.
    pub fn entropy(&self) -> Result<Tensor> {
        let mut entropy = self.base.entropy()?;
        for t in self.transforms.iter() {
            entropy = entropy.broadcast_add(&t.scale()?.log()?.sum_all()?)?;
        }
        Ok(entropy)
    }

    /// Log density of `y`.
    pub fn log_prob(&self, y: &Tensor) -> Result<Tensor> {
        let mut x = y.clone();
        let mut log_det = None;
        for t in self.transforms.iter().rev() {
            let (x_, ld) = t.inverse(&x)?;
            log_det = accumulate(log_det, ld.sum(D::Minus1)?)?;
            x = x_;
        }
        let log_prob = self.base.log_prob(&x)?;
        match log_det {
            Some(ld) => Ok(log_prob.broadcast_sub(&ld)?),
            None => Ok(log_prob),
        }
    }

    /// Reparametrized samples.
    pub fn rsample(&self, sample_shape: &[usize]) -> Result<Tensor> {
        let mut x = self.base.rsample(sample_shape)?;
        for t in self.transforms.iter() {
            x = t.forward(&x)?;
        }
        Ok(x)
    }
}

/// Maps `y` to the base space through `transforms` in reverse order.
///
/// Returns the base values and the total log absolute determinant of the
/// forward Jacobian.
pub fn inverse_transforms(
    transforms: &mut [Transform],
    y: &Tensor,
    mode: Mode,
) -> Result<(Tensor, Option<Tensor>)> {
    let mut x = y.clone();
    let mut log_det = None;
    for t in transforms.iter_mut().rev() {
        let (x_, ld) = t.inverse_with_mode(&x, mode)?;
        log_det = accumulate(log_det, ld.sum(D::Minus1)?)?;
        x = x_;
    }
    Ok((x, log_det))
}

fn accumulate(acc: Option<Tensor>, v: Tensor) -> Result<Option<Tensor>> {
    match acc {
        None => Ok(Some(v)),
        Some(acc) => Ok(Some(acc.broadcast_add(&v)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_transform_kind_from_name() {
        assert_eq!("batch_norm".parse::<TransformKind>().unwrap(), TransformKind::BatchNorm);
        assert!(matches!(
            "planar".parse::<TransformKind>(),
            Err(MixrlError::UnsupportedTransform(_))
        ));
        assert!(serde_yaml::from_str::<TransformKind>("radial").is_err());
        assert_eq!(
            serde_yaml::from_str::<TransformKind>("batch_norm").unwrap(),
            TransformKind::BatchNorm
        );
    }

    #[test]
    fn test_transformed_moments() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut transform = Transform::build(TransformKind::BatchNorm, vb, BatchNormConfig::new(2))?;
        let Transform::BatchNorm(bn) = &mut transform;
        bn.set_stats(
            &Tensor::new(&[1f32, -1.0], &device)?,
            &Tensor::new(&[4f32, 9.0], &device)?,
        )?;
        let transforms = vec![transform];

        let loc = Tensor::new(&[[0f32, 1.0]], &device)?;
        let l = Tensor::new(&[[[1f32, 0.0], [0.0, 1.0]]], &device)?;
        let base = MultivariateNormal::new(loc, l)?;
        let base_entropy = base.entropy()?.to_vec1::<f32>()?[0];
        let dist = TransformedGaussian::new(base, &transforms);

        let mean = dist.mean()?.to_vec2::<f32>()?;
        assert!((mean[0][0] - 1.0).abs() < 1e-3);
        assert!((mean[0][1] - 2.0).abs() < 1e-3);

        let var = dist.variance()?.to_vec2::<f32>()?;
        assert!((var[0][0] - 4.0).abs() < 1e-3);
        assert!((var[0][1] - 9.0).abs() < 1e-3);

        let ent = dist.entropy()?.to_vec1::<f32>()?[0];
        assert!((ent - base_entropy - 6f32.ln()).abs() < 1e-3);

        // Density of a scaled Gaussian: N(y; m, diag(4, 9)) at y = m
        let y = Tensor::new(&[[1f32, 2.0]], &device)?;
        let lp = dist.log_prob(&y)?.to_vec1::<f32>()?[0];
        let expected = -(2.0 * std::f32::consts::PI).ln() - 6f32.ln();
        assert!((lp - expected).abs() < 1e-3);
        Ok(())
    }
}
