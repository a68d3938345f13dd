//! Multivariate normal distribution parametrized by a Cholesky factor.
use crate::util::diagonal;
use anyhow::Result;
use candle_core::{Tensor, D};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Multivariate normal distribution with batch shape `[..., k]`.
///
/// `loc` has shape `[..., k, d]` and `scale_tril` is a lower triangular
/// matrix with a strictly positive diagonal, `[..., k, d, d]`. A batch axis
/// of size one in `scale_tril` is shared by all elements of the batch.
#[derive(Debug, Clone)]
pub struct MultivariateNormal {
    loc: Tensor,
    scale_tril: Tensor,
}

impl MultivariateNormal {
    /// Constructs the distribution.
    pub fn new(loc: Tensor, scale_tril: Tensor) -> Result<Self> {
        let mut shape = loc.dims().to_vec();
        shape.push(*loc.dims().last().unwrap_or(&1));
        let scale_tril = scale_tril.broadcast_as(shape)?;
        Ok(Self { loc, scale_tril })
    }

    /// Dimension of the event space.
    pub fn event_dim(&self) -> Result<usize> {
        Ok(self.loc.dim(D::Minus1)?)
    }

    /// Mean, `[..., k, d]`.
    pub fn mean(&self) -> &Tensor {
        &self.loc
    }

    /// Lower triangular scale matrix, `[..., k, d, d]`.
    pub fn scale_tril(&self) -> &Tensor {
        &self.scale_tril
    }

    /// Diagonal of the covariance matrix, `[..., k, d]`.
    pub fn variance(&self) -> Result<Tensor> {
        Ok(self.scale_tril.sqr()?.sum(D::Minus1)?)
    }

    /// Differential entropy, `[..., k]`.
    pub fn entropy(&self) -> Result<Tensor> {
        let d = self.event_dim()? as f64;
        let half_log_det = diagonal(&self.scale_tril)?.log()?.sum(D::Minus1)?;
        Ok(half_log_det.affine(1.0, 0.5 * d * (1.0 + LN_2PI))?)
    }

    /// Log density of `value`, which must broadcast with `[..., k, d]`.
    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        let d = self.event_dim()?;
        let diff = value.broadcast_sub(&self.loc)?;
        let w = solve_tril(&self.scale_tril, &diff)?;
        let maha = w.sqr()?.sum(D::Minus1)?;
        let half_log_det = diagonal(&self.scale_tril)?.log()?.sum(D::Minus1)?;

        Ok(maha
            .affine(-0.5, -0.5 * d as f64 * LN_2PI)?
            .broadcast_sub(&half_log_det)?)
    }

    /// Reparametrized samples, `[sample_shape..., ..., k, d]`.
    pub fn rsample(&self, sample_shape: &[usize]) -> Result<Tensor> {
        let mut shape = sample_shape.to_vec();
        shape.extend_from_slice(self.loc.dims());
        let eps = Tensor::randn(0f32, 1f32, shape, self.loc.device())?.to_dtype(self.loc.dtype())?;
        let rank = eps.rank();

        // L eps, summed over the last axis of L
        let l_eps = self
            .scale_tril
            .broadcast_mul(&eps.unsqueeze(rank - 1)?)?
            .sum(rank)?;
        Ok(l_eps.broadcast_add(&self.loc)?)
    }
}

/// Solves `L w = b` by forward substitution.
///
/// `l` is `[..., d, d]` lower triangular and `b` is `[..., d]`; batch axes broadcast.
fn solve_tril(l: &Tensor, b: &Tensor) -> Result<Tensor> {
    let d = b.dim(D::Minus1)?;
    let rank = l.rank();
    let mut ws: Vec<Tensor> = Vec::with_capacity(d);

    for i in 0..d {
        let row = l.narrow(rank - 2, i, 1)?.squeeze(rank - 2)?;
        let l_ii = row.narrow(D::Minus1, i, 1)?;
        let b_i = b.narrow(D::Minus1, i, 1)?;
        let rhs = if i == 0 {
            b_i
        } else {
            let w_prev = Tensor::cat(&ws, D::Minus1)?;
            let acc = row
                .narrow(D::Minus1, 0, i)?
                .broadcast_mul(&w_prev)?
                .sum_keepdim(D::Minus1)?;
            b_i.broadcast_sub(&acc)?
        };
        ws.push(rhs.broadcast_div(&l_ii)?);
    }

    Ok(Tensor::cat(&ws, D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn normal_2d() -> Result<MultivariateNormal> {
        // two components sharing L = [[2, 0], [1, 1]]
        let loc = Tensor::new(&[[0f32, 0.0], [1.0, -1.0]], &Device::Cpu)?;
        let l = Tensor::new(&[[[2f32, 0.0], [1.0, 1.0]]], &Device::Cpu)?;
        MultivariateNormal::new(loc, l)
    }

    #[test]
    fn test_log_prob_matches_closed_form() -> Result<()> {
        let dist = normal_2d()?;
        let x = Tensor::new(&[[1f32, 2.0]], &Device::Cpu)?.unsqueeze(1)?;
        let lp = dist.log_prob(&x)?;
        assert_eq!(lp.dims(), &[1, 2]);
        let lp = lp.to_vec2::<f32>()?;

        // S = L L' = [[4, 2], [2, 2]], det S = 4, inv S = [[0.5, -0.5], [-0.5, 1]]
        let quad = |a: f32, b: f32| 0.5 * a * a - a * b + b * b;
        let expected = |a: f32, b: f32| -0.5 * quad(a, b) - LN_2PI as f32 - 0.5 * 4f32.ln();
        assert!((lp[0][0] - expected(1.0, 2.0)).abs() < 1e-4);
        assert!((lp[0][1] - expected(0.0, 3.0)).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_moments() -> Result<()> {
        let dist = normal_2d()?;
        let var = dist.variance()?.to_vec2::<f32>()?;
        assert_eq!(var[1], vec![4.0, 2.0]);

        let ent = dist.entropy()?.to_vec1::<f32>()?;
        let expected = (1.0 + LN_2PI as f32) + 2f32.ln();
        assert!((ent[0] - expected).abs() < 1e-4);

        let samples = dist.rsample(&[20_000])?;
        assert_eq!(samples.dims(), &[20_000, 2, 2]);
        let mean = samples.mean(0)?.to_vec2::<f32>()?;
        assert!((mean[1][0] - 1.0).abs() < 0.1);
        assert!((mean[1][1] + 1.0).abs() < 0.1);
        Ok(())
    }
}
