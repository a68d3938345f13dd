//! Gumbel-softmax relaxation of categorical samples.
use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::ops::softmax;

/// Draws relaxed one-hot samples from the categorical distribution with
/// unnormalized log probabilities `logits` along the last axis.
///
/// If `hard` is `true` the samples are exactly one-hot, while gradients flow
/// through the relaxed samples (straight-through estimator).
pub fn gumbel_softmax(logits: &Tensor, tau: f64, hard: bool) -> Result<Tensor> {
    let device = logits.device();
    let u = Tensor::rand(0f32, 1f32, logits.dims(), device)?.to_dtype(logits.dtype())?;
    let gumbels = u
        .affine(1.0, 1e-10)?
        .log()?
        .neg()?
        .affine(1.0, 1e-10)?
        .log()?
        .neg()?;
    let y_soft = softmax(&(logits + gumbels)?.affine(1.0 / tau, 0.0)?, D::Minus1)?;

    if !hard {
        return Ok(y_soft);
    }

    let n = y_soft.dim(D::Minus1)?;
    let index = y_soft.argmax_keepdim(D::Minus1)?;
    let y_hard = Tensor::arange(0u32, n as u32, device)?
        .broadcast_eq(&index)?
        .to_dtype(y_soft.dtype())?;
    Ok(((y_hard - y_soft.detach())? + y_soft)?)
}
