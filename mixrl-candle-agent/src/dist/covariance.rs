//! Construction of covariance matrices from unconstrained parameters.
use crate::util::{eye, strict_tril_mask};
use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

const LOW: f64 = 1e-6;
const HIGH: f64 = 1e6;

/// Positivity map applied to log-scale parameters.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Default)]
pub enum Rectify {
    /// `exp(x)`, with `x` clipped to `[ln 1e-6, ln 1e6]`.
    #[default]
    Exp,

    /// `elu(x) + 1`, with `x` clipped to `[ln(1 + 1e-6), 1e6]`.
    Elu,
}

/// Maps `x` to strictly positive values.
pub fn rectify(x: &Tensor, method: Rectify) -> Result<Tensor> {
    let out = match method {
        Rectify::Exp => x.clamp(LOW.ln(), HIGH.ln())?.exp()?,
        Rectify::Elu => x.clamp((LOW + 1.0).ln(), HIGH)?.elu(1.0)?.affine(1.0, 1.0)?,
    };
    Ok(out)
}

/// Builds a lower triangular scale matrix, or the covariance matrix itself.
///
/// * `lv` - log-scale vector, `[..., dim]`.
/// * `tl` - unconstrained matrix, `[..., dim, dim]`; only its strictly lower
///   triangular part is used.
/// * `cholesky` - if `true` the Cholesky factor `L` is returned, otherwise `L Lᵗ`.
pub fn make_covariance_matrix(
    lv: &Tensor,
    tl: Option<&Tensor>,
    cholesky: bool,
    method: Rectify,
) -> Result<Tensor> {
    let dim = lv.dims()[lv.rank() - 1];
    let device = lv.device();
    let var = rectify(lv, method)?;

    let eye = eye(dim, device)?.to_dtype(lv.dtype())?;
    let mut l = var.unsqueeze(var.rank())?.broadcast_mul(&eye)?;
    if let Some(tl) = tl {
        let mask = strict_tril_mask(dim, device)?.to_dtype(tl.dtype())?;
        l = l.broadcast_add(&tl.broadcast_mul(&mask)?)?;
    }

    if cholesky {
        Ok(l)
    } else {
        let r = l.rank();
        // (L Lᵗ)_ij = sum_k L_ik L_jk
        let cov = l
            .unsqueeze(r - 1)?
            .broadcast_mul(&l.unsqueeze(r - 2)?)?
            .sum(r)?;
        Ok(cov)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::diagonal;
    use candle_core::{Device, D};

    #[test]
    fn test_diagonal_is_bounded() -> Result<()> {
        let lv = Tensor::new(&[[-100f32, 0.0, 100.0]], &Device::Cpu)?;
        for method in [Rectify::Exp, Rectify::Elu] {
            let l = make_covariance_matrix(&lv, None, true, method)?;
            let d = diagonal(&l)?.flatten_all()?.to_vec1::<f32>()?;
            assert!(d.iter().all(|&v| v > 0.0));
            if method == Rectify::Exp {
                assert!((d[0] - 1e-6).abs() < 1e-9);
                assert!((d[1] - 1.0).abs() < 1e-6);
                assert!((d[2] - 1e6).abs() < 10.0);
            }
        }
        Ok(())
    }

    #[test]
    fn test_lower_triangular() -> Result<()> {
        let lv = Tensor::randn(0f32, 1f32, (4, 3), &Device::Cpu)?;
        let tl = Tensor::randn(0f32, 1f32, (4, 3, 3), &Device::Cpu)?;
        let l = make_covariance_matrix(&lv, Some(&tl), true, Rectify::Exp)?;
        assert_eq!(l.dims(), &[4, 3, 3]);

        let l = l.to_vec3::<f32>()?;
        let tl = tl.to_vec3::<f32>()?;
        for k in 0..4 {
            for i in 0..3 {
                for j in 0..3 {
                    if j > i {
                        assert_eq!(l[k][i][j], 0.0);
                    } else if j < i {
                        assert_eq!(l[k][i][j], tl[k][i][j]);
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_covariance_is_symmetric_psd() -> Result<()> {
        let lv = Tensor::randn(0f32, 1f32, (5, 3), &Device::Cpu)?;
        let tl = Tensor::randn(0f32, 1f32, (5, 3, 3), &Device::Cpu)?;
        let cov = make_covariance_matrix(&lv, Some(&tl), false, Rectify::Exp)?;

        let diff = (&cov - cov.transpose(1, 2)?)?.abs()?.max_keepdim(D::Minus1)?;
        assert!(diff.flatten_all()?.max(0)?.to_scalar::<f32>()? < 1e-4);

        // x' S x >= 0
        let x = Tensor::randn(0f32, 1f32, (5, 3), &Device::Cpu)?;
        let sx = cov.broadcast_mul(&x.unsqueeze(1)?)?.sum(2)?;
        let quad = (sx * &x)?.sum(1)?.to_vec1::<f32>()?;
        assert!(quad.iter().all(|&q| q >= -1e-4));
        Ok(())
    }

    #[test]
    fn test_covariance_matches_product() -> Result<()> {
        // L = [[2, 0], [3, 1]] => L L' = [[4, 6], [6, 10]]
        let lv = Tensor::new(&[2f32.ln(), 0.0], &Device::Cpu)?;
        let tl = Tensor::new(&[[9f32, 9.0], [3.0, 9.0]], &Device::Cpu)?;
        let cov = make_covariance_matrix(&lv, Some(&tl), false, Rectify::Exp)?;
        let cov = cov.to_vec2::<f32>()?;
        let expected = [[4f32, 6.0], [6.0, 10.0]];
        for i in 0..2 {
            for j in 0..2 {
                assert!((cov[i][j] - expected[i][j]).abs() < 1e-4);
            }
        }
        Ok(())
    }
}
