//! Utilities.
use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor, WithDType, D};
use candle_nn::VarMap;
use log::trace;
use ndarray::{ArrayBase, Data, Dimension};
use num_traits::AsPrimitive;

/// Apply soft update on variables.
///
/// Variables are identified by their names.
///
/// dest = tau * src + (1.0 - tau) * dest
pub fn track(dest: &VarMap, src: &VarMap, tau: f64) -> Result<()> {
    trace!("dest");
    let dest = dest.data().lock().map_err(|e| anyhow!("{}", e))?;
    trace!("src");
    let src = src.data().lock().map_err(|e| anyhow!("{}", e))?;

    for (k_dest, v_dest) in dest.iter() {
        let v_src = src
            .get(k_dest)
            .ok_or_else(|| anyhow!("Variable {} is not found in the source", k_dest))?;
        let t_dest = (v_src.as_tensor().affine(tau, 0.0)? + v_dest.as_tensor().affine(1.0 - tau, 0.0)?)?;
        v_dest.set(&t_dest)?;
    }

    Ok(())
}

/// Converts an [`ndarray`] array into a tensor of the same shape.
pub fn array_to_tensor<S, D1, T1, T2>(a: &ArrayBase<S, D1>, device: &Device) -> Result<Tensor>
where
    S: Data<Elem = T1>,
    D1: Dimension,
    T1: AsPrimitive<T2>,
    T2: WithDType,
{
    let v = a.iter().map(|e| e.as_()).collect::<Vec<T2>>();
    Ok(Tensor::from_vec(v, a.shape(), device)?)
}

/// Numerically stable `log(sum(exp(x)))` along the last axis.
///
/// The maximum is treated as a constant, which leaves the gradient unchanged.
pub fn logsumexp(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?.detach();
    let lse = x
        .broadcast_sub(&max)?
        .exp()?
        .sum_keepdim(D::Minus1)?
        .log()?
        .add(&max)?;
    Ok(lse.squeeze(D::Minus1)?)
}

/// Discrete KL divergence `KL(p || q)` along the last axis.
pub fn kl_divergence(p: &Tensor, q: &Tensor) -> Result<Tensor> {
    let eps = 1e-6;
    if p.dim(D::Minus1)? != q.dim(D::Minus1)? {
        return Err(anyhow!(
            "Event sizes differ: {:?} and {:?}",
            p.dims(),
            q.dims()
        ));
    }
    let log_p = p.affine(1.0, eps)?.log()?;
    let log_q = q.affine(1.0, eps)?.log()?;
    Ok((p * (log_p - log_q)?)?.sum(D::Minus1)?)
}

/// Mean of `values` over entries where `mask` is one, `sum(values * mask) / (sum(mask) + 1e-6)`.
///
/// Returns zero for an all-zero mask.
pub fn masked_mean(values: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let n = mask.sum_all()?.affine(1.0, 1e-6)?;
    Ok((values * mask)?.sum_all()?.div(&n)?)
}

/// Identity matrix of size `n`.
pub fn eye(n: usize, device: &Device) -> Result<Tensor> {
    let v = (0..n * n)
        .map(|i| if i / n == i % n { 1f32 } else { 0f32 })
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(v, (n, n), device)?)
}

/// Mask selecting the strictly lower triangular part of an `n x n` matrix.
pub fn strict_tril_mask(n: usize, device: &Device) -> Result<Tensor> {
    let v = (0..n * n)
        .map(|i| if i / n > i % n { 1f32 } else { 0f32 })
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(v, (n, n), device)?)
}

/// Diagonal of the last two axes, `[..., n, n] -> [..., n]`.
pub fn diagonal(m: &Tensor) -> Result<Tensor> {
    let n = m.dim(D::Minus1)?;
    let eye = eye(n, m.device())?.to_dtype(m.dtype())?;
    Ok(m.broadcast_mul(&eye)?.sum(D::Minus1)?)
}

/// Returns the scalar value of a tensor with a single element.
pub fn to_scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Init;
    use ndarray::arr2;

    #[test]
    fn test_track() -> Result<()> {
        let tau = 0.7;
        let t_src = Tensor::from_slice(&[1.0f32, 2.0, 3.0], (3,), &Device::Cpu)?;
        let t_dest = Tensor::from_slice(&[4.0f32, 5.0, 6.0], (3,), &Device::Cpu)?;
        let t = ((tau * &t_src)? + (1.0 - tau) * &t_dest)?;

        let init = Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };
        let vm_src = VarMap::new();
        vm_src.get((3,), "var1", init, DType::F32, &Device::Cpu)?;
        vm_src.data().lock().unwrap().get("var1").unwrap().set(&t_src)?;
        let vm_dest = VarMap::new();
        vm_dest.get((3,), "var1", init, DType::F32, &Device::Cpu)?;
        vm_dest.data().lock().unwrap().get("var1").unwrap().set(&t_dest)?;

        track(&vm_dest, &vm_src, tau)?;

        let t_ = vm_dest
            .data()
            .lock()
            .unwrap()
            .get("var1")
            .unwrap()
            .as_tensor()
            .clone();
        assert!((t - t_)?.abs()?.sum_all()?.to_scalar::<f32>()? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_logsumexp() -> Result<()> {
        let x = Tensor::new(&[[1000f32, 1000.0], [0.0, 2f32.ln()]], &Device::Cpu)?;
        let lse: Vec<f32> = logsumexp(&x)?.to_vec1()?;
        assert!((lse[0] - (1000.0 + 2f32.ln())).abs() < 1e-3);
        assert!((lse[1] - 3f32.ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_kl_divergence() -> Result<()> {
        let p = Tensor::new(&[[0.5f32, 0.5], [1.0, 0.0]], &Device::Cpu)?;
        let q = Tensor::new(&[[0.5f32, 0.5], [0.5, 0.5]], &Device::Cpu)?;
        let kl: Vec<f32> = kl_divergence(&p, &q)?.to_vec1()?;
        assert!(kl[0].abs() < 1e-5);
        assert!((kl[1] - 2f32.ln()).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_masked_mean() -> Result<()> {
        let values = Tensor::new(&[[1f32, 2.0], [3.0, 100.0]], &Device::Cpu)?;
        let mask = Tensor::new(&[[1f32, 1.0], [1.0, 0.0]], &Device::Cpu)?;
        let m = masked_mean(&values, &mask)?.to_scalar::<f32>()?;
        assert!((m - 2.0).abs() < 1e-5);

        let mask = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
        let m = masked_mean(&values, &mask)?.to_scalar::<f32>()?;
        assert!(m.is_finite());
        assert_eq!(m, 0.0);
        Ok(())
    }

    #[test]
    fn test_array_to_tensor() -> Result<()> {
        let a = arr2(&[[1u32, 2], [3, 4], [5, 6]]);
        let t = array_to_tensor::<_, _, u32, u32>(&a, &Device::Cpu)?;
        assert_eq!(t.dims(), &[3, 2]);
        assert_eq!(t.to_vec2::<u32>()?, vec![vec![1, 2], vec![3, 4], vec![5, 6]]);
        Ok(())
    }

    #[test]
    fn test_masks() -> Result<()> {
        let m = Tensor::new(&[[1f32, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]], &Device::Cpu)?;
        let d: Vec<f32> = diagonal(&m)?.to_vec1()?;
        assert_eq!(d, vec![1.0, 5.0, 9.0]);

        let l = m.mul(&strict_tril_mask(3, &Device::Cpu)?)?;
        assert_eq!(
            l.to_vec2::<f32>()?,
            vec![vec![0.0, 0.0, 0.0], vec![4.0, 0.0, 0.0], vec![7.0, 8.0, 0.0]]
        );
        Ok(())
    }
}
