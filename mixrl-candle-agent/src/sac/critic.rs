//! Double Q-network with a target network.
use crate::{
    mlp::{Mlp, MlpConfig},
    model::SubModel1,
    opt::{clip_grad_norm, Optimizer, OptimizerConfig},
    util::track,
    Activation,
};
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::trace;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
/// Configuration of [`DoubleCritic`].
pub struct DoubleCriticConfig {
    /// Hidden units of each Q-network.
    pub units: Vec<usize>,

    /// Activation function of the hidden layers.
    pub activation: Activation,

    /// Configuration of the optimizer.
    pub opt_config: OptimizerConfig,
}

impl Default for DoubleCriticConfig {
    fn default() -> Self {
        Self {
            units: vec![64, 64],
            activation: Activation::SiLU,
            opt_config: OptimizerConfig::default(),
        }
    }
}

impl DoubleCriticConfig {
    /// Sets hidden units.
    pub fn units(mut self, v: Vec<usize>) -> Self {
        self.units = v;
        self
    }

    /// Sets the activation function.
    pub fn activation(mut self, v: Activation) -> Self {
        self.activation = v;
        self
    }

    /// Sets optimizer configuration.
    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }

    /// Constructs [`DoubleCriticConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`DoubleCriticConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}

/// Two independent Q-networks `q1`, `q2` mapping inputs to action values,
/// and their target copies.
///
/// The target networks live in their own [`VarMap`] which is never given to
/// an optimizer. They start as an exact copy of the live networks and move
/// toward them by polyak averaging in [`DoubleCritic::soft_update`].
pub struct DoubleCritic {
    polyak: f64,
    varmap: VarMap,
    varmap_tgt: VarMap,
    qs: (Mlp, Mlp),
    qs_tgt: (Mlp, Mlp),
    opt: Optimizer,
}

impl DoubleCritic {
    /// Constructs [`DoubleCritic`] taking `in_dim`-dimensional inputs and
    /// returning `act_dim` action values.
    pub fn build(
        config: DoubleCriticConfig,
        in_dim: usize,
        act_dim: usize,
        polyak: f64,
        device: &Device,
    ) -> Result<Self> {
        let q_config = MlpConfig::new(in_dim, config.units.clone(), act_dim)
            .activation(config.activation);

        let (varmap, qs) = Self::build_networks(&q_config, device)?;
        let (varmap_tgt, qs_tgt) = Self::build_networks(&q_config, device)?;
        let opt = config.opt_config.build(varmap.all_vars())?;

        // Copy parameters
        track(&varmap_tgt, &varmap, 1.0)?;

        Ok(Self {
            polyak,
            varmap,
            varmap_tgt,
            qs,
            qs_tgt,
            opt,
        })
    }

    fn build_networks(q_config: &MlpConfig, device: &Device) -> Result<(VarMap, (Mlp, Mlp))> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let q1 = Mlp::build(vb.pp("q1"), q_config.clone())?;
        let q2 = Mlp::build(vb.pp("q2"), q_config.clone())?;
        Ok((varmap, (q1, q2)))
    }

    /// Action values `(q1, q2)`, each `[..., act_dim]`.
    pub fn forward(&self, o: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.qs.0.forward(o)?, self.qs.1.forward(o)?))
    }

    /// Action values of the target networks.
    pub fn forward_tgt(&self, o: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((self.qs_tgt.0.forward(o)?, self.qs_tgt.1.forward(o)?))
    }

    /// `target = polyak * target + (1 - polyak) * live`.
    pub fn soft_update(&mut self) -> Result<()> {
        trace!("soft_update()");
        track(&self.varmap_tgt, &self.varmap, 1.0 - self.polyak)
    }

    /// Takes an optimization step of the live networks, clipping the gradient
    /// norm to `grad_clip` if given.
    pub fn backward_step(&mut self, loss: &Tensor, grad_clip: Option<f64>) -> Result<()> {
        let mut grads = loss.backward()?;
        if let Some(max_norm) = grad_clip {
            clip_grad_norm(&mut grads, &self.varmap.all_vars(), max_norm)?;
        }
        self.opt.step(&grads)
    }

    /// Variables of the live networks.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Variables of the target networks.
    pub fn varmap_tgt(&self) -> &VarMap {
        &self.varmap_tgt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::to_scalar;
    use candle_nn::loss::mse;

    fn max_var_diff(a: &VarMap, b: &VarMap) -> Result<f32> {
        let a = a.data().lock().unwrap();
        let b = b.data().lock().unwrap();
        let mut max = 0f32;
        for (k, v) in a.iter() {
            let d = (v.as_tensor() - b[k].as_tensor())?.abs()?.flatten_all()?.max(0)?;
            max = max.max(to_scalar(&d)?);
        }
        Ok(max)
    }

    #[test]
    fn test_output_shapes() -> Result<()> {
        let critic = DoubleCritic::build(DoubleCriticConfig::default(), 4, 3, 0.995, &Device::Cpu)?;
        let o = Tensor::zeros((10, 4), DType::F32, &Device::Cpu)?;
        let (q1, q2) = critic.forward(&o)?;
        assert_eq!(q1.dims(), &[10, 3]);
        assert_eq!(q2.dims(), &[10, 3]);

        let o = Tensor::zeros((5, 2, 4), DType::F32, &Device::Cpu)?;
        let (q1, _) = critic.forward_tgt(&o)?;
        assert_eq!(q1.dims(), &[5, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_target_is_a_copy_at_build() -> Result<()> {
        let critic = DoubleCritic::build(DoubleCriticConfig::default(), 4, 3, 0.995, &Device::Cpu)?;
        assert_eq!(max_var_diff(critic.varmap(), critic.varmap_tgt())?, 0.0);
        assert_eq!(critic.varmap().all_vars().len(), 12);
        Ok(())
    }

    #[test]
    fn test_soft_update_moves_target_toward_live() -> Result<()> {
        let polyak = 0.9;
        let mut critic = DoubleCritic::build(DoubleCriticConfig::default(), 4, 3, polyak, &Device::Cpu)?;

        let o = Tensor::randn(0f32, 1f32, (16, 4), &Device::Cpu)?;
        let target = Tensor::ones((16, 3), DType::F32, &Device::Cpu)?.affine(5.0, 0.0)?;
        let (q1, q2) = critic.forward(&o)?;
        let loss = ((mse(&q1, &target)? + mse(&q2, &target)?)? / 2.0)?;
        critic.backward_step(&loss, Some(1.0))?;

        let before = max_var_diff(critic.varmap(), critic.varmap_tgt())?;
        assert!(before > 0.0);
        critic.soft_update()?;
        let after = max_var_diff(critic.varmap(), critic.varmap_tgt())?;
        assert!(after < before);
        assert!((after - polyak as f32 * before).abs() < 1e-5);
        Ok(())
    }
}
