//! Soft actor-critic over latent Gaussian-mixture policies, implemented with
//! [candle](https://crates.io/crates/candle-core).
//!
//! * [`dist`] - covariance construction, masked batch normalization and the
//!   conditional Gaussian mixture component.
//! * [`sac`] - the double-Q critic with its target network and the SAC trainer.
//! * [`agent`] - the interface of agents trained by [`sac::Sac`] and a
//!   reference belief-filter agent.
pub mod agent;
pub mod dist;
pub mod mlp;
pub mod model;
pub mod opt;
pub mod sac;
pub mod util;
use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Copy, Deserialize, Serialize, PartialEq)]
/// Device for using candle.
///
/// This enum is added because [`candle_core::Device`] does not support serialization.
pub enum Device {
    /// The main CPU device.
    Cpu,

    /// The main GPU device.
    Cuda(usize),
}

impl Device {
    /// Creates the corresponding [`candle_core::Device`].
    pub fn create(&self) -> Result<candle_core::Device> {
        match self {
            Self::Cpu => Ok(candle_core::Device::Cpu),
            Self::Cuda(n) => Ok(candle_core::Device::new_cuda(*n)?),
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu
    }
}

#[derive(Clone, Debug, Copy, Deserialize, Serialize, PartialEq, Eq)]
/// Activation functions.
pub enum Activation {
    /// No activation.
    None,

    /// Rectified linear unit.
    ReLU,

    /// Sigmoid linear unit.
    SiLU,

    /// Hyperbolic tangent.
    Tanh,
}

impl Activation {
    /// Applies the activation function.
    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::None => Ok(xs.clone()),
            Self::ReLU => xs.relu(),
            Self::SiLU => candle_nn::ops::silu(xs),
            Self::Tanh => xs.tanh(),
        }
    }
}
