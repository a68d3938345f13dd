//! Probability distributions used by mixture-model agents.
mod batch_norm;
mod covariance;
mod gaussian;
mod gumbel;
mod mixture;
mod transformed;
pub use batch_norm::{BatchNormConfig, BatchNormStats, BatchNormTransform, Mode};
pub use covariance::{make_covariance_matrix, rectify, Rectify};
pub use gaussian::MultivariateNormal;
pub use gumbel::gumbel_softmax;
pub use mixture::{ConditionalGaussian, ConditionalGaussianConfig, CovarianceType};
pub use transformed::{inverse_transforms, Transform, TransformKind, TransformedGaussian};
