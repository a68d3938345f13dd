//! Errors in the library.
use thiserror::Error;

/// Errors in the library.
#[derive(Error, Debug)]
pub enum MixrlError {
    /// Record key error.
    #[error("Record key error: {0}")]
    RecordKeyError(String),

    /// Record value type error.
    #[error("Record value type error: {0}")]
    RecordValueTypeError(String),

    /// A configuration value that cannot be used.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A transform other than batch normalization was composed with a distribution.
    #[error("Unsupported transform: {0}")]
    UnsupportedTransform(String),

    /// Dimension of given data does not match the expected one.
    #[error("Shape mismatch for {name}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Name of the offending field.
        name: String,
        /// Expected dimension.
        expected: usize,
        /// Given dimension.
        actual: usize,
    },

    /// Action index out of the action space.
    #[error("Action {ctl} is out of range for {act_dim} actions")]
    InvalidAction {
        /// Given action index.
        ctl: usize,
        /// Number of actions.
        act_dim: usize,
    },

    /// Sampling was requested from a buffer holding nothing to sample.
    #[error("Replay buffer has no {0} to sample")]
    EmptyBuffer(String),
}
