//! Configuration-error taxonomy
//! Anything here is a setup mistake and aborts before training compute.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("Unknown optimizer '{0}' (expected 'prodigy' or 'adamw')")]
    UnknownOptimizer(String),

    #[error("Unsupported prediction type '{0}' (expected 'epsilon' or 'v_prediction')")]
    UnsupportedPredictionType(String),

    #[error("Batch token shape mismatch: expected {expected} encoder sequences, got {got}")]
    BatchShapeMismatch { expected: usize, got: usize },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}
