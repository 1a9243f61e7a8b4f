pub mod checkpoint;
pub mod ddpm;
pub mod embeddings;
pub mod loss;
pub mod lr;
pub mod optimizer;
pub mod pivotal;

pub use checkpoint::CheckpointWriter;
pub use ddpm::{NoiseScheduler, PredictionType};
pub use embeddings::TokenEmbeddingsHandler;
pub use loss::DiffusionLoss;
pub use optimizer::{OptimizerCollection, OptimizerHandle, OptimizerKind, ParameterGroup};
pub use pivotal::{PivotalTrainer, TrainingSession};
