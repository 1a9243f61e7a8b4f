//! Checkpoint artifacts
//! Each save is an immutable `checkpoint-{step}/` directory with the
//! adapter weights, the learned token embeddings, and a full config
//! snapshot. Older checkpoints are never touched.

use anyhow::{Context, Result};
use log::info;
use safetensors::{serialize, tensor::TensorView};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::TrainingConfig;
use crate::models::lora::{convert_dtype, tensor_to_vec, LoraCollection};
use crate::trainers::embeddings::TokenEmbeddingsHandler;

pub struct CheckpointWriter {
    root: PathBuf,
}

impl CheckpointWriter {
    /// Clears and recreates `<output_dir>/checkpoints`. Called once per
    /// session, so a rerun never mixes artifacts from an older run.
    pub fn new(output_dir: &Path) -> Result<Self> {
        let root = output_dir.join("checkpoints");
        if root.exists() {
            fs::remove_dir_all(&root)
                .with_context(|| format!("Failed to clear checkpoint dir: {}", root.display()))?;
        }
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create checkpoint dir: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `checkpoint-{step}/` and return its path.
    pub fn write(
        &self,
        step: usize,
        unet_lora: &LoraCollection,
        text_encoder_lora: Option<&LoraCollection>,
        embeddings: &TokenEmbeddingsHandler,
        config: &TrainingConfig,
    ) -> Result<PathBuf> {
        let dir = self.root.join(format!("checkpoint-{}", step));
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        unet_lora.save(&dir.join("lora.safetensors"))?;
        if let Some(te_lora) = text_encoder_lora {
            te_lora.save_with_prefix(&dir.join("text_encoder_lora.safetensors"), "lora_te")?;
        }
        self.save_embeddings(embeddings, &dir.join("embeddings.safetensors"))?;

        // Config snapshot with the wall-clock audit stamped at save time.
        let mut snapshot = config.clone();
        if snapshot.start_time > 0.0 {
            snapshot.job_time = chrono::Utc::now().timestamp() as f64 - snapshot.start_time;
        }
        snapshot.save_as_json(&dir.join("training_args.json"))?;

        info!("Saved checkpoint at step {} -> {}", step, dir.display());
        Ok(dir)
    }

    /// Learned token rows only, one tensor per present encoder.
    fn save_embeddings(&self, embeddings: &TokenEmbeddingsHandler, path: &Path) -> Result<()> {
        let rows = embeddings.get_trainable_embeddings()?;

        let mut tensor_data = Vec::new();
        let mut tensor_info = Vec::new();
        for (i, slot) in rows.iter().enumerate() {
            if let Some(tensor) = slot {
                tensor_info.push((
                    format!("text_encoders_{}", i),
                    convert_dtype(tensor.dtype())?,
                    tensor.dims().to_vec(),
                    tensor_data.len(),
                ));
                tensor_data.push(tensor_to_vec(tensor)?);
            }
        }

        let mut tensors = HashMap::new();
        for (name, dtype, shape, idx) in tensor_info {
            tensors.insert(name, TensorView::new(dtype, shape, &tensor_data[idx])?);
        }
        let data = serialize(&tensors, &None)?;
        fs::write(path, data)
            .with_context(|| format!("Failed to write embeddings: {}", path.display()))?;
        Ok(())
    }
}
