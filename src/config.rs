//! Training configuration
//! Loaded from YAML, snapshotted into every checkpoint as JSON.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::TrainerError;
use crate::trainers::ddpm::PredictionType;
use crate::trainers::optimizer::OptimizerKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub output_dir: PathBuf,
    pub seed: Option<u64>,
    pub resolution: usize,
    pub train_batch_size: usize,
    pub num_train_epochs: usize,
    pub max_train_steps: Option<usize>,
    pub checkpointing_steps: usize,
    pub gradient_accumulation_steps: usize,

    // UNet adapter group
    pub unet_optimizer: String,
    pub unet_lr: f64,
    pub prodigy_d_coef: f64,
    pub prodigy_growth_rate: f64,
    pub lora_rank: usize,
    pub lora_alpha_multiplier: f64,
    pub lora_weight_decay: f64,
    pub use_dora: bool,

    // Textual-inversion group
    pub ti_optimizer: String,
    pub ti_lr: f64,
    pub ti_weight_decay: f64,
    pub hard_pivot: bool,
    pub pivot_completion_f: f64,
    pub off_ratio_power: f64,
    pub n_tokens: usize,

    // Text-encoder adapter group; the whole group is skipped when the
    // optimizer field is None.
    pub text_encoder_lora_optimizer: Option<String>,
    pub text_encoder_lora_lr: f64,
    pub text_encoder_lora_weight_decay: f64,
    pub text_encoder_lora_rank: usize,

    // Loss
    pub l1_penalty: f64,
    pub snr_gamma: Option<f32>,
    pub noise_offset: f64,
    pub prediction_type: String,

    // Named schedule for the UNet group when it runs a fixed-rate optimizer
    pub lr_scheduler_name: Option<String>,
    pub lr_warmup_steps: usize,
    pub lr_num_cycles: usize,
    pub lr_power: f64,

    pub device_ordinal: usize,
    pub n_sample_imgs: usize,

    // Wall-clock audit, stamped into every checkpoint snapshot
    pub start_time: f64,
    pub job_time: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("lora_models/unnamed"),
            seed: None,
            resolution: 512,
            train_batch_size: 4,
            num_train_epochs: 10_000,
            max_train_steps: Some(360),
            checkpointing_steps: 10_000,
            gradient_accumulation_steps: 1,
            unet_optimizer: "prodigy".to_string(),
            unet_lr: 1.0,
            prodigy_d_coef: 1.0,
            prodigy_growth_rate: 1.05,
            lora_rank: 12,
            lora_alpha_multiplier: 1.0,
            lora_weight_decay: 0.002,
            use_dora: false,
            ti_optimizer: "adamw".to_string(),
            ti_lr: 1e-3,
            ti_weight_decay: 0.0,
            hard_pivot: false,
            pivot_completion_f: 0.5,
            off_ratio_power: 0.02,
            n_tokens: 2,
            text_encoder_lora_optimizer: None,
            text_encoder_lora_lr: 1e-5,
            text_encoder_lora_weight_decay: 1e-5,
            text_encoder_lora_rank: 16,
            l1_penalty: 0.01,
            snr_gamma: Some(5.0),
            noise_offset: 0.02,
            prediction_type: "epsilon".to_string(),
            lr_scheduler_name: None,
            lr_warmup_steps: 0,
            lr_num_cycles: 1,
            lr_power: 1.0,
            device_ordinal: 0,
            n_sample_imgs: 4,
            start_time: 0.0,
            job_time: 0.0,
        }
    }
}

impl TrainingConfig {
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&text)
            .with_context(|| "Failed to parse YAML config")?;
        Ok(config)
    }

    pub fn from_json(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| "Failed to parse JSON config")?;
        Ok(config)
    }

    pub fn save_as_json(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)
            .with_context(|| format!("Failed to write config snapshot: {}", path.display()))?;
        Ok(())
    }

    /// The special tokens whose embeddings are learned: `<s0>`, `<s1>`, ...
    pub fn inserting_tokens(&self) -> Vec<String> {
        (0..self.n_tokens).map(|i| format!("<s{}>", i)).collect()
    }

    pub fn unet_optimizer_kind(&self) -> Result<OptimizerKind, TrainerError> {
        self.unet_optimizer.parse()
    }

    pub fn ti_optimizer_kind(&self) -> Result<OptimizerKind, TrainerError> {
        self.ti_optimizer.parse()
    }

    pub fn prediction_type(&self) -> Result<PredictionType, TrainerError> {
        self.prediction_type.parse()
    }

    /// DoRA-style runs train a decomposed adapter; weight decay fights the
    /// magnitude decomposition, so it is zeroed alongside the L1 penalty.
    pub fn apply_variant_overrides(&mut self) {
        if self.use_dora {
            log::info!("DoRA variant active: disabling L1 penalty and LoRA weight decay");
            self.l1_penalty = 0.0;
            self.lora_weight_decay = 0.0;
            self.text_encoder_lora_weight_decay = 0.0;
        }
    }

    /// Fail-fast validation, before any training compute.
    pub fn validate(&self) -> Result<(), TrainerError> {
        self.unet_optimizer_kind()?;
        self.ti_optimizer_kind()?;
        self.prediction_type()?;
        if let Some(kind) = &self.text_encoder_lora_optimizer {
            // Adaptive step sizing is not wired up for the encoder adapters.
            if kind.parse::<OptimizerKind>()? != OptimizerKind::AdamW {
                return Err(TrainerError::InvalidConfig(format!(
                    "text encoder adapter training only supports 'adamw', got '{}'",
                    kind
                )));
            }
        }
        if self.train_batch_size == 0 {
            return Err(TrainerError::InvalidConfig("train_batch_size must be > 0".into()));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(TrainerError::InvalidConfig(
                "gradient_accumulation_steps must be > 0".into(),
            ));
        }
        if self.checkpointing_steps == 0 {
            return Err(TrainerError::InvalidConfig("checkpointing_steps must be > 0".into()));
        }
        if self.n_tokens == 0 {
            return Err(TrainerError::InvalidConfig("n_tokens must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.pivot_completion_f) {
            return Err(TrainerError::InvalidConfig(
                "pivot_completion_f must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TrainingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.inserting_tokens(), vec!["<s0>", "<s1>"]);
    }

    #[test]
    fn test_unknown_optimizer_rejected() {
        let config = TrainingConfig {
            unet_optimizer: "lion".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TrainerError::UnknownOptimizer(_))
        ));
    }

    #[test]
    fn test_unknown_prediction_type_rejected() {
        let config = TrainingConfig {
            prediction_type: "sample".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TrainerError::UnsupportedPredictionType(_))
        ));
    }

    #[test]
    fn test_text_encoder_group_is_adamw_only() {
        let config = TrainingConfig {
            text_encoder_lora_optimizer: Some("prodigy".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dora_overrides_zero_regularizers() {
        let mut config = TrainingConfig {
            use_dora: true,
            ..Default::default()
        };
        config.apply_variant_overrides();
        assert_eq!(config.l1_penalty, 0.0);
        assert_eq!(config.lora_weight_decay, 0.0);
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training_args.json");
        let config = TrainingConfig {
            max_train_steps: Some(1000),
            checkpointing_steps: 500,
            ..Default::default()
        };
        config.save_as_json(&path).unwrap();
        let loaded = TrainingConfig::from_json(&path).unwrap();
        assert_eq!(loaded.max_train_steps, Some(1000));
        assert_eq!(loaded.checkpointing_steps, 500);
    }
}
