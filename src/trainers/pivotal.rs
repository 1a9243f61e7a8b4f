//! Pivotal-tuning training loop
//! Drives the joint LoRA + textual-inversion optimization: gradient
//! accumulation, the one-shot pivot, embedding constraints after every
//! optimizer step, and periodic checkpoint + validation-render cadence.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::TrainingConfig;
use crate::errors::TrainerError;
use crate::models::lora::LoraCollection;
use crate::trainers::checkpoint::CheckpointWriter;
use crate::trainers::ddpm::{NoiseScheduler, PredictionType};
use crate::trainers::embeddings::TokenEmbeddingsHandler;
use crate::trainers::loss::{l1_sparsity_penalty, DiffusionLoss};
use crate::trainers::lr::{self, LrSchedule};
use crate::trainers::optimizer::{
    OptimizerCollection, OptimizerHandle, OptimizerKind, ParameterGroup,
};

/// A final save is skipped when the last periodic checkpoint is at most
/// this many steps behind the end of the run.
pub const FINAL_SAVE_SLACK_STEPS: usize = 50;

/// Encoder hidden states for one batch; the variant count must match the
/// model's encoder count, which makes a mismatch a structural error rather
/// than something discovered mid-forward.
pub enum TokenBatch {
    Single(Tensor),
    Dual(Tensor, Tensor),
}

pub struct ConceptBatch {
    pub tokens: TokenBatch,
    pub latents: Tensor,
    pub mask: Tensor,
}

/// The denoising network under training.
pub trait DenoisingModel {
    fn forward(
        &self,
        noisy_latents: &Tensor,
        timesteps: &Tensor,
        tokens: &TokenBatch,
    ) -> Result<Tensor>;
}

/// Finite per-epoch batch supply.
pub trait BatchSource {
    fn batches_per_epoch(&self) -> usize;
    fn next_batch(&mut self, epoch: usize, index: usize) -> Result<ConceptBatch>;
}

/// Side-effecting preview render after a checkpoint lands. The returned
/// prompt list is only logged.
pub trait ValidationRenderer {
    fn render(&mut self, step: usize, checkpoint_dir: &Path) -> Result<Vec<String>>;
}

pub struct NoopRenderer;

impl ValidationRenderer for NoopRenderer {
    fn render(&mut self, _step: usize, _checkpoint_dir: &Path) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Mutable run state, kept separate from the static plan for diagnostics.
#[derive(Default)]
pub struct TrainingSession {
    pub epoch: usize,
    pub global_step: usize,
    pub last_checkpoint_step: Option<usize>,
    pub losses: Vec<f32>,
    pub unet_lr_history: Vec<f64>,
    pub ti_lr_history: Vec<f64>,
}

pub struct PivotalTrainer<M, D, R> {
    config: TrainingConfig,
    device: Device,
    prediction_type: PredictionType,
    scheduler: NoiseScheduler,
    loss: DiffusionLoss,
    model: M,
    source: D,
    renderer: R,
    unet_lora: LoraCollection,
    text_encoder_lora: Option<LoraCollection>,
    embeddings: TokenEmbeddingsHandler,
    optimizers: OptimizerCollection,
    unet_schedule: Option<Box<dyn LrSchedule>>,
    checkpoints: CheckpointWriter,
    pub session: TrainingSession,

    batches_per_epoch: usize,
    steps_per_epoch: usize,
    total_epochs: usize,
    max_steps: usize,
    pivot_epoch: usize,
}

impl<M: DenoisingModel, D: BatchSource, R: ValidationRenderer> PivotalTrainer<M, D, R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mut config: TrainingConfig,
        model: M,
        source: D,
        renderer: R,
        unet_lora: LoraCollection,
        text_encoder_lora: Option<LoraCollection>,
        embeddings: TokenEmbeddingsHandler,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        config.apply_variant_overrides();

        let prediction_type = config.prediction_type()?;
        let scheduler = NoiseScheduler::default_for(prediction_type, &device)?;
        let loss = DiffusionLoss::new(config.snr_gamma);

        let batches_per_epoch = source.batches_per_epoch();
        if batches_per_epoch == 0 {
            bail!(TrainerError::InvalidConfig(
                "batch source provides no batches per epoch".into()
            ));
        }
        let accum = config.gradient_accumulation_steps;
        let steps_per_epoch = (batches_per_epoch + accum - 1) / accum;
        let (total_epochs, max_steps) = match config.max_train_steps {
            Some(max) => ((max + steps_per_epoch - 1) / steps_per_epoch, max),
            None => (config.num_train_epochs, config.num_train_epochs * steps_per_epoch),
        };
        let pivot_epoch = (total_epochs as f64 * config.pivot_completion_f).floor() as usize;

        let unet_kind = config.unet_optimizer_kind()?;
        let unet = if unet_lora.is_empty() {
            None
        } else {
            Some(OptimizerHandle::from_kind(
                unet_kind,
                ParameterGroup::new(
                    "unet_lora",
                    unet_lora.named_vars(),
                    config.unet_lr,
                    config.lora_weight_decay,
                ),
                config.prodigy_d_coef,
                config.prodigy_growth_rate,
            ))
        };

        let ti_params = embeddings.named_vars();
        let textual_inversion = if ti_params.is_empty() {
            None
        } else {
            Some(OptimizerHandle::from_kind(
                config.ti_optimizer_kind()?,
                ParameterGroup::new(
                    "textual_inversion",
                    ti_params,
                    config.ti_lr,
                    config.ti_weight_decay,
                ),
                config.prodigy_d_coef,
                config.prodigy_growth_rate,
            ))
        };

        // Validated adamw-only in TrainingConfig::validate.
        let text_encoder = match (&config.text_encoder_lora_optimizer, &text_encoder_lora) {
            (Some(_), Some(te_lora)) if !te_lora.is_empty() => {
                Some(OptimizerHandle::adamw(ParameterGroup::new(
                    "text_encoder_lora",
                    te_lora.named_vars(),
                    config.text_encoder_lora_lr,
                    config.text_encoder_lora_weight_decay,
                )))
            }
            _ => None,
        };

        // Named schedules only drive fixed-rate optimizers; Prodigy sets
        // its own step size.
        let unet_schedule = match (&config.lr_scheduler_name, unet_kind) {
            (Some(name), OptimizerKind::AdamW) => Some(lr::create_schedule(
                name,
                config.unet_lr,
                config.lr_warmup_steps,
                max_steps,
                config.lr_num_cycles,
                config.lr_power,
            )?),
            _ => None,
        };

        let checkpoints = CheckpointWriter::new(&config.output_dir)?;

        info!(
            "Training plan: {} epochs x {} steps ({} max), pivot epoch {} ({}), checkpoint every {}",
            total_epochs,
            steps_per_epoch,
            max_steps,
            pivot_epoch,
            if config.hard_pivot { "hard" } else { "soft" },
            config.checkpointing_steps
        );

        Ok(Self {
            config,
            device,
            prediction_type,
            scheduler,
            loss,
            model,
            source,
            renderer,
            unet_lora,
            text_encoder_lora,
            embeddings,
            optimizers: OptimizerCollection::new(unet, textual_inversion, text_encoder),
            unet_schedule,
            checkpoints,
            session: TrainingSession::default(),
            batches_per_epoch,
            steps_per_epoch,
            total_epochs,
            max_steps,
            pivot_epoch,
        })
    }

    /// Run to completion and return the final checkpoint directory.
    pub fn train(&mut self) -> Result<PathBuf> {
        let run_start = Instant::now();
        let accum = self.config.gradient_accumulation_steps;
        let mut images_seen = 0usize;
        let mut last_dir: Option<PathBuf> = None;

        'outer: for epoch in 0..self.total_epochs {
            self.session.epoch = epoch;

            for index in 0..self.batches_per_epoch {
                // Hard pivot: a one-shot drop once the pivot epoch is
                // reached; soft pivot: the textual-inversion rate follows
                // the analytic quadratic decay instead of a hard cutoff.
                if self.config.hard_pivot {
                    if epoch >= self.pivot_epoch {
                        self.optimizers.pivot_textual_inversion();
                    }
                } else {
                    if let Some(handle) = self.optimizers.textual_inversion.as_mut() {
                        handle.set_lr(lr::ti_lr_at(
                            self.config.ti_lr,
                            epoch,
                            index / accum,
                            self.steps_per_epoch,
                            self.total_epochs,
                        ));
                    }
                }

                let batch = self.source.next_batch(epoch, index)?;
                let micro_loss = self.micro_step(&batch)?;
                images_seen += batch.latents.dims()[0];

                let boundary =
                    (index + 1) % accum == 0 || index + 1 == self.batches_per_epoch;
                if !boundary {
                    continue;
                }

                self.optimizers.step()?;
                self.optimizers.zero_grad();

                // Constraints run while the token embeddings still train;
                // after the pivot the matrix no longer moves.
                if self.optimizers.textual_inversion.is_some() {
                    self.embeddings.retract(false)?;
                    self.embeddings.fix_embedding_std(self.config.off_ratio_power)?;
                }

                self.session.global_step += 1;
                if let (Some(schedule), Some(handle)) =
                    (&self.unet_schedule, self.optimizers.unet.as_mut())
                {
                    handle.set_lr(schedule.rate_at(self.session.global_step));
                }

                self.session.losses.push(micro_loss * accum as f32);
                self.session
                    .unet_lr_history
                    .push(lr::effective_learning_rate(self.optimizers.unet.as_ref()));
                self.session.ti_lr_history.push(lr::effective_learning_rate(
                    self.optimizers.textual_inversion.as_ref(),
                ));

                if self.session.global_step % 100 == 0 {
                    let elapsed = run_start.elapsed().as_secs_f64().max(1e-6);
                    info!(
                        "epoch {} step {} | loss {:.5} | {:.1} img/s",
                        epoch,
                        self.session.global_step,
                        micro_loss * accum as f32,
                        images_seen as f64 / elapsed
                    );
                }

                if self.session.global_step % self.config.checkpointing_steps == 0 {
                    last_dir = Some(self.save_and_render(self.session.global_step)?);
                }

                if self.session.global_step >= self.max_steps {
                    break 'outer;
                }
            }
        }

        let final_step = self.session.global_step;
        let needs_final_save = match self.session.last_checkpoint_step {
            Some(step) => final_step > step + FINAL_SAVE_SLACK_STEPS,
            None => true,
        };
        if needs_final_save {
            last_dir = Some(self.save_and_render(final_step)?);
        }
        match last_dir {
            Some(dir) => Ok(dir),
            None => bail!("training ended without producing a checkpoint"),
        }
    }

    /// One forward/backward over a single batch; returns the (already
    /// accumulation-scaled) scalar loss.
    fn micro_step(&mut self, batch: &ConceptBatch) -> Result<f32> {
        let dims = batch.latents.dims();
        let (batch_size, channels) = (dims[0], dims[1]);
        if batch.mask.dims()[0] != batch_size {
            bail!(TrainerError::BatchShapeMismatch {
                expected: batch_size,
                got: batch.mask.dims()[0],
            });
        }

        let mut noise = batch.latents.randn_like(0.0, 1.0)?;
        if self.config.noise_offset > 0.0 {
            // Per-channel offset noise shifts the overall brightness the
            // model learns to remove.
            let offset = Tensor::randn(0f32, 1f32, (batch_size, channels, 1, 1), &self.device)?
                .to_dtype(batch.latents.dtype())?;
            noise = noise.broadcast_add(&(offset * self.config.noise_offset)?)?;
        }

        let timesteps = self.scheduler.sample_timesteps(batch_size, &self.device)?;
        let noisy = self.scheduler.add_noise(&batch.latents, &noise, &timesteps)?;
        let pred = self.model.forward(&noisy, &timesteps, &batch.tokens)?;

        let target = match self.prediction_type {
            PredictionType::Epsilon => noise,
            PredictionType::VPrediction => {
                self.scheduler.velocity(&batch.latents, &noise, &timesteps)?
            }
        };
        let snr = match self.loss.snr_gamma {
            Some(_) => Some(self.scheduler.snr(&timesteps)?),
            None => None,
        };

        let mut loss = self.loss.compute(
            &pred,
            &target,
            &batch.mask,
            snr.as_ref(),
            self.prediction_type,
        )?;
        if self.config.l1_penalty > 0.0 && !self.unet_lora.is_empty() {
            let penalty = l1_sparsity_penalty(&self.unet_lora.vars())?;
            loss = (loss + (penalty * self.config.l1_penalty)?)?;
        }
        let loss = (loss / self.config.gradient_accumulation_steps as f64)?;

        let grads = loss.backward()?;
        self.optimizers.accumulate(&grads)?;
        Ok(loss.to_scalar::<f32>()?)
    }

    fn save_and_render(&mut self, step: usize) -> Result<PathBuf> {
        let dir = self.checkpoints.write(
            step,
            &self.unet_lora,
            self.text_encoder_lora.as_ref(),
            &self.embeddings,
            &self.config,
        )?;
        // Render strictly after the checkpoint lands so previews always
        // reflect an on-disk artifact.
        let prompts = self.renderer.render(step, &dir)?;
        if !prompts.is_empty() {
            debug!("validation prompts at step {}: {:?}", step, prompts);
        }
        self.session.last_checkpoint_step = Some(step);
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainers::embeddings::EncoderEmbeddings;
    use candle_core::{DType, Var};

    struct ToyModel {
        down: Var,
        up: Var,
        scale: f64,
    }

    impl DenoisingModel for ToyModel {
        fn forward(
            &self,
            noisy_latents: &Tensor,
            _timesteps: &Tensor,
            tokens: &TokenBatch,
        ) -> Result<Tensor> {
            let dims = noisy_latents.dims().to_vec();
            let batch = dims[0];
            let features: usize = dims[1..].iter().product();
            let flat = noisy_latents.reshape((batch, features))?;

            let down_out = flat.matmul(&self.down.as_tensor().contiguous()?.t()?)?;
            let mut out =
                (down_out.matmul(&self.up.as_tensor().contiguous()?.t()?)? * self.scale)?;

            let token_term = match tokens {
                TokenBatch::Single(t) => t.sum_all()?,
                TokenBatch::Dual(a, b) => (a.sum_all()? + b.sum_all()?)?,
            };
            out = out.broadcast_add(&(token_term * 0.01)?)?;
            Ok(out.reshape(dims)?)
        }
    }

    struct ToySource {
        embeddings: Var,
        token_rows: Tensor,
        batches: usize,
        device: Device,
    }

    impl BatchSource for ToySource {
        fn batches_per_epoch(&self) -> usize {
            self.batches
        }

        fn next_batch(&mut self, _epoch: usize, _index: usize) -> Result<ConceptBatch> {
            // Token hidden states come straight off the embedding matrix so
            // gradients reach the textual-inversion group.
            let tokens = self
                .embeddings
                .as_tensor()
                .index_select(&self.token_rows, 0)?;
            Ok(ConceptBatch {
                tokens: TokenBatch::Single(tokens),
                latents: Tensor::randn(0f32, 1f32, (2, 4, 2, 2), &self.device)?,
                mask: Tensor::ones((2, 1, 2, 2), DType::F32, &self.device)?,
            })
        }
    }

    fn build_trainer(
        config: TrainingConfig,
        batches: usize,
    ) -> Result<PivotalTrainer<ToyModel, ToySource, NoopRenderer>> {
        let device = Device::Cpu;

        let mut unet_lora = LoraCollection::new(2, 2.0, DType::F32);
        unet_lora.add("mid_block.to_q", 16, 16, &device)?;
        let adapter = &unet_lora.adapters["mid_block.to_q"];
        let model = ToyModel {
            down: adapter.down.clone(),
            up: adapter.up.clone(),
            scale: adapter.scale,
        };

        let matrix = Tensor::randn(0f32, 0.01f32, (10, 4), &device)?;
        let embedding_var = Var::from_tensor(&matrix)?;
        let encoder = EncoderEmbeddings::new(embedding_var.clone(), vec![8, 9])?;
        let embeddings = TokenEmbeddingsHandler::new(vec![Some(encoder), None]);

        let source = ToySource {
            embeddings: embedding_var,
            token_rows: Tensor::from_vec(vec![8i64, 9], 2, &device)?,
            batches,
            device: device.clone(),
        };

        PivotalTrainer::new(
            config,
            model,
            source,
            NoopRenderer,
            unet_lora,
            None,
            embeddings,
            device,
        )
    }

    fn toy_config(output_dir: &Path) -> TrainingConfig {
        TrainingConfig {
            output_dir: output_dir.to_path_buf(),
            unet_optimizer: "adamw".to_string(),
            unet_lr: 1e-3,
            ..Default::default()
        }
    }

    #[test]
    fn test_checkpoint_cadence_exact_two_saves() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainingConfig {
            checkpointing_steps: 5,
            max_train_steps: Some(10),
            gradient_accumulation_steps: 1,
            ..toy_config(dir.path())
        };
        let mut trainer = build_trainer(config, 10)?;
        let final_dir = trainer.train()?;

        // Checkpoints land at 5 and 10, never 0, and the final save is
        // skipped because step 10 already has one.
        assert!(final_dir.ends_with("checkpoint-10"));
        let mut saved: Vec<String> = std::fs::read_dir(dir.path().join("checkpoints"))?
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        saved.sort();
        assert_eq!(saved, vec!["checkpoint-10", "checkpoint-5"]);
        assert_eq!(trainer.session.global_step, 10);
        assert_eq!(trainer.session.losses.len(), 10);
        Ok(())
    }

    #[test]
    fn test_hard_pivot_zeroes_ti_rate_at_pivot_epoch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainingConfig {
            hard_pivot: true,
            num_train_epochs: 10,
            max_train_steps: None,
            checkpointing_steps: 1000,
            gradient_accumulation_steps: 1,
            ..toy_config(dir.path())
        };
        // 3 steps per epoch, 10 epochs, pivot at epoch 5: the last nonzero
        // rate record is the last step of epoch 4.
        let mut trainer = build_trainer(config, 3)?;
        let final_dir = trainer.train()?;

        let history = &trainer.session.ti_lr_history;
        assert_eq!(history.len(), 30);
        let last_nonzero = history.iter().rposition(|&lr| lr > 0.0).unwrap();
        assert_eq!(last_nonzero, 5 * 3 - 1);
        assert!(history[15..].iter().all(|&lr| lr == 0.0));

        // No periodic checkpoint fired, so the run ends with a final save.
        assert!(final_dir.ends_with("checkpoint-30"));
        Ok(())
    }

    #[test]
    fn test_soft_pivot_decays_ti_rate_quadratically() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainingConfig {
            hard_pivot: false,
            ti_optimizer: "adamw".to_string(),
            ti_lr: 1e-3,
            num_train_epochs: 4,
            max_train_steps: None,
            checkpointing_steps: 1000,
            gradient_accumulation_steps: 1,
            ..toy_config(dir.path())
        };
        let mut trainer = build_trainer(config, 3)?;
        trainer.train()?;

        let history = &trainer.session.ti_lr_history;
        assert_eq!(history.len(), 12);
        // Strictly decreasing toward zero, starting at the full rate.
        assert!((history[0] - 1e-3).abs() < 1e-9);
        for pair in history.windows(2) {
            assert!(pair[1] < pair[0]);
        }
        assert!(*history.last().unwrap() >= 0.0);
        Ok(())
    }

    #[test]
    fn test_gradient_accumulation_with_ragged_epoch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainingConfig {
            gradient_accumulation_steps: 2,
            num_train_epochs: 2,
            max_train_steps: None,
            checkpointing_steps: 1000,
            ..toy_config(dir.path())
        };
        // 5 batches with accumulation 2: boundaries after micro-batches
        // 2, 4 and the epoch-final 5th, so 3 optimizer steps per epoch.
        let mut trainer = build_trainer(config, 5)?;
        trainer.train()?;
        assert_eq!(trainer.session.global_step, 6);
        Ok(())
    }

    #[test]
    fn test_training_moves_lora_and_embedding_params() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = TrainingConfig {
            num_train_epochs: 2,
            max_train_steps: None,
            checkpointing_steps: 1000,
            ..toy_config(dir.path())
        };
        let mut trainer = build_trainer(config, 3)?;

        let up_before = trainer.unet_lora.adapters["mid_block.to_q"]
            .up
            .as_tensor()
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        let ti_before = trainer.embeddings.get_trainable_embeddings()?[0]
            .as_ref()
            .unwrap()
            .to_vec2::<f32>()?;
        trainer.train()?;

        let up_after = trainer.unet_lora.adapters["mid_block.to_q"]
            .up
            .as_tensor()
            .abs()?
            .sum_all()?
            .to_scalar::<f32>()?;
        let ti_after = trainer.embeddings.get_trainable_embeddings()?[0]
            .as_ref()
            .unwrap()
            .to_vec2::<f32>()?;

        // Up projection starts at zero; any training at all moves it.
        assert!(up_after > up_before);
        assert_ne!(ti_before, ti_after);
        Ok(())
    }

    #[test]
    fn test_mask_batch_mismatch_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = toy_config(dir.path());
        let mut trainer = build_trainer(config, 3)?;
        let device = Device::Cpu;
        let bad = ConceptBatch {
            tokens: TokenBatch::Single(Tensor::zeros((2, 4), DType::F32, &device)?),
            latents: Tensor::zeros((2, 4, 2, 2), DType::F32, &device)?,
            mask: Tensor::ones((3, 1, 2, 2), DType::F32, &device)?,
        };
        assert!(trainer.micro_step(&bad).is_err());
        Ok(())
    }
}
