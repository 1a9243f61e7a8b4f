//! DDPM noise scheduler for diffusion training
//! Precomputes the alpha/beta tables and exposes the training-side
//! operations: noising, SNR lookup, velocity targets, timestep sampling.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::str::FromStr;

use crate::errors::TrainerError;

/// What the denoising network is trained to predict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

impl FromStr for PredictionType {
    type Err = TrainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "epsilon" => Ok(Self::Epsilon),
            "v_prediction" => Ok(Self::VPrediction),
            other => Err(TrainerError::UnsupportedPredictionType(other.to_string())),
        }
    }
}

pub struct NoiseScheduler {
    num_timesteps: usize,
    prediction_type: PredictionType,
    alphas_cumprod: Tensor,
    sqrt_alphas_cumprod: Tensor,
    sqrt_one_minus_alphas_cumprod: Tensor,
}

impl NoiseScheduler {
    pub fn new(
        num_timesteps: usize,
        beta_start: f32,
        beta_end: f32,
        beta_schedule: &str,
        prediction_type: PredictionType,
        device: &Device,
    ) -> Result<Self> {
        let betas = match beta_schedule {
            "scaled_linear" => Self::scaled_linear_beta_schedule(num_timesteps, beta_start, beta_end, device)?,
            "squaredcos_cap_v2" => Self::cosine_beta_schedule(num_timesteps, device)?,
            _ => Self::linear_beta_schedule(num_timesteps, beta_start, beta_end, device)?,
        };

        let alphas = (1.0 - &betas)?;
        let alphas_vec: Vec<f32> = alphas.to_vec1()?;
        let mut alphas_cumprod_vec = Vec::with_capacity(num_timesteps);
        let mut running = 1.0f32;
        for &alpha in alphas_vec.iter() {
            running *= alpha;
            alphas_cumprod_vec.push(running);
        }
        let alphas_cumprod = Tensor::from_vec(alphas_cumprod_vec, num_timesteps, device)?;

        let sqrt_alphas_cumprod = alphas_cumprod.sqrt()?;
        let sqrt_one_minus_alphas_cumprod = (1.0 - &alphas_cumprod)?.sqrt()?;

        Ok(Self {
            num_timesteps,
            prediction_type,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
        })
    }

    /// Default SDXL-style schedule.
    pub fn default_for(prediction_type: PredictionType, device: &Device) -> Result<Self> {
        Self::new(1000, 0.00085, 0.012, "scaled_linear", prediction_type, device)
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_timesteps
    }

    /// noisy = sqrt(ac) * original + sqrt(1 - ac) * noise
    pub fn add_noise(
        &self,
        original_samples: &Tensor,
        noise: &Tensor,
        timesteps: &Tensor,
    ) -> Result<Tensor> {
        let batch_size = timesteps.dims()[0];

        let timesteps_i64 = timesteps.to_dtype(DType::I64)?;
        let sqrt_alpha_prod = self
            .sqrt_alphas_cumprod
            .index_select(&timesteps_i64, 0)?
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(original_samples.dtype())?;
        let sqrt_one_minus_alpha_prod = self
            .sqrt_one_minus_alphas_cumprod
            .index_select(&timesteps_i64, 0)?
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(original_samples.dtype())?;

        let scaled_original = sqrt_alpha_prod.broadcast_mul(original_samples)?;
        let scaled_noise = sqrt_one_minus_alpha_prod.broadcast_mul(noise)?;
        Ok((scaled_original + scaled_noise)?)
    }

    /// Per-example signal-to-noise ratio at the given timesteps.
    pub fn snr(&self, timesteps: &Tensor) -> Result<Tensor> {
        let timesteps_i64 = timesteps.to_dtype(DType::I64)?;
        let alphas_cumprod = self.alphas_cumprod.index_select(&timesteps_i64, 0)?;
        Ok((&alphas_cumprod / (1.0 - &alphas_cumprod)?)?)
    }

    /// Velocity target: v = sqrt(ac) * noise - sqrt(1 - ac) * sample
    pub fn velocity(&self, sample: &Tensor, noise: &Tensor, timesteps: &Tensor) -> Result<Tensor> {
        let batch_size = timesteps.dims()[0];

        let timesteps_i64 = timesteps.to_dtype(DType::I64)?;
        let sqrt_alpha_prod = self
            .sqrt_alphas_cumprod
            .index_select(&timesteps_i64, 0)?
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(sample.dtype())?;
        let sqrt_one_minus_alpha_prod = self
            .sqrt_one_minus_alphas_cumprod
            .index_select(&timesteps_i64, 0)?
            .reshape((batch_size, 1, 1, 1))?
            .to_dtype(sample.dtype())?;

        Ok(((sqrt_alpha_prod.broadcast_mul(noise))?
            - (sqrt_one_minus_alpha_prod.broadcast_mul(sample))?)?)
    }

    pub fn sample_timesteps(&self, batch_size: usize, device: &Device) -> Result<Tensor> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let timesteps: Vec<i64> = (0..batch_size)
            .map(|_| rng.gen_range(0..self.num_timesteps) as i64)
            .collect();
        Ok(Tensor::from_vec(timesteps, batch_size, device)?)
    }

    fn linear_beta_schedule(
        num_timesteps: usize,
        beta_start: f32,
        beta_end: f32,
        device: &Device,
    ) -> Result<Tensor> {
        let betas: Vec<f32> = (0..num_timesteps)
            .map(|i| beta_start + (beta_end - beta_start) * (i as f32) / (num_timesteps as f32 - 1.0))
            .collect();
        Ok(Tensor::from_vec(betas, num_timesteps, device)?)
    }

    fn scaled_linear_beta_schedule(
        num_timesteps: usize,
        beta_start: f32,
        beta_end: f32,
        device: &Device,
    ) -> Result<Tensor> {
        let start = beta_start.sqrt();
        let end = beta_end.sqrt();
        let betas: Vec<f32> = (0..num_timesteps)
            .map(|i| {
                let t = start + (end - start) * (i as f32) / (num_timesteps as f32 - 1.0);
                t * t
            })
            .collect();
        Ok(Tensor::from_vec(betas, num_timesteps, device)?)
    }

    fn cosine_beta_schedule(num_timesteps: usize, device: &Device) -> Result<Tensor> {
        let s = 0.008f32;
        let alpha_at = |t: f32| ((t + s) / (1.0 + s) * std::f32::consts::PI / 2.0).cos().powi(2);

        let mut betas = Vec::with_capacity(num_timesteps);
        let alpha_0 = alpha_at(0.0);
        let mut prev = 1.0f32;
        for i in 1..=num_timesteps {
            let alpha = alpha_at(i as f32 / num_timesteps as f32) / alpha_0;
            betas.push((1.0 - alpha / prev).min(0.999));
            prev = alpha;
        }
        Ok(Tensor::from_vec(betas, num_timesteps, device)?)
    }
}
