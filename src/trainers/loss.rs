//! Training objective
//! Masked reconstruction with mask-mean normalization, optional min-SNR
//! reweighting, and a normalized L1 sparsity penalty on adapter weights.

use anyhow::{bail, Result};
use candle_core::{Tensor, Var};

use crate::trainers::ddpm::PredictionType;

/// The velocity objective needs its SNR weight floored at one; this shift is
/// a property of the objective, not a tunable.
const V_PREDICTION_SNR_SHIFT: f64 = 1.0;

pub struct DiffusionLoss {
    pub snr_gamma: Option<f32>,
}

impl DiffusionLoss {
    pub fn new(snr_gamma: Option<f32>) -> Self {
        Self { snr_gamma }
    }

    /// Scalar loss over a batch. `snr` must be the per-example SNR at each
    /// example's timestep whenever `snr_gamma` is set.
    pub fn compute(
        &self,
        model_pred: &Tensor,
        target: &Tensor,
        mask: &Tensor,
        snr: Option<&Tensor>,
        prediction_type: PredictionType,
    ) -> Result<Tensor> {
        let masked_err = (model_pred - target)?.sqr()?.broadcast_mul(mask)?;
        let mut per_example = mean_over_non_batch_dims(&masked_err)?;

        if let Some(gamma) = self.snr_gamma {
            let snr = match snr {
                Some(snr) => snr,
                None => bail!("snr_gamma is set but no SNR values were provided"),
            };
            let weights = snr_loss_weights(snr, gamma, prediction_type)?;
            let weights = weights.to_dtype(per_example.dtype())?;
            per_example = (per_example * weights)?;
        }

        // Divide by the mask's own mean, normalized so the batch-mean of
        // mask-means is 1: small-mask examples stop being under-weighted
        // while the overall loss scale is unchanged.
        let mask_means = mean_over_non_batch_dims(&mask.to_dtype(per_example.dtype())?)?;
        let mask_means = mask_means.broadcast_div(&mask_means.mean_all()?)?;
        let per_example = (per_example / mask_means)?;

        Ok(per_example.mean_all()?)
    }
}

/// min(snr, gamma) / snr, renormalized to batch mean 1.
pub fn snr_loss_weights(
    snr: &Tensor,
    gamma: f32,
    prediction_type: PredictionType,
) -> Result<Tensor> {
    // SNR is non-negative, so the clamp is exactly min(snr, gamma).
    let capped = snr.clamp(0.0f32, gamma)?;
    let base_weight = (&capped / snr)?;
    let weights = match prediction_type {
        PredictionType::VPrediction => (base_weight + V_PREDICTION_SNR_SHIFT)?,
        PredictionType::Epsilon => base_weight,
    };
    Ok(weights.broadcast_div(&weights.mean_all()?)?)
}

/// Normalized L1 penalty over adapter weights: sum(|w|) / count(w).
/// Scale-invariant to adapter size, unlike a summed penalty.
pub fn l1_sparsity_penalty(vars: &[&Var]) -> Result<Tensor> {
    if vars.is_empty() {
        bail!("L1 penalty requested but there are no adapter parameters");
    }
    let mut total: Option<Tensor> = None;
    let mut count = 0usize;
    for var in vars {
        let abs_sum = var.as_tensor().abs()?.sum_all()?;
        total = Some(match total {
            Some(t) => (t + abs_sum)?,
            None => abs_sum,
        });
        count += var.as_tensor().elem_count();
    }
    let total = total.unwrap();
    Ok((total / count as f64)?)
}

fn mean_over_non_batch_dims(t: &Tensor) -> Result<Tensor> {
    if t.dims().len() <= 1 {
        return Ok(t.clone());
    }
    Ok(t.flatten_from(1)?.mean(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn plain_mse(pred: &Tensor, target: &Tensor) -> f32 {
        (pred - target)
            .unwrap()
            .sqr()
            .unwrap()
            .mean_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_all_ones_mask_equals_plain_mse() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::randn(0f32, 1f32, (2, 4, 8, 8), &device)?;
        let target = Tensor::randn(0f32, 1f32, (2, 4, 8, 8), &device)?;
        let mask = Tensor::ones((2, 1, 8, 8), DType::F32, &device)?;

        let loss = DiffusionLoss::new(None)
            .compute(&pred, &target, &mask, None, PredictionType::Epsilon)?
            .to_scalar::<f32>()?;
        assert!((loss - plain_mse(&pred, &target)).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_uniform_mask_normalization_is_noop() -> Result<()> {
        // Any constant c > 0: the mask-mean normalization cancels the scale
        // only across the batch dimension, so the result is c * mse / 1.
        let device = Device::Cpu;
        let pred = Tensor::randn(0f32, 1f32, (3, 4, 4, 4), &device)?;
        let target = Tensor::randn(0f32, 1f32, (3, 4, 4, 4), &device)?;
        let mask = (Tensor::ones((3, 1, 4, 4), DType::F32, &device)? * 0.3)?;

        let loss = DiffusionLoss::new(None)
            .compute(&pred, &target, &mask, None, PredictionType::Epsilon)?
            .to_scalar::<f32>()?;
        // Uniform mask: masked error is 0.3 * err, mask-mean normalizer is
        // 0.3 / 0.3 = 1 per example, so loss = 0.3 * mse.
        assert!((loss - 0.3 * plain_mse(&pred, &target)).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_small_mask_examples_not_underweighted() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::ones((2, 1, 2, 2), DType::F32, &device)?;
        let target = Tensor::zeros((2, 1, 2, 2), DType::F32, &device)?;
        // First example fully masked-in, second only one pixel.
        let mask = Tensor::from_vec(
            vec![1f32, 1., 1., 1., 1., 0., 0., 0.],
            (2, 1, 2, 2),
            &device,
        )?;

        let loss = DiffusionLoss::new(None)
            .compute(&pred, &target, &mask, None, PredictionType::Epsilon)?
            .to_scalar::<f32>()?;
        // Per-example: err means are 1.0 and 0.25; mask means 1.0 and 0.25
        // normalize to 1.6 and 0.4; both ratios are 0.625, batch mean 0.625.
        assert!((loss - 0.625).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_huge_gamma_matches_unweighted() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::randn(0f32, 1f32, (4, 4, 4, 4), &device)?;
        let target = Tensor::randn(0f32, 1f32, (4, 4, 4, 4), &device)?;
        let mask = Tensor::ones((4, 1, 4, 4), DType::F32, &device)?;
        let snr = Tensor::from_vec(vec![12.3f32, 0.4, 5.0, 88.0], 4, &device)?;

        let unweighted = DiffusionLoss::new(None)
            .compute(&pred, &target, &mask, None, PredictionType::Epsilon)?
            .to_scalar::<f32>()?;
        // With gamma above every SNR the weights are all min(snr,g)/snr = 1.
        let weighted = DiffusionLoss::new(Some(f32::MAX))
            .compute(&pred, &target, &mask, Some(&snr), PredictionType::Epsilon)?
            .to_scalar::<f32>()?;
        assert!((unweighted - weighted).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_snr_weights_mean_one() -> Result<()> {
        let device = Device::Cpu;
        let snr = Tensor::from_vec(vec![0.5f32, 2.0, 10.0, 100.0], 4, &device)?;
        for pt in [PredictionType::Epsilon, PredictionType::VPrediction] {
            let w = snr_loss_weights(&snr, 5.0, pt)?;
            let mean = w.mean_all()?.to_scalar::<f32>()?;
            assert!((mean - 1.0).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_v_prediction_shift_changes_relative_weights() -> Result<()> {
        let device = Device::Cpu;
        let snr = Tensor::from_vec(vec![1.0f32, 100.0], 2, &device)?;
        let eps = snr_loss_weights(&snr, 5.0, PredictionType::Epsilon)?.to_vec1::<f32>()?;
        let v = snr_loss_weights(&snr, 5.0, PredictionType::VPrediction)?.to_vec1::<f32>()?;
        // The +1 floor flattens the ratio between easy and hard timesteps.
        assert!(eps[0] / eps[1] > v[0] / v[1]);
        Ok(())
    }

    #[test]
    fn test_l1_penalty_scale_invariant() -> Result<()> {
        let device = Device::Cpu;
        let small = Var::from_tensor(&Tensor::ones((4, 4), DType::F32, &device)?)?;
        let large = Var::from_tensor(&Tensor::ones((64, 64), DType::F32, &device)?)?;

        let p_small = l1_sparsity_penalty(&[&small])?.to_scalar::<f32>()?;
        let p_large = l1_sparsity_penalty(&[&large])?.to_scalar::<f32>()?;
        assert!((p_small - p_large).abs() < 1e-6);
        assert!((p_small - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_l1_penalty_empty_params_errors() {
        assert!(l1_sparsity_penalty(&[]).is_err());
    }
}
