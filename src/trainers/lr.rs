//! Learning-rate schedules
//! Named step-indexed schedules for fixed-rate groups, plus the analytic
//! quadratic decay used by the textual-inversion group before the pivot.

use crate::errors::TrainerError;
use crate::trainers::optimizer::OptimizerHandle;

pub trait LrSchedule: Send {
    fn rate_at(&self, step: usize) -> f64;
}

struct ConstantSchedule {
    base_lr: f64,
    warmup_steps: usize,
}

struct LinearSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

struct CosineSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    num_cycles: usize,
}

struct PolynomialSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    power: f64,
}

fn warmup_factor(step: usize, warmup_steps: usize) -> Option<f64> {
    if step < warmup_steps {
        Some(step as f64 / warmup_steps.max(1) as f64)
    } else {
        None
    }
}

fn progress(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    let span = total_steps.saturating_sub(warmup_steps).max(1);
    ((step - warmup_steps) as f64 / span as f64).min(1.0)
}

impl LrSchedule for ConstantSchedule {
    fn rate_at(&self, step: usize) -> f64 {
        match warmup_factor(step, self.warmup_steps) {
            Some(f) => self.base_lr * f,
            None => self.base_lr,
        }
    }
}

impl LrSchedule for LinearSchedule {
    fn rate_at(&self, step: usize) -> f64 {
        match warmup_factor(step, self.warmup_steps) {
            Some(f) => self.base_lr * f,
            None => self.base_lr * (1.0 - progress(step, self.warmup_steps, self.total_steps)),
        }
    }
}

impl LrSchedule for CosineSchedule {
    fn rate_at(&self, step: usize) -> f64 {
        match warmup_factor(step, self.warmup_steps) {
            Some(f) => self.base_lr * f,
            None => {
                let p = progress(step, self.warmup_steps, self.total_steps);
                let cycles = self.num_cycles.max(1) as f64;
                let cosine = (std::f64::consts::PI * cycles * 2.0 * p).cos();
                (self.base_lr * 0.5 * (1.0 + cosine)).max(0.0)
            }
        }
    }
}

impl LrSchedule for PolynomialSchedule {
    fn rate_at(&self, step: usize) -> f64 {
        match warmup_factor(step, self.warmup_steps) {
            Some(f) => self.base_lr * f,
            None => {
                let p = progress(step, self.warmup_steps, self.total_steps);
                self.base_lr * (1.0 - p).powf(self.power)
            }
        }
    }
}

/// Build a named schedule; an unknown name is a configuration error.
pub fn create_schedule(
    name: &str,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    num_cycles: usize,
    power: f64,
) -> Result<Box<dyn LrSchedule>, TrainerError> {
    match name {
        "constant" | "constant_with_warmup" => Ok(Box::new(ConstantSchedule { base_lr, warmup_steps })),
        "linear" => Ok(Box::new(LinearSchedule { base_lr, warmup_steps, total_steps })),
        "cosine" | "cosine_with_restarts" => Ok(Box::new(CosineSchedule {
            base_lr,
            warmup_steps,
            total_steps,
            num_cycles,
        })),
        "polynomial" => Ok(Box::new(PolynomialSchedule {
            base_lr,
            warmup_steps,
            total_steps,
            power,
        })),
        other => Err(TrainerError::InvalidConfig(format!(
            "unknown lr scheduler '{}'",
            other
        ))),
    }
}

/// Analytic textual-inversion decay: `base * (1 - f)^2` where `f` is the
/// completed fraction of the whole run. Hits exactly zero at `f = 1`.
pub fn ti_lr_at(
    base_lr: f64,
    epoch: usize,
    step_in_epoch: usize,
    steps_per_epoch: usize,
    total_epochs: usize,
) -> f64 {
    let total_steps = (total_epochs * steps_per_epoch).max(1);
    let completed = epoch * steps_per_epoch + step_in_epoch;
    let f = (completed as f64 / total_steps as f64).min(1.0);
    base_lr * (1.0 - f) * (1.0 - f)
}

/// Diagnostics-only rate query; a retired (pivoted) or absent group reads
/// as zero rather than an error.
pub fn effective_learning_rate(handle: Option<&OptimizerHandle>) -> f64 {
    handle.map(|h| h.effective_rate()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_schedule_name_rejected() {
        assert!(matches!(
            create_schedule("exotic", 1.0, 0, 100, 1, 1.0),
            Err(TrainerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_constant_with_warmup_ramp() {
        let schedule = create_schedule("constant_with_warmup", 1.0, 10, 100, 1, 1.0).unwrap();
        assert_eq!(schedule.rate_at(0), 0.0);
        assert!((schedule.rate_at(5) - 0.5).abs() < 1e-12);
        assert_eq!(schedule.rate_at(10), 1.0);
        assert_eq!(schedule.rate_at(99), 1.0);
    }

    #[test]
    fn test_linear_decays_to_zero() {
        let schedule = create_schedule("linear", 2.0, 0, 100, 1, 1.0).unwrap();
        assert_eq!(schedule.rate_at(0), 2.0);
        assert!((schedule.rate_at(50) - 1.0).abs() < 1e-12);
        assert_eq!(schedule.rate_at(100), 0.0);
        assert_eq!(schedule.rate_at(500), 0.0);
    }

    #[test]
    fn test_cosine_endpoints() {
        let schedule = create_schedule("cosine", 1.0, 0, 100, 1, 1.0).unwrap();
        assert!((schedule.rate_at(0) - 1.0).abs() < 1e-12);
        assert!(schedule.rate_at(100) < 1e-12);
    }

    #[test]
    fn test_polynomial_square_decay() {
        let schedule = create_schedule("polynomial", 1.0, 0, 100, 1, 2.0).unwrap();
        assert!((schedule.rate_at(50) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_ti_decay_quadratic_values() {
        let base = 1e-3;
        // Start: full rate.
        assert_eq!(ti_lr_at(base, 0, 0, 10, 10), base);
        // Halfway: a quarter of the base rate.
        let half = ti_lr_at(base, 5, 0, 10, 10);
        assert!((half - base * 0.25).abs() < 1e-12);
        // End: exactly zero, and stays zero past it.
        assert_eq!(ti_lr_at(base, 10, 0, 10, 10), 0.0);
        assert_eq!(ti_lr_at(base, 12, 3, 10, 10), 0.0);
    }

    #[test]
    fn test_ti_decay_monotone_nonincreasing() {
        let base = 3e-4;
        let mut last = f64::INFINITY;
        for epoch in 0..8 {
            for step in 0..5 {
                let lr = ti_lr_at(base, epoch, step, 5, 8);
                assert!(lr <= last);
                assert!(lr >= 0.0);
                last = lr;
            }
        }
    }

    #[test]
    fn test_effective_rate_of_absent_group_is_zero() {
        assert_eq!(effective_learning_rate(None), 0.0);
    }
}
