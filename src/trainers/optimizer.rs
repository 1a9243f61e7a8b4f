//! Optimizer collection
//! Named parameter groups, manual AdamW and Prodigy updates over
//! accumulated gradients, and the one-shot pivot that retires the
//! textual-inversion group.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use log::info;
use std::collections::HashMap;
use std::str::FromStr;

use crate::errors::TrainerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Prodigy,
    AdamW,
}

impl FromStr for OptimizerKind {
    type Err = TrainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prodigy" => Ok(Self::Prodigy),
            "adamw" => Ok(Self::AdamW),
            other => Err(TrainerError::UnknownOptimizer(other.to_string())),
        }
    }
}

/// One set of trainable parameters sharing a rate and decay.
pub struct ParameterGroup {
    pub name: String,
    pub params: Vec<(String, Var)>,
    pub lr: f64,
    pub weight_decay: f64,
}

impl ParameterGroup {
    pub fn new(name: &str, params: Vec<(String, Var)>, lr: f64, weight_decay: f64) -> Self {
        Self {
            name: name.to_string(),
            params,
            lr,
            weight_decay,
        }
    }

    pub fn param_count(&self) -> usize {
        self.params.iter().map(|(_, v)| v.as_tensor().elem_count()).sum()
    }
}

/// Sums gradients per parameter name across micro-batches.
pub struct GradientAccumulator {
    grads: HashMap<String, Tensor>,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self { grads: HashMap::new() }
    }

    pub fn accumulate(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        match self.grads.get(name) {
            Some(existing) => {
                let summed = (existing + grad)?;
                self.grads.insert(name.to_string(), summed);
            }
            None => {
                self.grads.insert(name.to_string(), grad.clone());
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    pub fn clear(&mut self) {
        self.grads.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

impl Default for GradientAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

struct AdamwState {
    m: Tensor,
    v: Tensor,
}

/// AdamW with decoupled weight decay, state keyed by parameter name.
pub struct Adamw {
    beta1: f64,
    beta2: f64,
    eps: f64,
    step_count: usize,
    state: HashMap<String, AdamwState>,
}

impl Adamw {
    pub fn new() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step_count: 0,
            state: HashMap::new(),
        }
    }

    fn step(&mut self, group: &ParameterGroup, grads: &GradientAccumulator) -> Result<()> {
        self.step_count += 1;
        let t = self.step_count as f64;
        let bias1 = 1.0 - self.beta1.powf(t);
        let bias2 = 1.0 - self.beta2.powf(t);

        for (name, var) in &group.params {
            let grad = match grads.get(name) {
                Some(g) => g,
                None => continue,
            };
            let param = var.as_tensor();

            if !self.state.contains_key(name) {
                let zeros = param.zeros_like()?;
                self.state
                    .insert(name.clone(), AdamwState { m: zeros.clone(), v: zeros });
            }
            let state = self.state.get_mut(name).unwrap();

            state.m = ((&state.m * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            state.v = ((&state.v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let m_hat = (&state.m / bias1)?;
            let v_hat = (&state.v / bias2)?;
            let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;

            // Decoupled decay, applied to the parameter not the gradient.
            let mut new_param = param.clone();
            if group.weight_decay > 0.0 {
                new_param = (new_param * (1.0 - group.lr * group.weight_decay))?;
            }
            new_param = (new_param - (update * group.lr)?)?;
            var.set(&new_param)?;
        }
        Ok(())
    }
}

struct ProdigyState {
    m: Tensor,
    v: Tensor,
    p0: Tensor,
    s: Tensor,
}

/// Prodigy adaptive step-size estimation. The effective rate is
/// `d * lr * bias_correction`, with `d` grown from `d0` as the distance
/// estimate firms up.
pub struct Prodigy {
    beta1: f64,
    beta2: f64,
    beta3: f64,
    eps: f64,
    d: f64,
    d0: f64,
    d_max: f64,
    d_coef: f64,
    growth_rate: f64,
    d_numerator: f64,
    safeguard_warmup: bool,
    step_count: usize,
    state: HashMap<String, ProdigyState>,
}

impl Prodigy {
    pub fn new(d_coef: f64, growth_rate: f64) -> Self {
        let beta2: f64 = 0.999;
        Self {
            beta1: 0.9,
            beta2,
            beta3: beta2.sqrt(),
            eps: 1e-8,
            d: 1e-6,
            d0: 1e-6,
            d_max: 1e-6,
            d_coef,
            growth_rate,
            d_numerator: 0.0,
            safeguard_warmup: true,
            step_count: 0,
            state: HashMap::new(),
        }
    }

    pub fn d(&self) -> f64 {
        self.d
    }

    fn bias_correction(&self) -> f64 {
        let k = self.step_count as f64;
        (1.0 - self.beta2.powf(k + 1.0)).sqrt() / (1.0 - self.beta1.powf(k + 1.0))
    }

    pub fn effective_rate(&self, lr: f64) -> f64 {
        self.d * lr * self.bias_correction()
    }

    fn step(&mut self, group: &ParameterGroup, grads: &GradientAccumulator) -> Result<()> {
        let lr = group.lr;
        let dlr = self.d * lr * self.bias_correction();

        let mut d_numerator = self.d_numerator * self.beta3;
        let mut d_denom = 0.0f64;

        // First pass: moment updates and the distance-estimate accumulators.
        for (name, var) in &group.params {
            let grad = match grads.get(name) {
                Some(g) => g,
                None => continue,
            };
            let param = var.as_tensor();

            if !self.state.contains_key(name) {
                let zeros = param.zeros_like()?;
                self.state.insert(
                    name.clone(),
                    ProdigyState {
                        m: zeros.clone(),
                        v: zeros.clone(),
                        p0: param.copy()?,
                        s: zeros,
                    },
                );
            }
            let state = self.state.get_mut(name).unwrap();

            let drift = (&state.p0 - param)?;
            let dot = (grad * &drift)?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
            d_numerator += (self.d / self.d0) * dlr * dot;

            state.m = ((&state.m * self.beta1)? + (grad * ((1.0 - self.beta1) * self.d))?)?;
            state.v = ((&state.v * self.beta2)?
                + (grad.sqr()? * ((1.0 - self.beta2) * self.d * self.d))?)?;

            let s_scale = if self.safeguard_warmup {
                (self.d / self.d0) * self.d
            } else {
                (self.d / self.d0) * dlr
            };
            state.s = ((&state.s * self.beta3)? + (grad * s_scale)?)?;
            d_denom += state
                .s
                .abs()?
                .sum_all()?
                .to_dtype(candle_core::DType::F64)?
                .to_scalar::<f64>()?;
        }

        // Grow d, capped by the growth rate per step.
        if lr > 0.0 && d_denom > 0.0 {
            let d_hat = self.d_coef * d_numerator / d_denom;
            if self.d == self.d0 {
                self.d = self.d.max(d_hat);
            }
            self.d_max = self.d_max.max(d_hat);
            self.d = self.d_max.min(self.d * self.growth_rate);
        }
        self.d_numerator = d_numerator;

        // Second pass: parameter update, with the rate from before the d
        // growth so the step that fed the estimate is the step applied.
        for (name, var) in &group.params {
            if grads.get(name).is_none() {
                continue;
            }
            let state = &self.state[name];
            let denom = (state.v.sqrt()? + self.d * self.eps)?;

            let mut new_param = var.as_tensor().clone();
            if group.weight_decay > 0.0 {
                new_param = (new_param * (1.0 - dlr * group.weight_decay))?;
            }
            new_param = (new_param - ((&state.m / denom)? * dlr)?)?;
            var.set(&new_param)?;
        }

        self.step_count += 1;
        Ok(())
    }
}

enum Algorithm {
    Adamw(Adamw),
    Prodigy(Prodigy),
}

/// One parameter group bound to one update algorithm.
pub struct OptimizerHandle {
    pub group: ParameterGroup,
    algorithm: Algorithm,
}

impl OptimizerHandle {
    pub fn adamw(group: ParameterGroup) -> Self {
        Self {
            group,
            algorithm: Algorithm::Adamw(Adamw::new()),
        }
    }

    pub fn prodigy(group: ParameterGroup, d_coef: f64, growth_rate: f64) -> Self {
        Self {
            group,
            algorithm: Algorithm::Prodigy(Prodigy::new(d_coef, growth_rate)),
        }
    }

    pub fn from_kind(
        kind: OptimizerKind,
        group: ParameterGroup,
        d_coef: f64,
        growth_rate: f64,
    ) -> Self {
        match kind {
            OptimizerKind::AdamW => Self::adamw(group),
            OptimizerKind::Prodigy => Self::prodigy(group, d_coef, growth_rate),
        }
    }

    pub fn step(&mut self, grads: &GradientAccumulator) -> Result<()> {
        match &mut self.algorithm {
            Algorithm::Adamw(a) => a.step(&self.group, grads),
            Algorithm::Prodigy(p) => p.step(&self.group, grads),
        }
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.group.lr = lr;
    }

    /// Step size actually applied right now. For Prodigy this folds in the
    /// current distance estimate and bias correction.
    pub fn effective_rate(&self) -> f64 {
        match &self.algorithm {
            Algorithm::Adamw(_) => self.group.lr,
            Algorithm::Prodigy(p) => p.effective_rate(self.group.lr),
        }
    }
}

/// The up-to-three optimizer slots driven in lockstep by the training loop.
pub struct OptimizerCollection {
    pub unet: Option<OptimizerHandle>,
    pub textual_inversion: Option<OptimizerHandle>,
    pub text_encoder: Option<OptimizerHandle>,
    accumulator: GradientAccumulator,
    pivoted: bool,
}

impl OptimizerCollection {
    pub fn new(
        unet: Option<OptimizerHandle>,
        textual_inversion: Option<OptimizerHandle>,
        text_encoder: Option<OptimizerHandle>,
    ) -> Self {
        Self {
            unet,
            textual_inversion,
            text_encoder,
            accumulator: GradientAccumulator::new(),
            pivoted: false,
        }
    }

    fn handles(&self) -> impl Iterator<Item = &OptimizerHandle> {
        self.unet
            .iter()
            .chain(self.textual_inversion.iter())
            .chain(self.text_encoder.iter())
    }

    /// Pull this backward pass's gradients into the accumulator for every
    /// parameter of every active group.
    pub fn accumulate(&mut self, grads: &GradStore) -> Result<()> {
        let mut found: Vec<(String, Tensor)> = Vec::new();
        for handle in self.handles() {
            for (name, var) in &handle.group.params {
                if let Some(grad) = grads.get(var.as_tensor()) {
                    found.push((name.clone(), grad.clone()));
                }
            }
        }
        for (name, grad) in found {
            self.accumulator.accumulate(&name, &grad)?;
        }
        Ok(())
    }

    /// Apply one update per active group, fixed order: unet, textual
    /// inversion, text encoder.
    pub fn step(&mut self) -> Result<()> {
        if let Some(handle) = self.unet.as_mut() {
            handle.step(&self.accumulator)?;
        }
        if let Some(handle) = self.textual_inversion.as_mut() {
            handle.step(&self.accumulator)?;
        }
        if let Some(handle) = self.text_encoder.as_mut() {
            handle.step(&self.accumulator)?;
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        self.accumulator.clear();
    }

    /// Retire the textual-inversion group for good. The handle and all of
    /// its state are dropped; calling again is a no-op.
    pub fn pivot_textual_inversion(&mut self) {
        if self.pivoted {
            return;
        }
        self.pivoted = true;
        if let Some(handle) = self.textual_inversion.take() {
            info!(
                "Pivoting: textual-inversion group '{}' retired ({} params frozen)",
                handle.group.name,
                handle.group.param_count()
            );
        }
    }

    pub fn has_pivoted(&self) -> bool {
        self.pivoted
    }
}
