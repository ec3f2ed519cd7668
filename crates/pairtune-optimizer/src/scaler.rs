//! Dynamic loss scaling for half-precision compute
//!
//! Call order per step: `scale_loss` → backward → `unscale` → clip →
//! optimizer step (skipped when `unscale` found overflow) → `update`.

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::NamedGrads;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    clean_steps: usize,
    skipped_steps: usize,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            clean_steps: 0,
            skipped_steps: 0,
        }
    }
}

impl LossScaler {
    pub fn new(init_scale: f64, growth_interval: usize) -> Self {
        Self {
            scale: init_scale,
            growth_interval,
            ..Default::default()
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Steps whose parameter update was dropped for overflow.
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        loss * self.scale
    }

    /// Divide every gradient by the current scale. Returns `true` when any
    /// gradient holds an inf or NaN.
    pub fn unscale(&self, grads: &mut NamedGrads) -> Result<bool> {
        let inv_scale = 1.0 / self.scale;
        let mut found_inf = false;
        for grad in grads.values_mut() {
            *grad = (grad.to_dtype(DType::F32)? * inv_scale)?;
            if !found_inf {
                let sum = grad.sum_all()?.to_scalar::<f32>()?;
                found_inf = !sum.is_finite();
            }
        }
        Ok(found_inf)
    }

    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
            self.skipped_steps += 1;
            tracing::debug!("gradient overflow, loss scale backed off to {}", self.scale);
            return;
        }
        self.clean_steps += 1;
        if self.clean_steps >= self.growth_interval {
            self.scale *= self.growth_factor;
            self.clean_steps = 0;
        }
    }
}
