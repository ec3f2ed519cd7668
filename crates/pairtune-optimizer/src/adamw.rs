//! AdamW with decoupled weight decay
//!
//! Works on explicit named gradients, since candle tensors carry no `.grad()`.
//! The learning rate is pushed in from the schedule before every step.

use candle_core::{Result, Tensor, Var};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::NamedGrads;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

impl AdamWConfig {
    pub fn new(lr: f64, weight_decay: f64) -> Self {
        Self { lr, weight_decay, ..Default::default() }
    }
}

pub struct AdamW {
    config: AdamWConfig,
    step: usize,
    state: BTreeMap<String, MomentState>,
}

struct MomentState {
    m: Tensor, // First moment
    v: Tensor, // Second moment
    step: usize,
}

impl AdamW {
    pub fn new(config: AdamWConfig) -> Self {
        Self {
            config,
            step: 0,
            state: BTreeMap::new(),
        }
    }

    /// One update of every parameter that has a gradient. Parameters without
    /// one keep their value and their moments.
    pub fn step(&mut self, params: &[(String, Var)], grads: &NamedGrads) -> Result<()> {
        self.step += 1;

        for (name, var) in params {
            if let Some(grad) = grads.get(name) {
                self.update_param(name, var, grad)?;
            }
        }
        Ok(())
    }

    fn update_param(&mut self, name: &str, var: &Var, grad: &Tensor) -> Result<()> {
        let lr = self.config.lr;
        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;

        let state = match self.state.entry(name.to_string()) {
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::btree_map::Entry::Vacant(entry) => entry.insert(MomentState {
                m: Tensor::zeros_like(var.as_tensor())?,
                v: Tensor::zeros_like(var.as_tensor())?,
                step: 0,
            }),
        };
        state.step += 1;

        let bias_correction1 = 1.0 - beta1.powi(state.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(state.step as i32);

        // Decoupled weight decay
        let param = (var.as_tensor() * (1.0 - lr * self.config.weight_decay))?;

        state.m = ((&state.m * beta1)? + (grad * (1.0 - beta1))?)?;
        state.v = ((&state.v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

        let m_hat = (&state.m / bias_correction1)?;
        let v_hat = (&state.v / bias_correction2)?;

        let update = (m_hat / (v_hat.sqrt()? + self.config.eps)?)?;
        var.set(&(param - (update * lr)?)?)
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    pub fn lr(&self) -> f64 {
        self.config.lr
    }

    pub fn config(&self) -> &AdamWConfig {
        &self.config
    }

    /// Number of `step` calls that reached the parameters.
    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Moments keyed `m.<param>` and `v.<param>`, ready for safetensors.
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut tensors = HashMap::with_capacity(self.state.len() * 2);
        for (name, state) in &self.state {
            tensors.insert(format!("m.{name}"), state.m.clone());
            tensors.insert(format!("v.{name}"), state.v.clone());
        }
        tensors
    }
}
