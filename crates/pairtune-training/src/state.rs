//! Mutable state of one training run, owned by the control thread

use serde::{Deserialize, Serialize};

use pairtune_optimizer::{AdamW, AdamWConfig, LinearWarmup, LossScaler};

use crate::settings::TrainSettings;

pub struct TrainingState {
    /// Zero-based epoch currently running.
    pub epoch: usize,
    pub global_step: usize,
    pub optimizer: AdamW,
    pub schedule: LinearWarmup,
    /// Present only when computing in half precision.
    pub scaler: Option<LossScaler>,
}

impl TrainingState {
    pub fn new(settings: &TrainSettings, total_steps: usize, mixed_precision: bool) -> Self {
        let schedule = LinearWarmup::new(settings.lr, settings.warmup_steps, total_steps);
        let mut optimizer = AdamW::new(AdamWConfig::new(settings.lr, settings.weight_decay));
        optimizer.set_lr(schedule.lr());

        Self {
            epoch: 0,
            global_step: 0,
            optimizer,
            schedule,
            scaler: mixed_precision.then(LossScaler::default),
        }
    }

    /// Serializable view written next to every checkpoint.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            epoch: self.epoch,
            global_step: self.global_step,
            learning_rate: self.optimizer.lr(),
            optimizer: self.optimizer.config().clone(),
            schedule: self.schedule.clone(),
            loss_scaler: self.scaler.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub epoch: usize,
    pub global_step: usize,
    pub learning_rate: f64,
    pub optimizer: AdamWConfig,
    pub schedule: LinearWarmup,
    pub loss_scaler: Option<LossScaler>,
}
