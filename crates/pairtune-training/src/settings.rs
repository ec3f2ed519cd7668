//! YAML run configuration
//!
//! Parsed with serde, then checked eagerly so nothing is allocated for a run
//! that could never start.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use pairtune_core::{Result, TuneError};

use crate::dataset::held_out_path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneConfig {
    pub model: ModelSettings,
    pub data: DataSettings,
    pub train: TrainSettings,
    pub runtime: RuntimeSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Local directory or Hub repository id.
    pub name: String,
    pub save_path: PathBuf,
    #[serde(default)]
    pub family: ModelFamily,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// Llama-architecture decoders (`"model_type": "llama"`).
    #[default]
    #[serde(alias = "decoder")]
    Llama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
    pub path: PathBuf,
    pub val_split: f64,
    /// Stop reading after this many well-formed records.
    #[serde(default)]
    pub max_samples: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainSettings {
    pub max_seq_len: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub weight_decay: f64,
    pub warmup_steps: usize,
    pub epochs: usize,
    pub grad_clip: f64,
    pub log_every: usize,
    pub save_every: usize,
    #[serde(default)]
    pub val_every: Option<usize>,
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub device: DeviceKind,
    #[serde(default)]
    pub workers: usize,
    /// Unset means "on for cuda, off for cpu".
    #[serde(default)]
    pub mixed_precision: Option<bool>,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    #[serde(alias = "gpu")]
    Cuda,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda => write!(f, "cuda"),
        }
    }
}

fn default_shuffle() -> bool {
    true
}

fn default_seed() -> u64 {
    42
}

impl TuneConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TuneError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: TuneConfig =
            serde_yaml::from_str(raw).map_err(|e| TuneError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn mixed_precision(&self) -> bool {
        self.runtime
            .mixed_precision
            .unwrap_or(self.runtime.device == DeviceKind::Cuda)
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.name.trim().is_empty() {
            return Err(TuneError::config("model.name must not be empty"));
        }
        if self.model.save_path.as_os_str().is_empty() {
            return Err(TuneError::config("model.save_path must not be empty"));
        }

        let val_split = self.data.val_split;
        if !(0.0..=1.0).contains(&val_split) {
            return Err(TuneError::config(format!(
                "data.val_split must be within [0, 1], got {val_split}"
            )));
        }
        if held_out_path(&self.data.path) == self.data.path {
            return Err(TuneError::config(format!(
                "data.path {} is where the held-out split is written; rename the dataset",
                self.data.path.display()
            )));
        }

        let t = &self.train;
        for (name, value) in [
            ("train.max_seq_len", t.max_seq_len),
            ("train.batch_size", t.batch_size),
            ("train.epochs", t.epochs),
            ("train.log_every", t.log_every),
            ("train.save_every", t.save_every),
        ] {
            if value == 0 {
                return Err(TuneError::config(format!("{name} must be > 0")));
            }
        }
        if t.val_every == Some(0) {
            return Err(TuneError::config("train.val_every must be > 0 when set"));
        }
        if !(t.lr.is_finite() && t.lr > 0.0) {
            return Err(TuneError::config(format!("train.lr must be positive, got {}", t.lr)));
        }
        if !(t.grad_clip.is_finite() && t.grad_clip > 0.0) {
            return Err(TuneError::config(format!(
                "train.grad_clip must be positive, got {}",
                t.grad_clip
            )));
        }
        if !(t.weight_decay.is_finite() && t.weight_decay >= 0.0) {
            return Err(TuneError::config(format!(
                "train.weight_decay must be >= 0, got {}",
                t.weight_decay
            )));
        }

        if self.runtime.device == DeviceKind::Cpu && self.runtime.mixed_precision == Some(true) {
            return Err(TuneError::config("runtime.mixed_precision requires device 'cuda'"));
        }
        Ok(())
    }
}
