//! One fine-tuning run from configuration to final checkpoint
//!
//! Setup order matters: device first (so a missing GPU fails before anything
//! is loaded), then model and tokenizer, then the dataset and its held-out
//! carve. Each phase announces itself on the progress stream.

use candle_core::{DType, Device};
use std::path::Path;

use pairtune_core::{CausalLm, Result, TextTokenizer, TuneError};

use crate::checkpoint::CheckpointManager;
use crate::dataset::{load_pairs, split_pairs, write_held_out};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::settings::{DeviceKind, ModelSettings, TuneConfig};
use crate::state::TrainingState;
use crate::trainer::{total_steps, RunSummary, Trainer};

pub struct LoadedModel {
    pub model: Box<dyn CausalLm>,
    pub tokenizer: Box<dyn TextTokenizer>,
}

/// Resolves `model.name` into a model and its tokenizer.
pub trait ModelProvider {
    fn load(&self, settings: &ModelSettings, device: &Device) -> Result<LoadedModel>;
}

/// `Device::Cpu` for `cpu`, the first CUDA device for `cuda`.
pub fn select_device(kind: DeviceKind) -> Result<Device> {
    match kind {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Cuda => Device::new_cuda(0).map_err(|e| TuneError::AcceleratorUnavailable(e.to_string())),
    }
}

/// Read the YAML at `config_path`, then [`run`].
pub fn run_from_file(config_path: &Path, provider: &dyn ModelProvider, progress: &mut dyn ProgressSink) -> Result<RunSummary> {
    progress.emit(ProgressEvent::message(format!("Loading config from {}", config_path.display())));
    let config = TuneConfig::from_file(config_path)?;
    run(&config, provider, progress)
}

pub fn run(config: &TuneConfig, provider: &dyn ModelProvider, progress: &mut dyn ProgressSink) -> Result<RunSummary> {
    let device = select_device(config.runtime.device)?;
    progress.emit(ProgressEvent::message(format!("Using device: {}", config.runtime.device)));
    if device.is_cuda() {
        progress.emit(ProgressEvent::message("GPU: CUDA device 0"));
    }

    progress.emit(ProgressEvent::message(format!("Loading model {}...", config.model.name)));
    let LoadedModel { mut model, tokenizer } = provider.load(&config.model, &device)?;
    if config.mixed_precision() {
        model.set_compute_dtype(DType::F16);
    }
    if config.train.max_seq_len > model.max_positions() {
        return Err(TuneError::config(format!(
            "train.max_seq_len {} exceeds the model's {} positions",
            config.train.max_seq_len,
            model.max_positions()
        )));
    }

    let loaded = match load_pairs(&config.data.path, config.data.max_samples) {
        Ok(loaded) => loaded,
        Err(err) => {
            if let TuneError::EmptyDataset { skipped } = err {
                if skipped > 0 {
                    progress.emit(skipped_warning(skipped, &config.data.path));
                }
            }
            return Err(err);
        }
    };
    if !loaded.skipped.is_empty() {
        progress.emit(skipped_warning(loaded.skipped.len(), &config.data.path));
    }

    let (held_out, train) = split_pairs(loaded.pairs, config.data.val_split);
    let held_out_path = write_held_out(&held_out, &config.data.path)?;
    progress.emit(ProgressEvent::message(format!(
        "Saved {} validation samples to {}",
        held_out.len(),
        held_out_path.display()
    )));
    if train.is_empty() {
        return Err(TuneError::EmptyTrainingSplit { held_out: held_out.len() });
    }

    let mixed_precision = config.mixed_precision();
    let mut state = TrainingState::new(&config.train, total_steps(&config.train, train.len()), mixed_precision);
    let mut checkpoints = CheckpointManager::new(&config.model.save_path);

    progress.emit(ProgressEvent::message("Starting training loop"));
    let summary = Trainer::new(&config.train, config.runtime.workers, config.runtime.seed).train(
        model.as_ref(),
        tokenizer.as_ref(),
        &train,
        &held_out,
        &mut state,
        &mut checkpoints,
        progress,
    )?;

    if summary.skipped_updates > 0 {
        tracing::warn!("{} steps skipped for gradient overflow", summary.skipped_updates);
    }
    progress.emit(ProgressEvent::complete(&config.model.save_path));
    Ok(summary)
}

fn skipped_warning(count: usize, path: &Path) -> ProgressEvent {
    ProgressEvent::warning(format!("Skipped {} malformed records in {}", count, path.display()))
}
