//! Checkpoint directory writer
//!
//! Every save overwrites the same directory:
//! `model.safetensors`, `config.json`, `tokenizer.json`,
//! `tokenizer_config.json`, `optimizer.safetensors`, `training_state.json`.

use std::path::{Path, PathBuf};

use pairtune_core::{CausalLm, Result, TextTokenizer, TuneError};

use crate::state::TrainingState;

pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub const TRAINING_STATE_FILE: &str = "training_state.json";

pub trait CheckpointSink {
    fn save(&mut self, model: &dyn CausalLm, tokenizer: &dyn TextTokenizer, state: &TrainingState) -> Result<()>;

    /// Directory the checkpoints land in.
    fn location(&self) -> &Path;
}

pub struct CheckpointManager {
    dir: PathBuf,
    saves: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), saves: 0 }
    }

    pub fn saves(&self) -> usize {
        self.saves
    }

    fn write_all(&self, model: &dyn CausalLm, tokenizer: &dyn TextTokenizer, state: &TrainingState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        model.save(&self.dir)?;
        tokenizer.save(&self.dir)?;

        let moments = state.optimizer.state_tensors();
        if !moments.is_empty() {
            candle_core::safetensors::save(&moments, self.dir.join(OPTIMIZER_FILE))?;
        }

        let snapshot = serde_json::to_string_pretty(&state.snapshot())?;
        std::fs::write(self.dir.join(TRAINING_STATE_FILE), snapshot)?;
        Ok(())
    }
}

impl CheckpointSink for CheckpointManager {
    fn save(&mut self, model: &dyn CausalLm, tokenizer: &dyn TextTokenizer, state: &TrainingState) -> Result<()> {
        self.write_all(model, tokenizer, state).map_err(|e| match e {
            TuneError::Checkpoint { .. } => e,
            other => TuneError::Checkpoint {
                path: self.dir.clone(),
                reason: other.to_string(),
            },
        })?;
        self.saves += 1;
        tracing::info!("checkpoint {} written to {} (step {})", self.saves, self.dir.display(), state.global_step);
        Ok(())
    }

    fn location(&self) -> &Path {
        &self.dir
    }
}
