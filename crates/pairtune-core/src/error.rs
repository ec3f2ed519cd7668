//! Error taxonomy shared by every pairtune crate

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TuneError>;

#[derive(Error, Debug)]
pub enum TuneError {
    /// Missing or invalid configuration field. Raised before any resource is allocated.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A GPU was explicitly requested but none could be opened.
    #[error("accelerator requested but not available: {0}")]
    AcceleratorUnavailable(String),

    #[error("failed to load model '{name}': {reason}")]
    ModelLoad { name: String, reason: String },

    #[error("failed to load tokenizer '{name}': {reason}")]
    TokenizerLoad { name: String, reason: String },

    #[error("dataset not found at {}", .0.display())]
    DatasetMissing(PathBuf),

    /// No usable record; `skipped` malformed lines were dropped on the way.
    #[error("dataset is empty ({skipped} malformed records skipped)")]
    EmptyDataset { skipped: usize },

    #[error("training set is empty after carving {held_out} held-out examples")]
    EmptyTrainingSplit { held_out: usize },

    /// Recoverable per-record failure; callers skip the line and count it.
    #[error("malformed record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    #[error("cannot collate an empty set of examples")]
    EmptyBatch,

    #[error("batch worker failed: {0}")]
    Worker(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("checkpoint write to {} failed: {reason}", path.display())]
    Checkpoint { path: PathBuf, reason: String },

    #[error("tensor computation failed: {0}")]
    Compute(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TuneError {
    pub fn config(msg: impl Into<String>) -> Self {
        TuneError::Config(msg.into())
    }

    /// True for errors the caller may skip over and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TuneError::MalformedRecord { .. })
    }
}
