//! pairtune training pipeline
//!
//! JSON-lines pairs → [`example`] → [`collate`] → [`trainer`], with
//! [`checkpoint`] and [`progress`] on the side and [`session`] wiring a run
//! together from a [`settings::TuneConfig`].

pub mod checkpoint;
pub mod collate;
pub mod dataset;
pub mod example;
pub mod feeder;
pub mod progress;
pub mod session;
pub mod settings;
pub mod state;
pub mod trainer;

pub use checkpoint::{CheckpointManager, CheckpointSink};
pub use collate::{collate, Batch};
pub use dataset::{held_out_count, load_pairs, split_pairs, write_held_out, TrainingPair};
pub use example::{build_example, EncodedExample};
pub use progress::{JsonLinesSink, MemorySink, ProgressEvent, ProgressSink, StepMetrics};
pub use session::{run, run_from_file, select_device, LoadedModel, ModelProvider};
pub use settings::{DeviceKind, ModelFamily, TuneConfig};
pub use state::TrainingState;
pub use trainer::{RunSummary, Trainer};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
