//! pairtune CLI - fine-tune a pretrained causal model on input/target pairs
//!
//! Usage:
//!   pairtune train --config run.yaml
//!   pairtune train --config run.yaml --progress
//!
//! stdout carries one JSON event per line; diagnostics go to stderr
//! (filter with RUST_LOG).

mod bar;
mod pretrained;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use pairtune_training::{run_from_file, JsonLinesSink, ProgressEvent, ProgressSink};

use crate::bar::BarSink;
use crate::pretrained::PretrainedProvider;

#[derive(Parser)]
#[command(
    name = "pairtune",
    about = "Supervised fine-tuning of causal language models on input/target pairs",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune a pretrained model
    Train {
        /// Path to the YAML run configuration
        #[arg(long)]
        config: PathBuf,

        /// Draw a progress bar on stderr
        #[arg(long)]
        progress: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train { config, progress } => {
            let mut sink: Box<dyn ProgressSink> = if progress {
                Box::new(BarSink::new(JsonLinesSink::stdout()))
            } else {
                Box::new(JsonLinesSink::stdout())
            };

            match train(&config, sink.as_mut()) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!("{:#}", e);
                    sink.emit(ProgressEvent::error(format!("{:#}", e)));
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn train(config: &Path, progress: &mut dyn ProgressSink) -> anyhow::Result<()> {
    let summary = run_from_file(config, &PretrainedProvider, progress)?;
    tracing::info!(
        "finished {} steps over {} epochs, {} checkpoints written",
        summary.total_steps,
        summary.epochs,
        summary.checkpoints
    );
    Ok(())
}
