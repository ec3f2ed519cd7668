#![allow(dead_code)]

use std::cell::Cell;
use std::path::{Path, PathBuf};

use candle_core::Device;
use pairtune_core::{DecoderConfig, DecoderLm, Result, TextTokenizer};
use pairtune_training::settings::ModelSettings;
use pairtune_training::{LoadedModel, ModelProvider, TuneConfig};

pub const EOS: &str = "<eos>";
pub const EOS_ID: u32 = 256;

/// One id per UTF-8 byte plus `<eos>`.
pub struct CharTokenizer;

impl TextTokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len());
        for (i, chunk) in text.split(EOS).enumerate() {
            if i > 0 {
                ids.push(EOS_ID);
            }
            ids.extend(chunk.bytes().map(u32::from));
        }
        Ok(ids)
    }

    fn eos_token(&self) -> &str {
        EOS
    }

    fn pad_token_id(&self) -> u32 {
        EOS_ID
    }

    fn vocab_size(&self) -> usize {
        257
    }

    fn save(&self, dir: &Path) -> Result<()> {
        std::fs::write(dir.join(pairtune_core::TOKENIZER_FILE), r#"{"model": "bytes"}"#)?;
        std::fs::write(dir.join(pairtune_core::TOKENIZER_CONFIG_FILE), r#"{"eos_token": "<eos>"}"#)?;
        Ok(())
    }
}

/// Hands out a fresh tiny decoder and counts how often it was asked.
#[derive(Default)]
pub struct TinyProvider {
    pub loads: Cell<usize>,
}

impl ModelProvider for TinyProvider {
    fn load(&self, _settings: &ModelSettings, device: &Device) -> Result<LoadedModel> {
        self.loads.set(self.loads.get() + 1);
        let config = DecoderConfig {
            max_position_embeddings: 128,
            ..DecoderConfig::tiny(257)
        };
        Ok(LoadedModel {
            model: Box::new(DecoderLm::new(config, device)?),
            tokenizer: Box::new(CharTokenizer),
        })
    }
}

pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.path().join("data").join("pairs.jsonl")
    }

    pub fn save_path(&self) -> PathBuf {
        self.dir.path().join("out").join("ft")
    }

    pub fn held_out_path(&self) -> PathBuf {
        self.dir.path().join("data").join("val.jsonl")
    }

    pub fn write_pairs(&self, n: usize) -> Vec<String> {
        let lines: Vec<String> = (0..n)
            .map(|i| format!(r#"{{"input": "what is {i} plus 1", "target": "{}"}}"#, i + 1))
            .collect();
        self.write_lines(&lines);
        lines
    }

    pub fn write_lines(&self, lines: &[String]) {
        let path = self.data_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, lines.join("\n") + "\n").unwrap();
    }

    pub fn config_yaml(&self, val_split: f64, device: &str) -> String {
        format!(
            r#"
model:
  name: tiny-test
  save_path: '{save}'
data:
  path: '{data}'
  val_split: {val_split}
train:
  max_seq_len: 64
  batch_size: 2
  lr: 1.0e-3
  weight_decay: 0.01
  warmup_steps: 1
  epochs: 1
  grad_clip: 1.0
  log_every: 1
  save_every: 100
  shuffle: false
runtime:
  device: {device}
"#,
            save = self.save_path().display(),
            data = self.data_path().display(),
        )
    }

    /// Parsed config; tests adjust fields directly.
    pub fn config(&self, val_split: f64) -> TuneConfig {
        TuneConfig::from_yaml(&self.config_yaml(val_split, "cpu")).expect("valid test config")
    }

    pub fn write_config(&self, yaml: &str) -> PathBuf {
        let path = self.dir.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }
}
