//! Llama-family decoder configuration
//!
//! Field names follow the HuggingFace `config.json` of a Llama checkpoint so
//! the same file is read from a pretrained model and written back into every
//! fine-tuned one. Keys this crate does not interpret (`architectures`,
//! `bos_token_id`, `hidden_act`, ...) are carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use crate::error::{Result, TuneError};

/// Value of `model_type` this crate knows how to load.
pub const LLAMA_MODEL_TYPE: &str = "llama";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,

    // Architecture
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    /// Grouped-query attention; equal to `num_attention_heads` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_key_value_heads: Option<usize>,
    /// Per-head width; `hidden_size / num_attention_heads` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_dim: Option<usize>,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,

    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    /// `lm_head` shares the token embedding matrix.
    #[serde(default)]
    pub tie_word_embeddings: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_model_type() -> String {
    LLAMA_MODEL_TYPE.to_string()
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f64 {
    10000.0
}

impl Default for DecoderConfig {
    fn default() -> Self {
        let mut extra = Map::new();
        extra.insert("architectures".into(), Value::from(vec!["LlamaForCausalLM"]));
        extra.insert("hidden_act".into(), Value::from("silu"));

        Self {
            model_type: default_model_type(),
            vocab_size: 32000,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            num_key_value_heads: None,
            head_dim: None,
            intermediate_size: 3072,
            max_position_embeddings: 2048,
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            tie_word_embeddings: false,
            extra,
        }
    }
}

impl DecoderConfig {
    /// A few-thousand-parameter model, handy for smoke runs on CPU.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            intermediate_size: 64,
            max_position_embeddings: 256,
            ..Default::default()
        }
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim.unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Read and validate a `config.json`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: DecoderConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        if config.extra.get("rope_scaling").is_some_and(|v| !v.is_null()) {
            tracing::warn!("rope_scaling in {} is ignored; positions use plain RoPE", path.display());
        }
        Ok(config)
    }

    /// Write `config.json`. Weights are always saved as F32.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let mut config = self.clone();
        config.extra.insert("torch_dtype".into(), Value::from("float32"));
        let json = serde_json::to_string_pretty(&config)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Approximate parameter count (embeddings, attention, MLP, norms, head).
    pub fn total_params(&self) -> usize {
        let q_width = self.num_attention_heads * self.head_dim();
        let kv_width = self.num_kv_heads() * self.head_dim();
        let embedding = self.vocab_size * self.hidden_size;
        let attention = 2 * self.hidden_size * q_width + 2 * self.hidden_size * kv_width;
        let mlp = 3 * self.hidden_size * self.intermediate_size;
        let norms = 2 * self.hidden_size;
        let head = if self.tie_word_embeddings { 0 } else { self.hidden_size * self.vocab_size };
        embedding + self.num_hidden_layers * (attention + mlp + norms) + self.hidden_size + head
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_type != LLAMA_MODEL_TYPE {
            return Err(TuneError::config(format!(
                "unsupported model_type '{}', expected '{}'",
                self.model_type, LLAMA_MODEL_TYPE
            )));
        }
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_hidden_layers == 0 {
            return Err(TuneError::config(
                "vocab_size, hidden_size and num_hidden_layers must be > 0",
            ));
        }
        if self.num_attention_heads == 0 {
            return Err(TuneError::config("num_attention_heads must be > 0"));
        }
        if self.head_dim.is_none() && self.hidden_size % self.num_attention_heads != 0 {
            return Err(TuneError::config(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({})",
                self.hidden_size, self.num_attention_heads
            )));
        }
        let kv_heads = self.num_kv_heads();
        if kv_heads == 0 || self.num_attention_heads % kv_heads != 0 {
            return Err(TuneError::config(format!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
                self.num_attention_heads, kv_heads
            )));
        }
        // RoPE rotates pairs of channels.
        if self.head_dim() == 0 || self.head_dim() % 2 != 0 {
            return Err(TuneError::config(format!(
                "head dimension ({}) must be even",
                self.head_dim()
            )));
        }
        Ok(())
    }
}
