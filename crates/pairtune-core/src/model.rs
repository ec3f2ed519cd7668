//! Causal model capability and the Llama model family
//!
//! The training loop only sees [`CausalLm`]: logits in, masked loss out,
//! a `VarMap` to optimize, and a way to persist itself. [`DecoderLm`] is the
//! adapter for checkpoints whose `config.json` says `"model_type": "llama"`;
//! its parameters carry the HuggingFace names (`model.embed_tokens`,
//! `model.layers.{i}.self_attn.q_proj`, ..., `model.norm`, `lm_head`).

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{embedding, Embedding, Init, Linear, VarBuilder, VarMap};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::attention::CausalSelfAttention;
use crate::config::DecoderConfig;
use crate::error::TuneError;
use crate::loss::masked_next_token_loss;

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";
pub const CONFIG_FILE: &str = "config.json";

pub trait CausalLm {
    /// `input_ids`: (batch, seq) u32. Returns F32 logits of shape (batch, seq, vocab).
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;

    /// Trainable parameters.
    fn varmap(&self) -> &VarMap;

    fn device(&self) -> &Device;

    /// Run matmuls in `dtype` while master weights stay F32.
    fn set_compute_dtype(&mut self, dtype: DType);

    /// Largest sequence length the model accepts.
    fn max_positions(&self) -> usize;

    /// Write weights and config into `dir`.
    fn save(&self, dir: &Path) -> crate::Result<()>;

    /// Mean negative log-likelihood of every next token whose position has
    /// `loss_mask == 1.0`. `loss_mask` is (batch, seq) F32.
    fn loss(&self, input_ids: &Tensor, loss_mask: &Tensor) -> Result<Tensor> {
        let logits = self.forward(input_ids)?;
        masked_next_token_loss(&logits, input_ids, loss_mask)
    }
}

/// Shard file names listed in a `model.safetensors.index.json`, sorted and deduplicated.
pub fn weight_shards(index_path: &Path) -> crate::Result<Vec<String>> {
    #[derive(Deserialize)]
    struct ShardIndex {
        weight_map: BTreeMap<String, String>,
    }

    let raw = std::fs::read_to_string(index_path)?;
    let index: ShardIndex = serde_json::from_str(&raw)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

pub struct DecoderLm {
    config: DecoderConfig,
    varmap: VarMap,
    device: Device,
    compute_dtype: DType,

    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
}

impl DecoderLm {
    /// Fresh, randomly initialized model.
    pub fn new(config: DecoderConfig, device: &Device) -> crate::Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb_model.pp("embed_tokens"))?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for layer_idx in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::new(&config, vb_model.pp(format!("layers.{layer_idx}")))?);
        }

        let norm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        Ok(Self {
            config,
            varmap,
            device: device.clone(),
            compute_dtype: DType::F32,
            embed_tokens,
            layers,
            norm,
            lm_head,
        })
    }

    /// Build from `config.json` and overwrite every parameter from the
    /// safetensors files in `weight_files` (one file, or every shard).
    /// Stored dtypes (BF16, F16, ...) are widened to F32 master weights;
    /// tensors the model has no slot for are ignored.
    pub fn load(config_path: &Path, weight_files: &[PathBuf], device: &Device) -> crate::Result<Self> {
        let name = config_path
            .parent()
            .unwrap_or(config_path)
            .display()
            .to_string();
        let load_err = |reason: String| TuneError::ModelLoad { name: name.clone(), reason };

        let config = DecoderConfig::from_file(config_path).map_err(|e| load_err(e.to_string()))?;
        let model = Self::new(config, device)?;

        let mut tensors = HashMap::new();
        for file in weight_files {
            let shard = candle_core::safetensors::load(file, device)
                .map_err(|e| load_err(format!("{}: {e}", file.display())))?;
            tensors.extend(shard);
        }

        let assigned = model.assign_weights(&tensors).map_err(load_err)?;
        tracing::debug!(
            "loaded {} of {} tensors from {} file(s)",
            assigned,
            tensors.len(),
            weight_files.len()
        );
        Ok(model)
    }

    fn assign_weights(&self, tensors: &HashMap<String, Tensor>) -> std::result::Result<usize, String> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| "parameter map lock poisoned".to_string())?;

        let mut missing: Vec<&str> = Vec::new();
        for (name, var) in vars.iter() {
            let Some(tensor) = tensors.get(name) else {
                missing.push(name);
                continue;
            };
            if tensor.dims() != var.dims() {
                return Err(format!(
                    "{name}: checkpoint has shape {:?}, model expects {:?}",
                    tensor.dims(),
                    var.dims()
                ));
            }
            let tensor = tensor.to_dtype(DType::F32).map_err(|e| format!("{name}: {e}"))?;
            var.set(&tensor).map_err(|e| format!("{name}: {e}"))?;
        }

        if !missing.is_empty() {
            missing.sort_unstable();
            return Err(format!(
                "checkpoint lacks {} parameter(s), first: {}",
                missing.len(),
                missing[0]
            ));
        }
        Ok(vars.len())
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }
}

impl CausalLm for DecoderLm {
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_position_embeddings {
            candle_core::bail!(
                "sequence length {seq_len} exceeds max_position_embeddings {}",
                self.config.max_position_embeddings
            );
        }

        // Residual stream stays F32; each block computes in `compute_dtype`.
        let mut hidden_states = self.embed_tokens.forward(input_ids)?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, self.compute_dtype)?;
        }

        let normed = self.norm.forward(&hidden_states)?;
        project(&self.lm_head, &normed, self.compute_dtype)?.to_dtype(DType::F32)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn set_compute_dtype(&mut self, dtype: DType) {
        self.compute_dtype = dtype;
    }

    fn max_positions(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn save(&self, dir: &Path) -> crate::Result<()> {
        let weights = dir.join(WEIGHTS_FILE);
        self.varmap.save(&weights).map_err(|e| TuneError::Checkpoint {
            path: weights.clone(),
            reason: e.to_string(),
        })?;
        self.config.to_file(&dir.join(CONFIG_FILE))
    }
}

/// Linear projection computed in `dtype`, casting weights on the fly when they differ.
pub(crate) fn project(linear: &Linear, x: &Tensor, dtype: DType) -> Result<Tensor> {
    let x = x.to_dtype(dtype)?;
    if linear.weight().dtype() == dtype {
        return linear.forward(&x);
    }
    let weight = linear.weight().to_dtype(dtype)?;
    let bias = linear.bias().map(|b| b.to_dtype(dtype)).transpose()?;
    Linear::new(weight, bias).forward(&x)
}

struct DecoderLayer {
    self_attn: CausalSelfAttention,
    mlp: GatedMlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let self_attn = CausalSelfAttention::new(config, vb.pp("self_attn"))?;
        let mlp = GatedMlp::new(config, vb.pp("mlp"))?;
        let input_layernorm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm =
            RmsNorm::new(config.hidden_size, config.rms_norm_eps, vb.pp("post_attention_layernorm"))?;

        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(&self, hidden_states: &Tensor, dtype: DType) -> Result<Tensor> {
        // Pre-norm attention with residual
        let normed = self.input_layernorm.forward(hidden_states)?;
        let attn_out = self.self_attn.forward(&normed, dtype)?;
        let hidden_states = hidden_states.add(&attn_out.to_dtype(DType::F32)?)?;

        // Pre-norm MLP with residual
        let normed = self.post_attention_layernorm.forward(&hidden_states)?;
        let mlp_out = self.mlp.forward(&normed, dtype)?;
        hidden_states.add(&mlp_out.to_dtype(DType::F32)?)
    }
}

struct GatedMlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl GatedMlp {
    fn new(config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let gate_proj = candle_nn::linear_no_bias(config.hidden_size, config.intermediate_size, vb.pp("gate_proj"))?;
        let up_proj = candle_nn::linear_no_bias(config.hidden_size, config.intermediate_size, vb.pp("up_proj"))?;
        let down_proj = candle_nn::linear_no_bias(config.intermediate_size, config.hidden_size, vb.pp("down_proj"))?;
        Ok(Self { gate_proj, up_proj, down_proj })
    }

    fn forward(&self, hidden_states: &Tensor, dtype: DType) -> Result<Tensor> {
        let gate = project(&self.gate_proj, hidden_states, dtype)?;
        let up = project(&self.up_proj, hidden_states, dtype)?;
        // silu(x) = x / (1 + e^-x)
        let activated = gate.div(&(gate.neg()?.exp()? + 1.0)?)?;
        project(&self.down_proj, &activated.mul(&up)?, dtype)
    }
}

/// Root-mean-square norm, always evaluated in F32.
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(DType::F32)?;
        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = x.broadcast_div(&(mean_sq + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)
    }
}
