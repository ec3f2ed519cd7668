//! Pretrained model + tokenizer loading from a local directory or the HuggingFace Hub

use candle_core::Device;
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::{Path, PathBuf};

use pairtune_core::{
    weight_shards, CausalLm, DecoderLm, HfTokenizer, Result, TextTokenizer, TuneError, CONFIG_FILE,
    TOKENIZER_CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE, WEIGHTS_INDEX_FILE,
};
use pairtune_training::settings::{ModelFamily, ModelSettings};
use pairtune_training::{LoadedModel, ModelProvider};

/// Files one pretrained checkpoint is made of.
struct ResolvedFiles {
    config: PathBuf,
    weights: Vec<PathBuf>,
    tokenizer: PathBuf,
    tokenizer_config: Option<PathBuf>,
}

/// Resolve `model.name` as a local directory first, then as a Hub repo id.
/// Weights come from `model.safetensors`, or from every shard listed in
/// `model.safetensors.index.json` when the single file is absent.
///
/// Examples:
/// - `./runs/base` -> reads `./runs/base/config.json`, `model.safetensors`, ...
/// - `TinyLlama/TinyLlama-1.1B-Chat-v1.0` -> downloads the same files into the Hub cache
pub struct PretrainedProvider;

impl PretrainedProvider {
    fn resolve(&self, name: &str) -> Result<ResolvedFiles> {
        let dir = Path::new(name);
        if dir.is_dir() {
            tracing::info!("loading model from local directory {}", dir.display());
            let single = dir.join(WEIGHTS_FILE);
            let index = dir.join(WEIGHTS_INDEX_FILE);
            let weights = if !single.is_file() && index.is_file() {
                weight_shards(&index)?.iter().map(|shard| dir.join(shard)).collect::<Vec<_>>()
            } else {
                vec![single]
            };
            let optional = dir.join(TOKENIZER_CONFIG_FILE);
            return Ok(ResolvedFiles {
                config: dir.join(CONFIG_FILE),
                weights,
                tokenizer: dir.join(TOKENIZER_FILE),
                tokenizer_config: optional.is_file().then_some(optional),
            });
        }

        tracing::info!("downloading {} from the Hub", name);
        let load_err = |reason: String| TuneError::ModelLoad { name: name.to_string(), reason };
        let api = Api::new().map_err(|e| load_err(format!("failed to initialize Hub API: {e}")))?;
        let repo = api.repo(Repo::new(name.to_string(), RepoType::Model));

        let fetch = |file: &str| {
            repo.get(file)
                .map_err(|e| load_err(format!("failed to download {file}: {e}")))
        };

        let weights = match repo.get(WEIGHTS_FILE) {
            Ok(single) => vec![single],
            Err(_) => {
                let index = fetch(WEIGHTS_INDEX_FILE)?;
                let shards = weight_shards(&index)?;
                tracing::info!("{} lists {} weight shards", WEIGHTS_INDEX_FILE, shards.len());
                shards
                    .iter()
                    .map(|shard| fetch(shard.as_str()))
                    .collect::<Result<Vec<_>>>()?
            }
        };

        Ok(ResolvedFiles {
            config: fetch(CONFIG_FILE)?,
            weights,
            tokenizer: repo.get(TOKENIZER_FILE).map_err(|e| TuneError::TokenizerLoad {
                name: name.to_string(),
                reason: e.to_string(),
            })?,
            tokenizer_config: repo.get(TOKENIZER_CONFIG_FILE).ok(),
        })
    }
}

impl ModelProvider for PretrainedProvider {
    fn load(&self, settings: &ModelSettings, device: &Device) -> Result<LoadedModel> {
        let files = self.resolve(&settings.name)?;

        if !files.tokenizer.is_file() {
            return Err(TuneError::TokenizerLoad {
                name: settings.name.clone(),
                reason: format!("{} not found", files.tokenizer.display()),
            });
        }
        let tokenizer = HfTokenizer::from_files(&files.tokenizer, files.tokenizer_config.as_deref())?;

        let model = match settings.family {
            ModelFamily::Llama => DecoderLm::load(&files.config, &files.weights, device)?,
        };

        let model_vocab = model.config().vocab_size;
        if tokenizer.vocab_size() > model_vocab {
            return Err(TuneError::ModelLoad {
                name: settings.name.clone(),
                reason: format!(
                    "tokenizer has {} tokens but the model embeds only {}",
                    tokenizer.vocab_size(),
                    model_vocab
                ),
            });
        }

        tracing::info!(
            "model loaded: {} layers, hidden {}, ~{}M params, vocab {}",
            model.config().num_hidden_layers,
            model.config().hidden_size,
            model.config().total_params() / 1_000_000,
            tokenizer.vocab_size()
        );

        Ok(LoadedModel {
            model: Box::new(model) as Box<dyn CausalLm>,
            tokenizer: Box::new(tokenizer) as Box<dyn TextTokenizer>,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairtune_core::DecoderConfig;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn write_tokenizer(dir: &Path, vocab_size: usize) {
        let mut vocab = serde_json::Map::new();
        vocab.insert("[UNK]".into(), 0.into());
        vocab.insert("</s>".into(), 1.into());
        for i in 2..vocab_size {
            vocab.insert(format!("w{i}"), i.into());
        }
        let spec = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
        });
        std::fs::write(dir.join(TOKENIZER_FILE), spec.to_string()).unwrap();
    }

    fn settings(dir: &Path) -> ModelSettings {
        ModelSettings {
            name: dir.display().to_string(),
            save_path: PathBuf::from("unused"),
            family: ModelFamily::Llama,
        }
    }

    #[test]
    fn test_loads_local_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        DecoderLm::new(DecoderConfig::tiny(16), &Device::Cpu)?.save(dir.path())?;
        write_tokenizer(dir.path(), 16);

        let loaded = PretrainedProvider.load(&settings(dir.path()), &Device::Cpu)?;
        assert_eq!(loaded.tokenizer.eos_token(), "</s>");
        assert_eq!(loaded.tokenizer.pad_token_id(), 1);
        assert_eq!(loaded.model.max_positions(), 256);
        Ok(())
    }

    /// A Llama checkpoint as the HuggingFace tooling lays it out: HF config keys,
    /// grouped-query attention, tied embeddings, BF16 tensors split over two shards.
    fn write_hub_style_checkpoint(dir: &Path) -> Result<()> {
        std::fs::write(
            dir.join(CONFIG_FILE),
            r#"{
                "architectures": ["LlamaForCausalLM"],
                "model_type": "llama",
                "hidden_act": "silu",
                "vocab_size": 16,
                "hidden_size": 16,
                "intermediate_size": 32,
                "num_hidden_layers": 1,
                "num_attention_heads": 4,
                "num_key_value_heads": 2,
                "max_position_embeddings": 64,
                "rms_norm_eps": 1e-5,
                "rope_theta": 10000.0,
                "tie_word_embeddings": true,
                "bos_token_id": 0,
                "eos_token_id": 1,
                "torch_dtype": "bfloat16"
            }"#,
        )?;

        let device = Device::Cpu;
        let randn = |shape: &[usize]| -> Result<candle_core::Tensor> {
            Ok(candle_core::Tensor::randn(0f32, 0.02, shape, &device)?.to_dtype(candle_core::DType::BF16)?)
        };
        let ones = |size: usize| -> Result<candle_core::Tensor> {
            Ok(candle_core::Tensor::ones(size, candle_core::DType::BF16, &device)?)
        };

        let layer = "model.layers.0";
        let first = HashMap::from([
            ("model.embed_tokens.weight".to_string(), randn(&[16, 16])?),
            (format!("{layer}.input_layernorm.weight"), ones(16)?),
            (format!("{layer}.self_attn.q_proj.weight"), randn(&[16, 16])?),
            (format!("{layer}.self_attn.k_proj.weight"), randn(&[8, 16])?),
            (format!("{layer}.self_attn.v_proj.weight"), randn(&[8, 16])?),
            (format!("{layer}.self_attn.o_proj.weight"), randn(&[16, 16])?),
            (format!("{layer}.self_attn.rotary_emb.inv_freq"), ones(2)?),
        ]);
        let second = HashMap::from([
            (format!("{layer}.post_attention_layernorm.weight"), ones(16)?),
            (format!("{layer}.mlp.gate_proj.weight"), randn(&[32, 16])?),
            (format!("{layer}.mlp.up_proj.weight"), randn(&[32, 16])?),
            (format!("{layer}.mlp.down_proj.weight"), randn(&[16, 32])?),
            ("model.norm.weight".to_string(), ones(16)?),
        ]);

        let shards = ["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"];
        let mut weight_map = serde_json::Map::new();
        for (shard, tensors) in shards.iter().zip([&first, &second]) {
            candle_core::safetensors::save(tensors, dir.join(shard))?;
            for name in tensors.keys() {
                weight_map.insert(name.clone(), (*shard).into());
            }
        }
        let index = serde_json::json!({ "metadata": {}, "weight_map": weight_map });
        std::fs::write(dir.join(WEIGHTS_INDEX_FILE), index.to_string())?;
        Ok(())
    }

    #[test]
    fn test_loads_hub_style_llama_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_hub_style_checkpoint(dir.path())?;
        write_tokenizer(dir.path(), 16);

        let loaded = PretrainedProvider.load(&settings(dir.path()), &Device::Cpu)?;
        assert_eq!(loaded.model.max_positions(), 64);

        let input_ids = candle_core::Tensor::new(&[[2u32, 5, 9]], &Device::Cpu)?;
        let logits = loaded.model.forward(&input_ids)?;
        assert_eq!(logits.dims(), &[1, 3, 16]);

        let out = tempfile::tempdir()?;
        loaded.model.save(out.path())?;
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(out.path().join(CONFIG_FILE))?)?;
        assert_eq!(written["model_type"], "llama");
        assert_eq!(written["num_key_value_heads"], 2);
        assert_eq!(written["eos_token_id"], 1);

        let reloaded = PretrainedProvider.load(&settings(out.path()), &Device::Cpu);
        assert!(matches!(reloaded, Err(TuneError::TokenizerLoad { .. })));
        write_tokenizer(out.path(), 16);
        let reloaded = PretrainedProvider.load(&settings(out.path()), &Device::Cpu)?;
        let diff = (logits - reloaded.model.forward(&input_ids)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn test_missing_tokenizer_is_a_tokenizer_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        DecoderLm::new(DecoderConfig::tiny(16), &Device::Cpu)?.save(dir.path())?;

        let result = PretrainedProvider.load(&settings(dir.path()), &Device::Cpu);
        assert!(matches!(result, Err(TuneError::TokenizerLoad { .. })));
        Ok(())
    }

    #[test]
    fn test_tokenizer_larger_than_embedding_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        DecoderLm::new(DecoderConfig::tiny(8), &Device::Cpu)?.save(dir.path())?;
        write_tokenizer(dir.path(), 20);

        let result = PretrainedProvider.load(&settings(dir.path()), &Device::Cpu);
        assert!(matches!(result, Err(TuneError::ModelLoad { .. })));
        Ok(())
    }
}
