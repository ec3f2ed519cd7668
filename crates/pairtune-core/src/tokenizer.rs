//! Tokenizer capability and the `tokenizers` adapter

use serde_json::{Map, Value};
use std::path::Path;
use tokenizers::Tokenizer;

use crate::error::{Result, TuneError};

pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";

/// Tried in order when `tokenizer_config.json` names no usable eos token.
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|im_end|>", "<eos>", "[SEP]"];

/// Shared with batch workers, hence `Send + Sync`.
pub trait TextTokenizer: Send + Sync {
    /// Token ids for `text`, special tokens included, never truncated.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Textual end-of-sequence marker appended to every target.
    fn eos_token(&self) -> &str;

    fn pad_token_id(&self) -> u32;

    fn vocab_size(&self) -> usize;

    /// Write `tokenizer.json` and `tokenizer_config.json` into `dir`.
    fn save(&self, dir: &Path) -> Result<()>;
}

pub struct HfTokenizer {
    inner: Tokenizer,
    config: Map<String, Value>,
    eos_token: String,
    pad_token: String,
    pad_id: u32,
}

impl HfTokenizer {
    pub fn from_files(tokenizer_path: &Path, config_path: Option<&Path>) -> Result<Self> {
        let name = tokenizer_path.display().to_string();
        let inner = Tokenizer::from_file(tokenizer_path).map_err(|e| TuneError::TokenizerLoad {
            name: name.clone(),
            reason: e.to_string(),
        })?;

        let config = match config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                match serde_json::from_str::<Value>(&raw)? {
                    Value::Object(map) => map,
                    _ => {
                        return Err(TuneError::TokenizerLoad {
                            name,
                            reason: format!("{} is not a JSON object", path.display()),
                        })
                    }
                }
            }
            None => Map::new(),
        };

        Self::new(inner, config, &name)
    }

    pub fn new(inner: Tokenizer, config: Map<String, Value>, name: &str) -> Result<Self> {
        let in_vocab = |token: &String| inner.token_to_id(token).is_some();

        let eos_token = special_token(&config, "eos_token")
            .filter(in_vocab)
            .or_else(|| {
                EOS_CANDIDATES
                    .iter()
                    .map(|c| c.to_string())
                    .find(|c| in_vocab(c))
            })
            .ok_or_else(|| TuneError::TokenizerLoad {
                name: name.to_string(),
                reason: "no end-of-sequence token in vocabulary".into(),
            })?;

        let pad_token = match special_token(&config, "pad_token").filter(in_vocab) {
            Some(pad) => pad,
            None => {
                tracing::debug!("tokenizer '{}' has no pad token, using '{}'", name, eos_token);
                eos_token.clone()
            }
        };
        let pad_id = inner
            .token_to_id(&pad_token)
            .ok_or_else(|| TuneError::TokenizerLoad {
                name: name.to_string(),
                reason: format!("pad token '{pad_token}' not in vocabulary"),
            })?;

        Ok(Self {
            inner,
            config,
            eos_token,
            pad_token,
            pad_id,
        })
    }

    pub fn pad_token(&self) -> &str {
        &self.pad_token
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| TuneError::Tokenize(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn eos_token(&self) -> &str {
        &self.eos_token
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_id
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let tokenizer_path = dir.join(TOKENIZER_FILE);
        self.inner
            .save(&tokenizer_path, false)
            .map_err(|e| TuneError::Checkpoint {
                path: tokenizer_path.clone(),
                reason: e.to_string(),
            })?;

        // Persist the resolved specials so a reload sees the same pad/eos.
        let mut config = self.config.clone();
        config.insert("eos_token".into(), Value::String(self.eos_token.clone()));
        config.insert("pad_token".into(), Value::String(self.pad_token.clone()));
        std::fs::write(
            dir.join(TOKENIZER_CONFIG_FILE),
            serde_json::to_string_pretty(&Value::Object(config))?,
        )?;
        Ok(())
    }
}

/// `tokenizer_config.json` stores specials either as a plain string or as
/// an added-token object with a `content` field.
fn special_token(config: &Map<String, Value>, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}
