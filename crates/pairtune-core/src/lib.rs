//! pairtune core: model and tokenizer capabilities, the Llama model
//! family, masked loss and the shared error type.

pub mod attention;
pub mod config;
pub mod error;
pub mod loss;
pub mod model;
pub mod tokenizer;

pub use config::{DecoderConfig, LLAMA_MODEL_TYPE};
pub use error::{Result, TuneError};
pub use loss::masked_next_token_loss;
pub use model::{weight_shards, CausalLm, DecoderLm, CONFIG_FILE, WEIGHTS_FILE, WEIGHTS_INDEX_FILE};
pub use tokenizer::{HfTokenizer, TextTokenizer, TOKENIZER_CONFIG_FILE, TOKENIZER_FILE};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
