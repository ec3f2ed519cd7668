//! pairtune optimizer: AdamW over named gradients, linear warmup schedule,
//! global-norm clipping and dynamic loss scaling.

pub mod adamw;
pub mod clip;
pub mod scaler;
pub mod schedule;

pub use adamw::{AdamW, AdamWConfig};
pub use clip::{clip_grad_norm, global_grad_norm};
pub use scaler::LossScaler;
pub use schedule::LinearWarmup;

/// Gradients keyed by parameter name, iterated in name order.
pub type NamedGrads = std::collections::BTreeMap<String, candle_core::Tensor>;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
