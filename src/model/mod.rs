//! Llama model: configuration, weights, KV cache and the forward pass.

pub mod cache;
pub mod config;
pub mod layer;
pub mod weights;

pub use cache::KvCache;
pub use config::{ModelArch, ModelConfig};
pub use layer::model_forward_step;
pub use weights::{LayerWeights, ModelWeights};
