//! A C-ABI bridge over a CPU GGUF llama inference engine.
//!
//! The `llama_bridge_*` functions in [`bridge::ffi`] are the stable C
//! interface (see `include/llama_bridge.h`). [`api::LlamaModel`] is the safe
//! Rust interface over the same engine.

pub mod api;
pub mod backend;
pub mod bridge;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod gguf;
pub mod logging;
pub mod model;
pub mod tensor;
pub mod tokenizer;

#[cfg(test)]
mod testing;

pub use api::{ContextParams, GenerateOptions, LlamaModel};
pub use error::{BridgeError, InferenceError};
pub use tokenizer::create_tokenizer_from_gguf;
