//! The C ABI: handle registry, backend lifecycle and `llama_bridge_*` exports.

pub mod ffi;
pub mod registry;
pub mod runtime;

pub use ffi::global;
pub use runtime::{BackendState, Runtime, TOKENIZE_INVALID};
