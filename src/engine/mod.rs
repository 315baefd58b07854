//! Inference sessions over loaded models.
//!
//! - [`LoadedModel`]: weights, tokenizer and token pieces shared by sessions
//! - [`Session`]: one context (KV cache, logits, sampler)

pub mod sampler;
pub mod session;

pub use sampler::{SamplingConfig, XorShiftRng};
pub use session::{EvalStatus, LoadedModel, Session};
