// Model hyperparameters read from GGUF metadata.

use crate::error::InferenceError;
use crate::gguf::{GgufFile, GgufValue};

use tracing::info;

/// Supported model architectures. Both use the llama block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArch {
    Llama,
    Mistral,
}

impl ModelArch {
    pub fn from_name(name: &str) -> Result<Self, InferenceError> {
        match name {
            "llama" => Ok(ModelArch::Llama),
            "mistral" => Ok(ModelArch::Mistral),
            other => Err(InferenceError::UnsupportedArchitecture(other.to_string())),
        }
    }

    /// GGUF metadata key prefix.
    pub fn name(&self) -> &'static str {
        match self {
            ModelArch::Llama => "llama",
            ModelArch::Mistral => "mistral",
        }
    }
}

/// Model configuration extracted from GGUF metadata.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub arch: ModelArch,

    // Dimensions
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub ffn_hidden: usize,
    pub vocab_size: usize,
    /// Trained context length.
    pub max_seq_len: usize,

    pub norm_eps: f32,
    pub rope_freq_base: f32,
    pub rope_dim: usize,
}

impl ModelConfig {
    /// Read `general.architecture`, then the `{arch}.*` hyperparameters.
    pub fn from_gguf(gguf: &GgufFile) -> Result<Self, InferenceError> {
        let arch = ModelArch::from_name(gguf.require_str("general.architecture")?)?;
        let arch_name = arch.name();

        let hidden_size = gguf.require_u32(&format!("{}.embedding_length", arch_name))? as usize;
        let num_layers = gguf.require_u32(&format!("{}.block_count", arch_name))? as usize;
        let num_heads = gguf.require_u32(&format!("{}.attention.head_count", arch_name))? as usize;
        let ffn_hidden = gguf.require_u32(&format!("{}.feed_forward_length", arch_name))? as usize;

        let num_kv_heads = gguf
            .get_u32(&format!("{}.attention.head_count_kv", arch_name))
            .map(|v| v as usize)
            .unwrap_or(num_heads);

        let norm_eps = gguf
            .get_f32(&format!("{}.attention.layer_norm_rms_epsilon", arch_name))
            .unwrap_or(1e-5);

        let rope_freq_base = gguf
            .get_f32(&format!("{}.rope.freq_base", arch_name))
            .unwrap_or(10000.0);

        let max_seq_len = gguf
            .get_u32(&format!("{}.context_length", arch_name))
            .map(|v| v as usize)
            .unwrap_or(2048);

        // Fall back to the tokenizer vocabulary when the model key is absent.
        let vocab_size = gguf
            .get_u32(&format!("{}.vocab_size", arch_name))
            .map(|v| v as usize)
            .or_else(|| match gguf.get("tokenizer.ggml.tokens") {
                Some(GgufValue::Array(arr)) => Some(arr.len()),
                _ => None,
            })
            .unwrap_or(0);

        if num_layers == 0 || hidden_size == 0 || num_heads == 0 || num_kv_heads == 0 {
            return Err(InferenceError::Model(format!(
                "degenerate dimensions: hidden_size={}, num_layers={}, num_heads={}, num_kv_heads={}",
                hidden_size, num_layers, num_heads, num_kv_heads
            )));
        }
        if hidden_size % num_heads != 0 {
            return Err(InferenceError::Model(format!(
                "hidden_size ({}) is not divisible by num_heads ({})",
                hidden_size, num_heads
            )));
        }
        // GQA group size must divide evenly
        if num_heads % num_kv_heads != 0 {
            return Err(InferenceError::Model(format!(
                "num_heads ({}) is not divisible by num_kv_heads ({})",
                num_heads, num_kv_heads
            )));
        }
        if vocab_size == 0 {
            return Err(InferenceError::Model(
                "vocab size is unknown: no vocab_size key and no tokenizer tokens".to_string(),
            ));
        }

        let head_dim = hidden_size / num_heads;
        let rope_dim = gguf
            .get_u32(&format!("{}.rope.dimension_count", arch_name))
            .map(|v| v as usize)
            .unwrap_or(head_dim);
        if rope_dim > head_dim || rope_dim % 2 != 0 {
            return Err(InferenceError::Model(format!(
                "rope dimension {} must be even and at most head_dim {}",
                rope_dim, head_dim
            )));
        }

        let config = ModelConfig {
            arch,
            hidden_size,
            num_layers,
            num_heads,
            num_kv_heads,
            head_dim,
            ffn_hidden,
            vocab_size,
            max_seq_len,
            norm_eps,
            rope_freq_base,
            rope_dim,
        };

        info!(
            arch = arch_name,
            hidden_size = config.hidden_size,
            num_layers = config.num_layers,
            num_heads = config.num_heads,
            num_kv_heads = config.num_kv_heads,
            head_dim = config.head_dim,
            ffn_hidden = config.ffn_hidden,
            vocab_size = config.vocab_size,
            max_seq_len = config.max_seq_len,
            norm_eps = config.norm_eps,
            rope_freq_base = config.rope_freq_base,
            rope_dim = config.rope_dim,
            "model config loaded from GGUF"
        );

        Ok(config)
    }

    /// Width of one K or V row across all KV heads.
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }
}
