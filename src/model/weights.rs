// Model weight loading from GGUF tensors.

use tracing::{debug, info};

use super::config::ModelConfig;
use crate::error::InferenceError;
use crate::gguf::tensor::load_tensor_by_name;
use crate::gguf::GgufFile;
use crate::tensor::Tensor;

/// Weights for a single transformer layer.
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub attn_norm: Tensor,
    /// [hidden, hidden]
    pub attn_q: Tensor,
    /// [kv_dim, hidden]
    pub attn_k: Tensor,
    /// [kv_dim, hidden]
    pub attn_v: Tensor,
    /// [hidden, hidden]
    pub attn_output: Tensor,
    pub ffn_norm: Tensor,
    /// [ffn, hidden]
    pub ffn_gate: Tensor,
    /// [ffn, hidden]
    pub ffn_up: Tensor,
    /// [hidden, ffn]
    pub ffn_down: Tensor,
}

/// All model weights loaded from a GGUF file.
#[derive(Debug, Clone)]
pub struct ModelWeights {
    /// [vocab_size, hidden_size]
    pub token_embedding: Tensor,
    pub layers: Vec<LayerWeights>,
    /// [hidden_size]
    pub output_norm: Tensor,
    /// LM head [vocab_size, hidden_size]. `None` when tied to the embedding.
    pub output: Option<Tensor>,
}

/// Load a tensor by name and check its row-major shape.
///
/// Quantized tensors are kept quantized; `quantized_matmul` dequantizes
/// inside the dot product.
fn load_tensor(gguf: &GgufFile, name: &str, expected: &[usize]) -> Result<Tensor, InferenceError> {
    let gguf_tensor = load_tensor_by_name(gguf, name)?;
    let shape = gguf_tensor.shape();
    if shape != expected {
        return Err(InferenceError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            actual: shape,
        });
    }
    debug!(
        tensor = name,
        ?shape,
        dtype = %gguf_tensor.dtype,
        bytes = gguf_tensor.data.len(),
        "Loading tensor"
    );
    gguf_tensor.to_tensor()
}

/// Load an optional tensor. `Ok(None)` when absent; other errors propagate.
fn load_tensor_optional(
    gguf: &GgufFile,
    name: &str,
    expected: &[usize],
) -> Result<Option<Tensor>, InferenceError> {
    match gguf.find_tensor(name) {
        Some(_) => load_tensor(gguf, name, expected).map(Some),
        None => Ok(None),
    }
}

/// Norm weights must be F32 since `rms_norm` reads them directly.
fn load_norm(gguf: &GgufFile, name: &str, hidden: usize) -> Result<Tensor, InferenceError> {
    let t = load_tensor(gguf, name, &[hidden])?;
    if t.dtype().is_quantized() {
        return Err(InferenceError::Model(format!(
            "norm tensor '{}' must be F32 or F16, got {:?}",
            name,
            t.dtype()
        )));
    }
    Ok(t)
}

impl ModelWeights {
    /// Load every tensor of a llama-style model.
    ///
    /// Tensor names follow the GGUF convention: `token_embd.weight`,
    /// `blk.{i}.*`, `output_norm.weight` and optional `output.weight`.
    pub fn from_gguf(gguf: &GgufFile, config: &ModelConfig) -> Result<ModelWeights, InferenceError> {
        info!(
            arch = config.arch.name(),
            num_layers = config.num_layers,
            hidden_size = config.hidden_size,
            "Loading model weights from GGUF"
        );
        let h = config.hidden_size;
        let kv = config.kv_dim();
        let ffn = config.ffn_hidden;
        let vocab = config.vocab_size;

        let token_embedding = load_tensor(gguf, "token_embd.weight", &[vocab, h])?;

        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            debug!("Loading layer {}/{}", i + 1, config.num_layers);
            let p = format!("blk.{}", i);
            layers.push(LayerWeights {
                attn_norm: load_norm(gguf, &format!("{}.attn_norm.weight", p), h)?,
                attn_q: load_tensor(gguf, &format!("{}.attn_q.weight", p), &[h, h])?,
                attn_k: load_tensor(gguf, &format!("{}.attn_k.weight", p), &[kv, h])?,
                attn_v: load_tensor(gguf, &format!("{}.attn_v.weight", p), &[kv, h])?,
                attn_output: load_tensor(gguf, &format!("{}.attn_output.weight", p), &[h, h])?,
                ffn_norm: load_norm(gguf, &format!("{}.ffn_norm.weight", p), h)?,
                ffn_gate: load_tensor(gguf, &format!("{}.ffn_gate.weight", p), &[ffn, h])?,
                ffn_up: load_tensor(gguf, &format!("{}.ffn_up.weight", p), &[ffn, h])?,
                ffn_down: load_tensor(gguf, &format!("{}.ffn_down.weight", p), &[h, ffn])?,
            });
        }

        let output_norm = load_norm(gguf, "output_norm.weight", h)?;
        let output = load_tensor_optional(gguf, "output.weight", &[vocab, h])?;

        info!(
            num_layers = layers.len(),
            tied_output = output.is_none(),
            "Model weights loaded"
        );

        Ok(ModelWeights {
            token_embedding,
            layers,
            output_norm,
            output,
        })
    }

    /// LM head: `output.weight`, or the embedding table when tied.
    pub fn lm_head(&self) -> &Tensor {
        self.output.as_ref().unwrap_or(&self.token_embedding)
    }
}
