// Llama transformer forward pass over a KV cache.

use tracing::{debug, trace};

use crate::backend::ComputeBackend;
use crate::error::InferenceError;
use crate::tensor::Tensor;

use super::cache::KvCache;
use super::config::ModelConfig;
use super::weights::{LayerWeights, ModelWeights};

/// Linear forward pass, dispatching on quantized vs F32 weights.
///
/// Weights are stored as [out_features, in_features]:
/// - Q8_0/Q4_0: `backend.quantized_matmul(weight, input)`, fused dequant.
/// - F32: `backend.matmul_transpose(input, weight)`.
pub(crate) fn linear_forward(input: &Tensor, weight: &Tensor, backend: &dyn ComputeBackend) -> Tensor {
    if weight.dtype().is_quantized() {
        backend.quantized_matmul(weight, input)
    } else {
        backend.matmul_transpose(input, weight)
    }
}

/// Extract a per-head slice from a [seq_len, total_dim] buffer.
fn extract_head(data: &[f32], seq_len: usize, total_dim: usize, head: usize, head_dim: usize) -> Tensor {
    let mut head_data = vec![0.0f32; seq_len * head_dim];
    for pos in 0..seq_len {
        let src_offset = pos * total_dim + head * head_dim;
        let dst_offset = pos * head_dim;
        head_data[dst_offset..dst_offset + head_dim]
            .copy_from_slice(&data[src_offset..src_offset + head_dim]);
    }
    Tensor::new(vec![seq_len, head_dim], head_data)
}

/// Reassemble per-head outputs into one [seq_len, num_heads * head_dim] tensor.
fn assemble_heads(head_outputs: &[Tensor], seq_len: usize, head_dim: usize) -> Tensor {
    let total_dim = head_outputs.len() * head_dim;
    let mut result = vec![0.0f32; seq_len * total_dim];
    for (head, out) in head_outputs.iter().enumerate() {
        let head_data = out.as_f32();
        for pos in 0..seq_len {
            let src_offset = pos * head_dim;
            let dst_offset = pos * total_dim + head * head_dim;
            result[dst_offset..dst_offset + head_dim]
                .copy_from_slice(&head_data[src_offset..src_offset + head_dim]);
        }
    }
    Tensor::new(vec![seq_len, total_dim], result)
}

/// Repeat K/V heads for grouped-query attention.
///
/// Expands [seq_len, num_kv_heads * head_dim] to [seq_len, num_heads * head_dim];
/// KV head `g` serves Q heads `g * group .. (g + 1) * group`.
fn repeat_kv_heads(
    data: &[f32],
    seq_len: usize,
    num_kv_heads: usize,
    num_heads: usize,
    head_dim: usize,
) -> Vec<f32> {
    let repeats = num_heads / num_kv_heads;
    let kv_total_dim = num_kv_heads * head_dim;
    let out_total_dim = num_heads * head_dim;
    let mut result = vec![0.0f32; seq_len * out_total_dim];

    for pos in 0..seq_len {
        for kv_head in 0..num_kv_heads {
            let src_offset = pos * kv_total_dim + kv_head * head_dim;
            for r in 0..repeats {
                let out_head = kv_head * repeats + r;
                let dst_offset = pos * out_total_dim + out_head * head_dim;
                result[dst_offset..dst_offset + head_dim]
                    .copy_from_slice(&data[src_offset..src_offset + head_dim]);
            }
        }
    }

    result
}

/// Causal self-attention of `n_new` query rows over the whole cached sequence.
///
/// RoPE is applied to Q and the new K at absolute positions starting at
/// `cache.len()`; the rotated K and the new V are appended to the cache
/// before attending.
fn attention_cached(
    q: Tensor,
    k_new: Tensor,
    v_new: Tensor,
    cache: &mut KvCache,
    layer_idx: usize,
    config: &ModelConfig,
    backend: &dyn ComputeBackend,
) -> Result<Tensor, InferenceError> {
    let n_new = q.shape()[0];
    let num_heads = config.num_heads;
    let num_kv_heads = config.num_kv_heads;
    let head_dim = config.head_dim;
    let pos_offset = cache.len();
    trace!(n_new, pos_offset, layer_idx, "attention_cached");

    let (q, k_new) = backend.rope(
        &q,
        &k_new,
        pos_offset,
        config.rope_freq_base,
        head_dim,
        config.rope_dim,
    );

    cache.append(layer_idx, k_new.as_f32(), v_new.as_f32(), n_new)?;

    let total_len = pos_offset + n_new;
    let k_full = cache.get_k(layer_idx);
    let v_full = cache.get_v(layer_idx);
    let (k_expanded, v_expanded) = if num_kv_heads < num_heads {
        (
            repeat_kv_heads(k_full, total_len, num_kv_heads, num_heads, head_dim),
            repeat_kv_heads(v_full, total_len, num_kv_heads, num_heads, head_dim),
        )
    } else {
        (k_full.to_vec(), v_full.to_vec())
    };

    let total_dim = num_heads * head_dim;
    let attn_scale = 1.0 / (head_dim as f32).sqrt();
    let q_data = q.as_f32();

    let mut head_outputs = Vec::with_capacity(num_heads);
    for h in 0..num_heads {
        // Q: [n_new, head_dim], K/V: [total_len, head_dim]
        let q_head = extract_head(q_data, n_new, total_dim, h, head_dim);
        let k_head = extract_head(&k_expanded, total_len, total_dim, h, head_dim);
        let v_head = extract_head(&v_expanded, total_len, total_dim, h, head_dim);

        let scores = backend.matmul_transpose(&q_head, &k_head);
        let mut scores = backend.scale(&scores, attn_scale);

        // Query i sits at absolute position pos_offset + i.
        if n_new > 1 {
            let data = scores.as_f32_mut();
            for i in 0..n_new {
                for j in (pos_offset + i + 1)..total_len {
                    data[i * total_len + j] = f32::NEG_INFINITY;
                }
            }
        }

        let probs = backend.softmax(&scores);
        head_outputs.push(backend.matmul(&probs, &v_head));
    }

    Ok(assemble_heads(&head_outputs, n_new, head_dim))
}

/// SwiGLU feed-forward: down(silu(gate(x)) * up(x)).
fn ffn_forward(input: &Tensor, layer: &LayerWeights, backend: &dyn ComputeBackend) -> Tensor {
    let gate = linear_forward(input, &layer.ffn_gate, backend);
    let up = linear_forward(input, &layer.ffn_up, backend);
    let activated = backend.swiglu(&gate, &up);
    linear_forward(&activated, &layer.ffn_down, backend)
}

/// One pre-norm llama block.
fn transformer_layer_forward_cached(
    input: &Tensor,
    layer: &LayerWeights,
    layer_idx: usize,
    config: &ModelConfig,
    backend: &dyn ComputeBackend,
    cache: &mut KvCache,
) -> Result<Tensor, InferenceError> {
    trace!(layer = layer_idx, "transformer_layer_forward_cached");

    let normed = backend.rms_norm(input, &layer.attn_norm, config.norm_eps);
    let q = linear_forward(&normed, &layer.attn_q, backend);
    let k = linear_forward(&normed, &layer.attn_k, backend);
    let v = linear_forward(&normed, &layer.attn_v, backend);

    let attn_out = attention_cached(q, k, v, cache, layer_idx, config, backend)?;
    let projected = linear_forward(&attn_out, &layer.attn_output, backend);
    let residual = backend.add(input, &projected);

    let normed2 = backend.rms_norm(&residual, &layer.ffn_norm, config.norm_eps);
    let ffn_out = ffn_forward(&normed2, layer, backend);
    Ok(backend.add(&residual, &ffn_out))
}

/// Run `input_ids` through the model at positions `cache.len()..`.
///
/// Appends to the cache, advances it by `input_ids.len()`, and returns the
/// logits (`vocab_size` values) of the last token. On error the cache may
/// hold uncommitted rows; callers discard them with `cache.truncate(cache.len())`.
pub fn model_forward_step(
    input_ids: &[u32],
    weights: &ModelWeights,
    config: &ModelConfig,
    backend: &dyn ComputeBackend,
    cache: &mut KvCache,
) -> Result<Vec<f32>, InferenceError> {
    let n_tokens = input_ids.len();
    let pos_offset = cache.len();
    debug!(n_tokens, pos_offset, "model_forward_step");

    if n_tokens == 0 {
        return Err(InferenceError::Generation("no input tokens".to_string()));
    }
    for &id in input_ids {
        if (id as usize) >= config.vocab_size {
            return Err(InferenceError::Model(format!(
                "input token ID {} exceeds vocab_size {}",
                id, config.vocab_size
            )));
        }
    }
    if n_tokens > cache.remaining() {
        return Err(InferenceError::Generation(format!(
            "KV cache overflow: pos={} + n_tokens={} > max_seq_len={}",
            pos_offset,
            n_tokens,
            cache.capacity()
        )));
    }

    let mut hidden = backend.embedding_lookup(&weights.token_embedding, input_ids);
    for (i, layer) in weights.layers.iter().enumerate() {
        hidden = transformer_layer_forward_cached(&hidden, layer, i, config, backend, cache)?;
    }
    cache.advance(n_tokens);

    // Only the last row feeds the sampler.
    let last = Tensor::new(vec![1, config.hidden_size], hidden.row(n_tokens - 1).to_vec());
    let last = backend.rms_norm(&last, &weights.output_norm, config.norm_eps);
    let logits = linear_forward(&last, weights.lm_head(), backend);
    Ok(logits.into_f32_vec())
}
