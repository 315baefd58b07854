// KV cache for autoregressive generation.
//
// Stores the K and V projections of every evaluated position, per layer, so a
// decode step only computes projections for the new tokens.

use super::config::ModelConfig;
use crate::error::InferenceError;

/// Per-layer KV cache sized for a context of `n_ctx` positions.
///
/// A forward step appends K/V for each layer and then calls
/// [`advance`](KvCache::advance) once. Until then, layers that were already
/// appended hold more rows than [`len`](KvCache::len); `truncate(len())`
/// discards such a partial step.
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Per-layer K rows, `pos * kv_dim` committed elements each.
    k_cache: Vec<Vec<f32>>,
    v_cache: Vec<Vec<f32>>,
    /// Number of committed positions (same across all layers).
    pos: usize,
    /// Maximum number of positions.
    max_seq_len: usize,
    /// num_kv_heads * head_dim
    kv_dim: usize,
    num_layers: usize,
}

impl KvCache {
    /// Pre-allocate a cache for `n_ctx` positions of the given model.
    ///
    /// Fails instead of aborting when the reservation cannot be made.
    pub fn new(config: &ModelConfig, n_ctx: usize) -> Result<Self, InferenceError> {
        let kv_dim = config.kv_dim();
        let num_layers = config.num_layers;
        let capacity = n_ctx.checked_mul(kv_dim).ok_or_else(|| {
            InferenceError::Model(format!(
                "KV cache size overflows: n_ctx={} * kv_dim={}",
                n_ctx, kv_dim
            ))
        })?;

        let mut k_cache = Vec::with_capacity(num_layers);
        let mut v_cache = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            k_cache.push(reserve_layer(capacity, n_ctx)?);
            v_cache.push(reserve_layer(capacity, n_ctx)?);
        }

        Ok(Self {
            k_cache,
            v_cache,
            pos: 0,
            max_seq_len: n_ctx,
            kv_dim,
            num_layers,
        })
    }

    /// Append K/V rows for `n_tokens` new positions to one layer.
    ///
    /// `k_new` and `v_new` must each hold `n_tokens * kv_dim` elements.
    pub fn append(
        &mut self,
        layer: usize,
        k_new: &[f32],
        v_new: &[f32],
        n_tokens: usize,
    ) -> Result<(), InferenceError> {
        if layer >= self.num_layers {
            return Err(InferenceError::Generation(format!(
                "KV cache layer index {} out of bounds (num_layers={})",
                layer, self.num_layers
            )));
        }
        let expected_len = n_tokens * self.kv_dim;
        if k_new.len() != expected_len || v_new.len() != expected_len {
            return Err(InferenceError::Generation(format!(
                "KV cache append: expected {} elements ({}*{}), got k={} v={}",
                expected_len,
                n_tokens,
                self.kv_dim,
                k_new.len(),
                v_new.len()
            )));
        }
        if self.pos + n_tokens > self.max_seq_len {
            return Err(InferenceError::Generation(format!(
                "KV cache overflow: pos={} + n_tokens={} > max_seq_len={}",
                self.pos, n_tokens, self.max_seq_len
            )));
        }
        let committed = self.pos * self.kv_dim;
        if self.k_cache[layer].len() != committed {
            return Err(InferenceError::Generation(format!(
                "KV cache layer {} already has an uncommitted append",
                layer
            )));
        }
        self.k_cache[layer].extend_from_slice(k_new);
        self.v_cache[layer].extend_from_slice(v_new);
        Ok(())
    }

    /// Commit `n_tokens` positions after every layer has been appended.
    pub fn advance(&mut self, n_tokens: usize) {
        self.pos += n_tokens;
        debug_assert!(self.pos <= self.max_seq_len);
    }

    /// Drop every position at or after `pos`, including uncommitted rows.
    /// A `pos` beyond the current length only discards uncommitted rows.
    pub fn truncate(&mut self, pos: usize) {
        let pos = pos.min(self.pos);
        let keep = pos * self.kv_dim;
        for (k, v) in self.k_cache.iter_mut().zip(self.v_cache.iter_mut()) {
            k.truncate(keep);
            v.truncate(keep);
        }
        self.pos = pos;
    }

    /// Reset to empty. Allocations are kept.
    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// All K rows of a layer, uncommitted ones included: `[rows, kv_dim]`.
    pub fn get_k(&self, layer: usize) -> &[f32] {
        &self.k_cache[layer]
    }

    /// All V rows of a layer, uncommitted ones included: `[rows, kv_dim]`.
    pub fn get_v(&self, layer: usize) -> &[f32] {
        &self.v_cache[layer]
    }

    /// Number of committed positions.
    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Maximum number of positions (`n_ctx`).
    pub fn capacity(&self) -> usize {
        self.max_seq_len
    }

    /// Positions still available.
    pub fn remaining(&self) -> usize {
        self.max_seq_len - self.pos
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }
}

fn reserve_layer(capacity: usize, n_ctx: usize) -> Result<Vec<f32>, InferenceError> {
    let mut rows = Vec::new();
    rows.try_reserve_exact(capacity).map_err(|e| {
        InferenceError::Model(format!(
            "cannot allocate KV cache for n_ctx={}: {}",
            n_ctx, e
        ))
    })?;
    Ok(rows)
}
