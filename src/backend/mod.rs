//! Compute backend trait.
//!
//! [`ComputeBackend`] lists the operations the llama forward pass needs.
//! [`cpu::CpuBackend`] is the implementation; its thread count comes from the
//! context that owns it.

pub mod cpu;

use crate::tensor::Tensor;

pub use cpu::CpuBackend;

/// Operations needed for transformer inference. All tensors are row-major.
pub trait ComputeBackend: Send + Sync {
    /// Matrix multiplication: [M, K] x [K, N] -> [M, N]
    fn matmul(&self, a: &Tensor, b: &Tensor) -> Tensor;

    /// Matrix multiply with transposed B: [M, K] x [N, K]^T -> [M, N]
    fn matmul_transpose(&self, a: &Tensor, b: &Tensor) -> Tensor;

    /// Quantized weights [N, K] (Q8_0 / Q4_0) times F32 input [M, K] -> [M, N],
    /// dequantizing inside the dot product.
    fn quantized_matmul(&self, weights: &Tensor, input: &Tensor) -> Tensor;

    /// Element-wise a + b.
    fn add(&self, a: &Tensor, b: &Tensor) -> Tensor;

    /// silu(gate) * up, element-wise.
    fn swiglu(&self, gate: &Tensor, up: &Tensor) -> Tensor;

    /// Per-row RMSNorm: x * rsqrt(mean(x^2) + eps) * weight
    fn rms_norm(&self, t: &Tensor, weight: &Tensor, eps: f32) -> Tensor;

    /// Softmax over the last dimension.
    fn softmax(&self, t: &Tensor) -> Tensor;

    /// Multiply every element by `factor`.
    fn scale(&self, t: &Tensor, factor: f32) -> Tensor;

    /// Rotary position embedding on consecutive pairs (2i, 2i+1) of each head,
    /// rows at absolute positions `pos_offset..pos_offset + seq_len`.
    fn rope(
        &self,
        q: &Tensor,
        k: &Tensor,
        pos_offset: usize,
        freq_base: f32,
        head_dim: usize,
        rope_dim: usize,
    ) -> (Tensor, Tensor);

    /// Gather rows of `table` [vocab, hidden] -> [ids.len(), hidden].
    fn embedding_lookup(&self, table: &Tensor, ids: &[u32]) -> Tensor;
}
