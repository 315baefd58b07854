//! CPU compute backend.
//!
//! Pure Rust. Weight products (`matmul_transpose`, `quantized_matmul`) split
//! their output columns across scoped threads once the matrix is large
//! enough to amortise the spawn cost.

use tracing::{debug, trace};

use crate::gguf::quant::f16_to_f32;
use crate::tensor::{Tensor, TensorDtype, TensorStorage};

use super::ComputeBackend;

/// Minimum `n * k` of a weight product before it is split across threads.
const PARALLEL_MIN_WORK: usize = 1 << 16;

/// CPU compute backend.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    n_threads: usize,
}

impl CpuBackend {
    /// Single-threaded backend.
    pub fn new() -> Self {
        Self::with_threads(1)
    }

    /// Backend that may use up to `n_threads` threads per weight product.
    /// Zero is treated as one.
    pub fn with_threads(n_threads: usize) -> Self {
        let n_threads = n_threads.max(1);
        debug!(n_threads, "Initialized CpuBackend");
        Self { n_threads }
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Fill an [m, n] output where element (i, j) is `dot(i, j)`.
    ///
    /// Columns are partitioned across threads; each thread owns a disjoint
    /// column range and results are stitched back row by row.
    fn fill_output<F>(&self, m: usize, n: usize, k: usize, dot: F) -> Vec<f32>
    where
        F: Fn(usize, usize) -> f32 + Sync,
    {
        let threads = if n.saturating_mul(k) >= PARALLEL_MIN_WORK {
            self.n_threads.min(n)
        } else {
            1
        };

        let mut result = vec![0.0f32; m * n];
        if threads <= 1 {
            for i in 0..m {
                for j in 0..n {
                    result[i * n + j] = dot(i, j);
                }
            }
            return result;
        }

        trace!(m, n, k, threads, "CPU parallel weight product");
        let chunk = (n + threads - 1) / threads;
        let dot = &dot;
        let parts: Vec<(usize, usize, Vec<f32>)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..n)
                .step_by(chunk)
                .map(|j0| {
                    let j1 = (j0 + chunk).min(n);
                    s.spawn(move || {
                        let width = j1 - j0;
                        let mut part = vec![0.0f32; m * width];
                        for i in 0..m {
                            for j in j0..j1 {
                                part[i * width + (j - j0)] = dot(i, j);
                            }
                        }
                        (j0, j1, part)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });

        for (j0, j1, part) in parts {
            let width = j1 - j0;
            for i in 0..m {
                result[i * n + j0..i * n + j1].copy_from_slice(&part[i * width..(i + 1) * width]);
            }
        }
        result
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn dot_f32(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Dot product of one Q8_0 row (raw blocks) with an f32 vector.
#[inline]
fn dot_q8_0(row: &[u8], x: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (block, xs) in row.chunks_exact(34).zip(x.chunks(32)) {
        let d = f16_to_f32(u16::from_le_bytes([block[0], block[1]]));
        let mut acc = 0.0f32;
        for (q, &xv) in block[2..].iter().zip(xs) {
            acc += (*q as i8) as f32 * xv;
        }
        sum += d * acc;
    }
    sum
}

/// Dot product of one Q4_0 row (raw blocks) with an f32 vector.
#[inline]
fn dot_q4_0(row: &[u8], x: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (block, xs) in row.chunks_exact(18).zip(x.chunks(32)) {
        let d = f16_to_f32(u16::from_le_bytes([block[0], block[1]]));
        let mut acc = 0.0f32;
        for j in 0..16 {
            let byte = block[2 + j];
            let lo = (byte & 0x0F) as i32 - 8;
            let hi = (byte >> 4) as i32 - 8;
            if let Some(&xv) = xs.get(j) {
                acc += lo as f32 * xv;
            }
            if let Some(&xv) = xs.get(j + 16) {
                acc += hi as f32 * xv;
            }
        }
        sum += d * acc;
    }
    sum
}

fn assert_2d(name: &str, shape: &[usize]) {
    assert_eq!(shape.len(), 2, "{}: expected a 2D tensor, got shape {:?}", name, shape);
}

impl ComputeBackend for CpuBackend {
    fn matmul(&self, a: &Tensor, b: &Tensor) -> Tensor {
        assert_2d("matmul a", a.shape());
        assert_2d("matmul b", b.shape());
        let (m, k, n) = (a.shape()[0], a.shape()[1], b.shape()[1]);
        assert_eq!(
            k,
            b.shape()[0],
            "matmul: inner dimensions must match: a is [{}, {}], b is {:?}",
            m,
            k,
            b.shape()
        );
        trace!(m, k, n, "CPU matmul");

        let a_data = a.as_f32();
        let b_data = b.as_f32();
        let mut result = vec![0.0f32; m * n];
        for i in 0..m {
            for p in 0..k {
                let av = a_data[i * k + p];
                if av == 0.0 {
                    continue;
                }
                let b_row = &b_data[p * n..(p + 1) * n];
                for (r, &bv) in result[i * n..(i + 1) * n].iter_mut().zip(b_row) {
                    *r += av * bv;
                }
            }
        }
        Tensor::new(vec![m, n], result)
    }

    fn matmul_transpose(&self, a: &Tensor, b: &Tensor) -> Tensor {
        assert_2d("matmul_transpose a", a.shape());
        assert_2d("matmul_transpose b", b.shape());
        let (m, k, n) = (a.shape()[0], a.shape()[1], b.shape()[0]);
        assert_eq!(
            k,
            b.shape()[1],
            "matmul_transpose: a cols ({}) must match b cols ({})",
            k,
            b.shape()[1]
        );
        trace!(m, k, n, "CPU matmul_transpose");

        let a_data = a.as_f32();
        let b_data = b.as_f32();
        let result = self.fill_output(m, n, k, |i, j| {
            dot_f32(&a_data[i * k..(i + 1) * k], &b_data[j * k..(j + 1) * k])
        });
        Tensor::new(vec![m, n], result)
    }

    fn quantized_matmul(&self, weights: &Tensor, input: &Tensor) -> Tensor {
        assert_2d("quantized_matmul input", input.shape());
        assert_2d("quantized_matmul weights", weights.shape());
        let (m, k, n) = (input.shape()[0], input.shape()[1], weights.shape()[0]);
        assert_eq!(
            k,
            weights.shape()[1],
            "quantized_matmul: input cols ({}) must match weight cols ({})",
            k,
            weights.shape()[1]
        );

        let dtype = weights.dtype();
        let raw = match weights.storage() {
            TensorStorage::Quantized(data) => data.as_slice(),
            TensorStorage::F32(_) => panic!("quantized_matmul: expected quantized weights"),
        };
        let blocks_per_row = (k + dtype.block_size() - 1) / dtype.block_size();
        let bytes_per_row = blocks_per_row * dtype.block_byte_size();
        let x = input.as_f32();
        trace!(m, k, n, ?dtype, "CPU quantized_matmul");

        let row_dot: fn(&[u8], &[f32]) -> f32 = match dtype {
            TensorDtype::Q8_0 => dot_q8_0,
            TensorDtype::Q4_0 => dot_q4_0,
            TensorDtype::F32 => unreachable!("F32 storage rejected above"),
        };
        let result = self.fill_output(m, n, k, |i, j| {
            row_dot(
                &raw[j * bytes_per_row..(j + 1) * bytes_per_row],
                &x[i * k..(i + 1) * k],
            )
        });
        Tensor::new(vec![m, n], result)
    }

    fn add(&self, a: &Tensor, b: &Tensor) -> Tensor {
        assert_eq!(
            a.shape(),
            b.shape(),
            "add: shapes must match, got {:?} and {:?}",
            a.shape(),
            b.shape()
        );
        let result = a.as_f32().iter().zip(b.as_f32()).map(|(x, y)| x + y).collect();
        Tensor::new(a.shape().to_vec(), result)
    }

    fn swiglu(&self, gate: &Tensor, up: &Tensor) -> Tensor {
        assert_eq!(
            gate.shape(),
            up.shape(),
            "swiglu: gate and up shapes must match, got {:?} and {:?}",
            gate.shape(),
            up.shape()
        );
        let result = gate
            .as_f32()
            .iter()
            .zip(up.as_f32())
            .map(|(&g, &u)| g / (1.0 + (-g).exp()) * u)
            .collect();
        Tensor::new(gate.shape().to_vec(), result)
    }

    fn rms_norm(&self, t: &Tensor, weight: &Tensor, eps: f32) -> Tensor {
        let shape = t.shape();
        assert!(!shape.is_empty(), "rms_norm: tensor must be at least 1D");
        let hidden = shape[shape.len() - 1];
        let w = weight.as_f32();
        assert_eq!(w.len(), hidden, "rms_norm: weight length must match hidden size");
        trace!(hidden, eps, "CPU rms_norm");

        let mut result = t.as_f32().to_vec();
        for row in result.chunks_mut(hidden) {
            let mean_sq = row.iter().map(|&x| x * x).sum::<f32>() / hidden as f32;
            let inv = 1.0 / (mean_sq + eps).sqrt();
            for (x, &wv) in row.iter_mut().zip(w) {
                *x = *x * inv * wv;
            }
        }
        Tensor::new(shape.to_vec(), result)
    }

    fn softmax(&self, t: &Tensor) -> Tensor {
        let shape = t.shape();
        assert!(!shape.is_empty(), "softmax: tensor must be at least 1D");
        let last = shape[shape.len() - 1];

        let mut result = t.as_f32().to_vec();
        for row in result.chunks_mut(last) {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            if max == f32::NEG_INFINITY {
                // Fully masked row.
                row.iter_mut().for_each(|x| *x = 0.0);
                continue;
            }
            let mut sum = 0.0f32;
            for x in row.iter_mut() {
                *x = (*x - max).exp();
                sum += *x;
            }
            for x in row.iter_mut() {
                *x /= sum;
            }
        }
        Tensor::new(shape.to_vec(), result)
    }

    fn scale(&self, t: &Tensor, factor: f32) -> Tensor {
        let result = t.as_f32().iter().map(|&x| x * factor).collect();
        Tensor::new(t.shape().to_vec(), result)
    }

    fn rope(
        &self,
        q: &Tensor,
        k: &Tensor,
        pos_offset: usize,
        freq_base: f32,
        head_dim: usize,
        rope_dim: usize,
    ) -> (Tensor, Tensor) {
        assert!(head_dim > 0, "rope: head_dim must be > 0");
        assert!(
            rope_dim <= head_dim && rope_dim % 2 == 0,
            "rope: rope_dim ({}) must be even and <= head_dim ({})",
            rope_dim,
            head_dim
        );
        assert_2d("rope q", q.shape());
        assert_2d("rope k", k.shape());
        let seq_len = q.shape()[0];
        assert_eq!(k.shape()[0], seq_len, "rope: q and k must have same seq_len");
        trace!(seq_len, head_dim, rope_dim, pos_offset, freq_base, "CPU rope");

        // freq_i = base^(-2i / rope_dim), as in ggml
        let half = rope_dim / 2;
        let inv_ndims = -1.0f32 / rope_dim as f32;
        let freqs: Vec<f32> = (0..half)
            .map(|i| freq_base.powf(inv_ndims * (2 * i) as f32))
            .collect();

        let rotate = |t: &Tensor| -> Tensor {
            let total_dim = t.shape()[1];
            assert!(
                total_dim % head_dim == 0,
                "rope: total_dim ({}) must be divisible by head_dim ({})",
                total_dim,
                head_dim
            );
            let mut out = t.as_f32().to_vec();
            for pos in 0..seq_len {
                let abs_pos = (pos + pos_offset) as f32;
                for head in 0..total_dim / head_dim {
                    let base = pos * total_dim + head * head_dim;
                    for (i, &freq) in freqs.iter().enumerate() {
                        let (sin, cos) = (abs_pos * freq).sin_cos();
                        let x0 = out[base + 2 * i];
                        let x1 = out[base + 2 * i + 1];
                        out[base + 2 * i] = x0 * cos - x1 * sin;
                        out[base + 2 * i + 1] = x0 * sin + x1 * cos;
                    }
                }
            }
            Tensor::new(t.shape().to_vec(), out)
        };

        (rotate(q), rotate(k))
    }

    fn embedding_lookup(&self, table: &Tensor, ids: &[u32]) -> Tensor {
        assert_2d("embedding_lookup", table.shape());
        let (vocab, hidden) = (table.shape()[0], table.shape()[1]);
        trace!(vocab, hidden, n_tokens = ids.len(), "CPU embedding_lookup");

        let mut result = Vec::with_capacity(ids.len() * hidden);
        for &id in ids {
            let id = id as usize;
            assert!(id < vocab, "embedding_lookup: token ID {} out of range (vocab_size={})", id, vocab);
            match table.storage() {
                TensorStorage::F32(data) => {
                    result.extend_from_slice(&data[id * hidden..(id + 1) * hidden]);
                }
                TensorStorage::Quantized(raw) => {
                    // Dequantize just the requested row.
                    let dtype = table.dtype();
                    let row_bytes = hidden / dtype.block_size() * dtype.block_byte_size();
                    let row = Tensor::from_quantized(
                        vec![1, hidden],
                        dtype,
                        raw[id * row_bytes..(id + 1) * row_bytes].to_vec(),
                    );
                    result.extend_from_slice(row.to_f32().as_f32());
                }
            }
        }
        Tensor::new(vec![ids.len(), hidden], result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::quant::quantize_q8_0;

    fn assert_close(a: &[f32], b: &[f32], tol: f32, msg: &str) {
        assert_eq!(a.len(), b.len(), "{}: length mismatch {} vs {}", msg, a.len(), b.len());
        for (i, (&x, &y)) in a.iter().zip(b.iter()).enumerate() {
            assert!(
                (x - y).abs() < tol,
                "{}: index {} differs: {} vs {} (diff={})",
                msg,
                i,
                x,
                y,
                (x - y).abs()
            );
        }
    }

    fn pseudo_random(n: usize, seed: u32) -> Vec<f32> {
        let mut s = seed;
        (0..n)
            .map(|_| {
                s = s.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((s >> 8) as f32 / (1u32 << 24) as f32) - 0.5
            })
            .collect()
    }

    #[test]
    fn test_matmul_basic() {
        let b = CpuBackend::new();
        let a = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let bm = Tensor::new(vec![3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let r = b.matmul(&a, &bm);
        assert_eq!(r.shape(), &[2, 2]);
        assert_close(r.as_f32(), &[58.0, 64.0, 139.0, 154.0], 1e-5, "matmul");
    }

    #[test]
    fn test_matmul_transpose_equals_matmul() {
        let b = CpuBackend::new();
        let a = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        // bt is the transpose of the matmul test's b
        let bt = Tensor::new(vec![2, 3], vec![7.0, 9.0, 11.0, 8.0, 10.0, 12.0]);
        let r = b.matmul_transpose(&a, &bt);
        assert_close(r.as_f32(), &[58.0, 64.0, 139.0, 154.0], 1e-5, "matmul_transpose");
    }

    #[test]
    fn test_threaded_matmul_matches_single_thread() {
        let (m, k, n) = (2, 256, 300);
        let a = Tensor::new(vec![m, k], pseudo_random(m * k, 1));
        let w = Tensor::new(vec![n, k], pseudo_random(n * k, 2));
        let single = CpuBackend::new().matmul_transpose(&a, &w);
        let multi = CpuBackend::with_threads(4).matmul_transpose(&a, &w);
        assert_close(single.as_f32(), multi.as_f32(), 1e-6, "threaded");
    }

    #[test]
    fn test_quantized_matmul_q8_0_vs_dequant() {
        let (k, n) = (64, 3);
        let w_f32 = pseudo_random(n * k, 3);
        let w = Tensor::from_quantized(vec![n, k], TensorDtype::Q8_0, quantize_q8_0(&w_f32));
        let x = Tensor::new(vec![1, k], pseudo_random(k, 4));
        let b = CpuBackend::new();
        let fused = b.quantized_matmul(&w, &x);
        let reference = b.matmul_transpose(&x, &w.to_f32());
        assert_close(fused.as_f32(), reference.as_f32(), 1e-4, "q8_0");
    }

    #[test]
    fn test_quantized_matmul_q4_0_vs_dequant() {
        let mut raw = Vec::new();
        for block in 0..4u8 {
            raw.extend_from_slice(&crate::gguf::quant::f32_to_f16(0.25).to_le_bytes());
            for j in 0..16u8 {
                raw.push(((j + block) & 0x0F) | (((15 - j) & 0x0F) << 4));
            }
        }
        let w = Tensor::from_quantized(vec![2, 64], TensorDtype::Q4_0, raw);
        let x = Tensor::new(vec![2, 64], pseudo_random(128, 5));
        let b = CpuBackend::with_threads(2);
        let fused = b.quantized_matmul(&w, &x);
        let reference = b.matmul_transpose(&x, &w.to_f32());
        assert_eq!(fused.shape(), &[2, 2]);
        assert_close(fused.as_f32(), reference.as_f32(), 1e-4, "q4_0");
    }

    #[test]
    fn test_rms_norm() {
        let b = CpuBackend::new();
        let t = Tensor::new(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]);
        let w = Tensor::new(vec![4], vec![1.0, 1.0, 1.0, 2.0]);
        let r = b.rms_norm(&t, &w, 0.0);
        let rms = (30.0f32 / 4.0).sqrt();
        assert_close(r.as_f32(), &[1.0 / rms, 2.0 / rms, 3.0 / rms, 8.0 / rms], 1e-5, "rms");
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let b = CpuBackend::new();
        let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 1000.0, 1000.0, f32::NEG_INFINITY]);
        let r = b.softmax(&t);
        let d = r.as_f32();
        assert!((d[0] + d[1] + d[2] - 1.0).abs() < 1e-6);
        assert_close(&d[3..], &[0.5, 0.5, 0.0], 1e-6, "stable softmax");
    }

    #[test]
    fn test_softmax_fully_masked_row() {
        let b = CpuBackend::new();
        let t = Tensor::new(vec![1, 2], vec![f32::NEG_INFINITY; 2]);
        assert_eq!(b.softmax(&t).as_f32(), &[0.0, 0.0]);
    }

    #[test]
    fn test_swiglu_and_add_and_scale() {
        let b = CpuBackend::new();
        let g = Tensor::new(vec![2], vec![0.0, 1.0]);
        let u = Tensor::new(vec![2], vec![5.0, 2.0]);
        let silu1 = 1.0 / (1.0 + (-1.0f32).exp());
        assert_close(b.swiglu(&g, &u).as_f32(), &[0.0, 2.0 * silu1], 1e-6, "swiglu");
        assert_eq!(b.add(&g, &u).as_f32(), &[5.0, 3.0]);
        assert_eq!(b.scale(&u, 0.5).as_f32(), &[2.5, 1.0]);
    }

    #[test]
    fn test_rope_zero_position_is_identity() {
        let b = CpuBackend::new();
        let q = Tensor::new(vec![1, 4], vec![1.0, 2.0, 3.0, 4.0]);
        let k = Tensor::new(vec![1, 4], vec![5.0, 6.0, 7.0, 8.0]);
        let (qr, kr) = b.rope(&q, &k, 0, 10000.0, 4, 4);
        assert_close(qr.as_f32(), q.as_f32(), 1e-6, "q");
        assert_close(kr.as_f32(), k.as_f32(), 1e-6, "k");
    }

    #[test]
    fn test_rope_rotates_first_pair_by_position() {
        let b = CpuBackend::new();
        let q = Tensor::new(vec![1, 2], vec![1.0, 0.0]);
        let (qr, _) = b.rope(&q, &q, 1, 10000.0, 2, 2);
        // freq_0 = 1, so position 1 rotates by 1 radian
        assert_close(qr.as_f32(), &[1.0f32.cos(), 1.0f32.sin()], 1e-6, "rope");
    }

    #[test]
    fn test_rope_preserves_norm() {
        let b = CpuBackend::new();
        let data = pseudo_random(16, 6);
        let q = Tensor::new(vec![2, 8], data.clone());
        let (qr, _) = b.rope(&q, &q, 7, 10000.0, 4, 4);
        let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>();
        assert!((norm(&data) - norm(qr.as_f32())).abs() < 1e-4);
    }

    #[test]
    fn test_embedding_lookup_f32_and_quantized() {
        let b = CpuBackend::new();
        let table: Vec<f32> = (0..96).map(|i| i as f32 / 96.0).collect();
        let f = Tensor::new(vec![3, 32], table.clone());
        let q = Tensor::from_quantized(vec![3, 32], TensorDtype::Q8_0, quantize_q8_0(&table));
        let rf = b.embedding_lookup(&f, &[2, 0]);
        let rq = b.embedding_lookup(&q, &[2, 0]);
        assert_eq!(rf.shape(), &[2, 32]);
        assert_eq!(rf.row(0), &table[64..96]);
        assert_close(rq.as_f32(), rf.as_f32(), 0.01, "quantized embedding");
    }
}
