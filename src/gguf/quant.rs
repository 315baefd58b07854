// GGML tensor type table and the Q8_0 / Q4_0 block formats.

use crate::error::InferenceError;

// ---------------------------------------------------------------------------
// GGML tensor type IDs (matches ggml_type enum in ggml.h)
// ---------------------------------------------------------------------------

/// Tensor data types that may appear in a GGUF file.
///
/// Every id is recognised so the tensor table of any file can be parsed and
/// bounds-checked. Only F32, F16, Q4_0 and Q8_0 can be loaded for compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GgufTensorType {
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q4_1 = 3,
    Q5_0 = 6,
    Q5_1 = 7,
    Q8_0 = 8,
    Q8_1 = 9,
    Q2K = 10,
    Q3K = 11,
    Q4K = 12,
    Q5K = 13,
    Q6K = 14,
    Q8K = 15,
    I8 = 24,
    I16 = 25,
    I32 = 26,
    I64 = 27,
    F64 = 28,
    BF16 = 30,
}

impl GgufTensorType {
    /// Convert a raw u32 from the GGUF file into a `GgufTensorType`.
    pub fn from_u32(v: u32) -> Result<Self, InferenceError> {
        Ok(match v {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::Q4_0,
            3 => Self::Q4_1,
            6 => Self::Q5_0,
            7 => Self::Q5_1,
            8 => Self::Q8_0,
            9 => Self::Q8_1,
            10 => Self::Q2K,
            11 => Self::Q3K,
            12 => Self::Q4K,
            13 => Self::Q5K,
            14 => Self::Q6K,
            15 => Self::Q8K,
            24 => Self::I8,
            25 => Self::I16,
            26 => Self::I32,
            27 => Self::I64,
            28 => Self::F64,
            30 => Self::BF16,
            _ => return Err(InferenceError::UnknownTensorType(v)),
        })
    }

    /// Number of elements per quantization block (1 for plain types).
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 | Self::BF16 | Self::F64 => 1,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 | Self::Q8_1 => 32,
            Self::Q2K | Self::Q3K | Self::Q4K | Self::Q5K | Self::Q6K | Self::Q8K => QK_K,
        }
    }

    /// Size in bytes of one block (of one element for plain types).
    pub fn type_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::F64 => 8,
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
            Self::I64 => 8,
            Self::Q4_0 => std::mem::size_of::<BlockQ4_0>(),
            Self::Q4_1 => 20,
            Self::Q5_0 => 22,
            Self::Q5_1 => 24,
            Self::Q8_0 => std::mem::size_of::<BlockQ8_0>(),
            Self::Q8_1 => 36,
            Self::Q2K => 84,
            Self::Q3K => 110,
            Self::Q4K => 144,
            Self::Q5K => 176,
            Self::Q6K => 210,
            Self::Q8K => 292,
        }
    }

    /// Whether tensors of this type can be loaded for compute.
    pub fn is_loadable(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::Q4_0 | Self::Q8_0)
    }

    /// Human-readable name for the tensor type.
    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::Q4_0 => "Q4_0",
            Self::Q4_1 => "Q4_1",
            Self::Q5_0 => "Q5_0",
            Self::Q5_1 => "Q5_1",
            Self::Q8_0 => "Q8_0",
            Self::Q8_1 => "Q8_1",
            Self::Q2K => "Q2_K",
            Self::Q3K => "Q3_K",
            Self::Q4K => "Q4_K",
            Self::Q5K => "Q5_K",
            Self::Q6K => "Q6_K",
            Self::Q8K => "Q8_K",
            Self::I8 => "I8",
            Self::I16 => "I16",
            Self::I32 => "I32",
            Self::I64 => "I64",
            Self::F64 => "F64",
            Self::BF16 => "BF16",
        }
    }
}

impl std::fmt::Display for GgufTensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of elements per K-quant super-block.
pub const QK_K: usize = 256;

// ---------------------------------------------------------------------------
// Q8_0: 34 bytes per block of 32 values
// ---------------------------------------------------------------------------

/// Q8_0 block: 8-bit values with a single f16 scale.
///
/// Layout: `d: f16 | qs: [i8; 32]`. Dequantization: `y[i] = d * qs[i]`.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ8_0 {
    pub d: u16,
    pub qs: [i8; 32],
}

const _: () = assert!(std::mem::size_of::<BlockQ8_0>() == 34);

/// Number of elements per Q8_0 block.
pub const QK8_0: usize = 32;

// ---------------------------------------------------------------------------
// Q4_0: 18 bytes per block of 32 values
// ---------------------------------------------------------------------------

/// Q4_0 block: 4-bit values with a single f16 scale.
///
/// Byte `j` of `qs` holds element `j` in its low nibble and element `j + 16`
/// in its high nibble; each nibble is offset by 8.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct BlockQ4_0 {
    pub d: u16,
    pub qs: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<BlockQ4_0>() == 18);

/// Number of elements per Q4_0 block.
pub const QK4_0: usize = 32;

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Convert IEEE 754 half-precision bits to f32.
pub fn f16_to_f32(bits: u16) -> f32 {
    half::f16::from_bits(bits).to_f32()
}

/// Convert an f32 to IEEE 754 half-precision bits.
pub fn f32_to_f16(value: f32) -> u16 {
    half::f16::from_f32(value).to_bits()
}

/// Dequantize Q8_0 blocks. Output length is `blocks.len() * 32`.
pub fn dequantize_q8_0(blocks: &[BlockQ8_0]) -> Vec<f32> {
    let mut output = Vec::with_capacity(blocks.len() * QK8_0);
    for block in blocks {
        let d = f16_to_f32(block.d);
        let qs = block.qs;
        output.extend(qs.iter().map(|&q| d * q as f32));
    }
    output
}

/// Dequantize Q4_0 blocks. Output length is `blocks.len() * 32`.
pub fn dequantize_q4_0(blocks: &[BlockQ4_0]) -> Vec<f32> {
    let mut output = Vec::with_capacity(blocks.len() * QK4_0);
    for block in blocks {
        let d = f16_to_f32(block.d);
        let qs = block.qs;
        let mut tmp = [0.0f32; QK4_0];
        for j in 0..QK4_0 / 2 {
            tmp[j] = ((qs[j] & 0x0F) as i32 - 8) as f32 * d;
            tmp[j + QK4_0 / 2] = ((qs[j] >> 4) as i32 - 8) as f32 * d;
        }
        output.extend_from_slice(&tmp);
    }
    output
}

/// Quantize f32 values into raw Q8_0 bytes (llama.cpp reference rounding).
///
/// The final block is zero-padded when `values.len()` is not a multiple of 32.
pub fn quantize_q8_0(values: &[f32]) -> Vec<u8> {
    let n_blocks = (values.len() + QK8_0 - 1) / QK8_0;
    let mut out = Vec::with_capacity(n_blocks * std::mem::size_of::<BlockQ8_0>());
    for chunk in values.chunks(QK8_0) {
        let amax = chunk.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        out.extend_from_slice(&f32_to_f16(d).to_le_bytes());
        for i in 0..QK8_0 {
            let x = chunk.get(i).copied().unwrap_or(0.0);
            out.push((x * id).round() as i8 as u8);
        }
    }
    out
}

/// Bytes needed to store `n_elements` values of the given type.
pub fn tensor_byte_size(dtype: GgufTensorType, n_elements: u64) -> u64 {
    let bs = dtype.block_size() as u64;
    let ts = dtype.type_size() as u64;
    ((n_elements + bs - 1) / bs) * ts
}

// ---------------------------------------------------------------------------
// Reinterpreting raw bytes as block slices
// ---------------------------------------------------------------------------

/// Interpret a byte slice as `BlockQ8_0` blocks.
pub fn bytes_as_q8_0_blocks(data: &[u8]) -> Result<&[BlockQ8_0], InferenceError> {
    let n_blocks = checked_block_count(data, std::mem::size_of::<BlockQ8_0>(), "Q8_0")?;
    // SAFETY: BlockQ8_0 is repr(C, packed) (alignment 1, no padding) and made
    // only of integer fields valid for any bit pattern. The length check above
    // guarantees the slice covers exactly `n_blocks` blocks.
    Ok(unsafe { std::slice::from_raw_parts(data.as_ptr() as *const BlockQ8_0, n_blocks) })
}

/// Interpret a byte slice as `BlockQ4_0` blocks.
pub fn bytes_as_q4_0_blocks(data: &[u8]) -> Result<&[BlockQ4_0], InferenceError> {
    let n_blocks = checked_block_count(data, std::mem::size_of::<BlockQ4_0>(), "Q4_0")?;
    // SAFETY: same layout argument as bytes_as_q8_0_blocks.
    Ok(unsafe { std::slice::from_raw_parts(data.as_ptr() as *const BlockQ4_0, n_blocks) })
}

fn checked_block_count(data: &[u8], block_size: usize, name: &str) -> Result<usize, InferenceError> {
    if data.len() % block_size != 0 {
        return Err(InferenceError::GgufParse(format!(
            "{} data length {} is not a multiple of block size {}",
            name,
            data.len(),
            block_size
        )));
    }
    Ok(data.len() / block_size)
}
