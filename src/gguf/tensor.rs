// Typed views of GGUF tensor data and conversion into compute tensors.

use super::quant::{self, bytes_as_q4_0_blocks, bytes_as_q8_0_blocks, GgufTensorType};
use super::GgufFile;
use crate::error::InferenceError;
use crate::tensor::{Tensor, TensorDtype};

/// A named, typed view into memory-mapped tensor data.
#[derive(Debug)]
pub struct GgufTensor<'a> {
    pub name: String,
    /// GGUF dims, innermost first.
    pub dims: Vec<u64>,
    pub dtype: GgufTensorType,
    /// Raw bytes, zero-copy from the mapping.
    pub data: &'a [u8],
}

impl<'a> GgufTensor<'a> {
    pub fn n_elements(&self) -> u64 {
        self.dims.iter().product::<u64>().max(1)
    }

    /// Shape in row-major order (outermost first).
    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().rev().map(|&d| d as usize).collect()
    }

    /// Dequantize to a flat `Vec<f32>`.
    pub fn to_f32(&self) -> Result<Vec<f32>, InferenceError> {
        let n = self.n_elements() as usize;
        let mut values = match self.dtype {
            GgufTensorType::F32 => self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            GgufTensorType::F16 => self
                .data
                .chunks_exact(2)
                .map(|c| quant::f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                .collect(),
            GgufTensorType::Q8_0 => quant::dequantize_q8_0(bytes_as_q8_0_blocks(self.data)?),
            GgufTensorType::Q4_0 => quant::dequantize_q4_0(bytes_as_q4_0_blocks(self.data)?),
            other => {
                return Err(InferenceError::GgufParse(format!(
                    "tensor '{}': type {} is not supported",
                    self.name, other
                )))
            }
        };
        // Quantized rows may be padded up to a whole block.
        values.truncate(n);
        Ok(values)
    }

    /// Convert into a compute [`Tensor`].
    ///
    /// F32 and F16 become F32. Q8_0 and Q4_0 stay quantized so the backend can
    /// run fused dequantizing matmuls over them.
    pub fn to_tensor(&self) -> Result<Tensor, InferenceError> {
        let shape = self.shape();
        match self.dtype {
            GgufTensorType::F32 | GgufTensorType::F16 => Ok(Tensor::new(shape, self.to_f32()?)),
            GgufTensorType::Q8_0 | GgufTensorType::Q4_0 => {
                let dtype = if self.dtype == GgufTensorType::Q8_0 {
                    TensorDtype::Q8_0
                } else {
                    TensorDtype::Q4_0
                };
                let inner = shape.last().copied().unwrap_or(1);
                if inner % dtype.block_size() != 0 {
                    return Err(InferenceError::GgufParse(format!(
                        "tensor '{}': row length {} is not a multiple of the {} block size",
                        self.name, inner, self.dtype
                    )));
                }
                Ok(Tensor::from_quantized(shape, dtype, self.data.to_vec()))
            }
            other => Err(InferenceError::GgufParse(format!(
                "tensor '{}': type {} is not supported",
                self.name, other
            ))),
        }
    }
}

/// Load a tensor view by index.
pub fn load_tensor(file: &GgufFile, index: usize) -> Result<GgufTensor<'_>, InferenceError> {
    let info = file.tensor_infos().get(index).ok_or_else(|| {
        InferenceError::TensorNotFound(format!("tensor index {} out of range", index))
    })?;
    let data = file.tensor_data(index)?;
    Ok(GgufTensor {
        name: info.name.clone(),
        dims: info.dims.clone(),
        dtype: info.dtype,
        data,
    })
}

/// Load a tensor view by name.
pub fn load_tensor_by_name<'a>(
    file: &'a GgufFile,
    name: &str,
) -> Result<GgufTensor<'a>, InferenceError> {
    let (index, _) = file
        .find_tensor(name)
        .ok_or_else(|| InferenceError::TensorNotFound(name.to_string()))?;
    load_tensor(file, index)
}
