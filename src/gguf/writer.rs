// GGUF v3 writer: typed metadata, tensor table, aligned data section.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{debug, info};

use super::quant::{self, GgufTensorType};
use super::{align_offset, GgufValue, GgufValueType, GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC};
use crate::error::InferenceError;

const GGUF_WRITE_VERSION: u32 = 3;

struct PendingTensor {
    name: String,
    /// GGUF dims, innermost first.
    dims: Vec<u64>,
    dtype: GgufTensorType,
    data: Vec<u8>,
}

/// Builds a GGUF file in memory and writes it out.
///
/// Shapes passed to the `add_*_tensor` methods are row-major (outermost
/// first), matching [`Tensor`](crate::tensor::Tensor); they are reversed into
/// GGUF's innermost-first order on write.
pub struct GgufWriter {
    metadata: Vec<(String, GgufValue)>,
    tensors: Vec<PendingTensor>,
    alignment: u64,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self {
            metadata: Vec::new(),
            tensors: Vec::new(),
            alignment: GGUF_DEFAULT_ALIGNMENT,
        }
    }

    /// Set the data alignment, recorded as `general.alignment`.
    pub fn with_alignment(mut self, alignment: u32) -> Result<Self, InferenceError> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(InferenceError::GgufParse(format!(
                "alignment {} is not a power of 2",
                alignment
            )));
        }
        self.alignment = alignment as u64;
        self.set("general.alignment", GgufValue::U32(alignment));
        Ok(self)
    }

    /// Set a metadata key, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: GgufValue) -> &mut Self {
        let key = key.into();
        match self.metadata.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.metadata.push((key, value)),
        }
        self
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: &str) -> &mut Self {
        self.set(key, GgufValue::String(value.to_string()))
    }

    pub fn set_u32(&mut self, key: impl Into<String>, value: u32) -> &mut Self {
        self.set(key, GgufValue::U32(value))
    }

    pub fn set_f32(&mut self, key: impl Into<String>, value: f32) -> &mut Self {
        self.set(key, GgufValue::F32(value))
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.set(key, GgufValue::Bool(value))
    }

    pub fn set_str_array<S: AsRef<str>>(&mut self, key: impl Into<String>, values: &[S]) -> &mut Self {
        let values = values
            .iter()
            .map(|s| GgufValue::String(s.as_ref().to_string()))
            .collect();
        self.set(key, GgufValue::Array(values))
    }

    /// Remove a metadata key. Returns whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.metadata.len();
        self.metadata.retain(|(k, _)| k != key);
        self.metadata.len() != before
    }

    /// Remove a tensor. Returns whether it was present.
    pub fn remove_tensor(&mut self, name: &str) -> bool {
        let before = self.tensors.len();
        self.tensors.retain(|t| t.name != name);
        self.tensors.len() != before
    }

    /// Add a tensor from raw bytes already encoded as `dtype`.
    pub fn add_raw_tensor(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        dtype: GgufTensorType,
        data: Vec<u8>,
    ) -> Result<&mut Self, InferenceError> {
        let name = name.into();
        if shape.is_empty() || shape.len() > 4 {
            return Err(InferenceError::GgufParse(format!(
                "tensor '{}' has {} dimensions",
                name,
                shape.len()
            )));
        }
        if self.tensors.iter().any(|t| t.name == name) {
            return Err(InferenceError::GgufParse(format!("duplicate tensor '{}'", name)));
        }
        let inner = shape[shape.len() - 1];
        if inner % dtype.block_size() != 0 {
            return Err(InferenceError::GgufParse(format!(
                "tensor '{}': row length {} is not a multiple of the {} block size",
                name, inner, dtype
            )));
        }
        let n_elements: usize = shape.iter().product();
        let expected = quant::tensor_byte_size(dtype, n_elements as u64);
        if data.len() as u64 != expected {
            return Err(InferenceError::GgufParse(format!(
                "tensor '{}': {} bytes given, {} expected for {} {:?}",
                name,
                data.len(),
                expected,
                dtype,
                shape
            )));
        }
        self.tensors.push(PendingTensor {
            name,
            dims: shape.iter().rev().map(|&d| d as u64).collect(),
            dtype,
            data,
        });
        Ok(self)
    }

    pub fn add_f32_tensor(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        values: &[f32],
    ) -> Result<&mut Self, InferenceError> {
        let data = values.iter().flat_map(|x| x.to_le_bytes()).collect();
        self.add_raw_tensor(name, shape, GgufTensorType::F32, data)
    }

    pub fn add_f16_tensor(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        values: &[f32],
    ) -> Result<&mut Self, InferenceError> {
        let data = values
            .iter()
            .flat_map(|&x| quant::f32_to_f16(x).to_le_bytes())
            .collect();
        self.add_raw_tensor(name, shape, GgufTensorType::F16, data)
    }

    /// Quantize `values` to Q8_0. The last dimension must be a multiple of 32.
    pub fn add_q8_0_tensor(
        &mut self,
        name: impl Into<String>,
        shape: &[usize],
        values: &[f32],
    ) -> Result<&mut Self, InferenceError> {
        self.add_raw_tensor(name, shape, GgufTensorType::Q8_0, quant::quantize_q8_0(values))
    }

    pub fn n_tensors(&self) -> usize {
        self.tensors.len()
    }

    /// Serialize the whole file.
    pub fn to_bytes(&self) -> Result<Vec<u8>, InferenceError> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        buf.extend_from_slice(&GGUF_WRITE_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        buf.extend_from_slice(&(self.metadata.len() as u64).to_le_bytes());

        for (key, value) in &self.metadata {
            write_string(&mut buf, key);
            buf.extend_from_slice(&(value_type(value) as u32).to_le_bytes());
            write_value(&mut buf, key, value)?;
        }

        let mut offset = 0u64;
        let mut offsets = Vec::with_capacity(self.tensors.len());
        for t in &self.tensors {
            offset = align_offset(offset, self.alignment);
            offsets.push(offset);
            write_string(&mut buf, &t.name);
            buf.extend_from_slice(&(t.dims.len() as u32).to_le_bytes());
            for &d in &t.dims {
                buf.extend_from_slice(&d.to_le_bytes());
            }
            buf.extend_from_slice(&(t.dtype as u32).to_le_bytes());
            buf.extend_from_slice(&offset.to_le_bytes());
            offset += t.data.len() as u64;
        }

        let data_start = align_offset(buf.len() as u64, self.alignment) as usize;
        buf.resize(data_start, 0);
        for (t, &off) in self.tensors.iter().zip(&offsets) {
            buf.resize(data_start + off as usize, 0);
            buf.extend_from_slice(&t.data);
            debug!(name = %t.name, dtype = %t.dtype, offset = off, "GGUF tensor written");
        }
        Ok(buf)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), InferenceError> {
        let path = path.as_ref();
        let bytes = self.to_bytes()?;
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&bytes)?;
        out.flush()?;
        info!(
            path = %path.display(),
            n_kv = self.metadata.len(),
            n_tensors = self.tensors.len(),
            size = bytes.len(),
            "Wrote GGUF file"
        );
        Ok(())
    }
}

impl Default for GgufWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn value_type(value: &GgufValue) -> GgufValueType {
    match value {
        GgufValue::U8(_) => GgufValueType::Uint8,
        GgufValue::I8(_) => GgufValueType::Int8,
        GgufValue::U16(_) => GgufValueType::Uint16,
        GgufValue::I16(_) => GgufValueType::Int16,
        GgufValue::U32(_) => GgufValueType::Uint32,
        GgufValue::I32(_) => GgufValueType::Int32,
        GgufValue::U64(_) => GgufValueType::Uint64,
        GgufValue::I64(_) => GgufValueType::Int64,
        GgufValue::F32(_) => GgufValueType::Float32,
        GgufValue::F64(_) => GgufValueType::Float64,
        GgufValue::Bool(_) => GgufValueType::Bool,
        GgufValue::String(_) => GgufValueType::String,
        GgufValue::Array(_) => GgufValueType::Array,
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn write_value(buf: &mut Vec<u8>, key: &str, value: &GgufValue) -> Result<(), InferenceError> {
    match value {
        GgufValue::U8(v) => buf.push(*v),
        GgufValue::I8(v) => buf.push(*v as u8),
        GgufValue::U16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::I16(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::U32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::I32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::U64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::I64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::F32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::F64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Bool(v) => buf.push(*v as u8),
        GgufValue::String(s) => write_string(buf, s),
        GgufValue::Array(items) => {
            // An empty array still needs an element type; u8 is as good as any.
            let elem_type = items.first().map(value_type).unwrap_or(GgufValueType::Uint8);
            if elem_type == GgufValueType::Array {
                return Err(InferenceError::GgufParse(format!(
                    "key '{}': nested arrays are not supported",
                    key
                )));
            }
            if items.iter().any(|v| value_type(v) != elem_type) {
                return Err(InferenceError::GgufParse(format!(
                    "key '{}': array elements must share one type",
                    key
                )));
            }
            buf.extend_from_slice(&(elem_type as u32).to_le_bytes());
            buf.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                write_value(buf, key, item)?;
            }
        }
    }
    Ok(())
}
