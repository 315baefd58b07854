// GGUF v2/v3 reader: header, typed metadata, tensor table, zero-copy data.

pub mod quant;
pub mod tensor;
pub mod writer;

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use tracing::{debug, info};

use crate::error::InferenceError;
use quant::GgufTensorType;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// GGUF magic number: ASCII "GGUF" as a little-endian u32.
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Oldest and newest GGUF versions we read. v1 used 32-bit counts.
const GGUF_MIN_VERSION: u32 = 2;
const GGUF_MAX_VERSION: u32 = 3;

/// Default alignment for the data section (bytes).
pub(crate) const GGUF_DEFAULT_ALIGNMENT: u64 = 32;

const MAX_TENSORS: u64 = 1_000_000;
const MAX_KV: u64 = 10_000_000;
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;
const MAX_ARRAY_LEN: u64 = 100_000_000;
const MAX_DIMS: u32 = 4;

// ---------------------------------------------------------------------------
// GgufValue
// ---------------------------------------------------------------------------

/// A typed value from a GGUF key-value pair.
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
}

impl GgufValue {
    /// Human-readable type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::U8(_) => "U8",
            Self::I8(_) => "I8",
            Self::U16(_) => "U16",
            Self::I16(_) => "I16",
            Self::U32(_) => "U32",
            Self::I32(_) => "I32",
            Self::U64(_) => "U64",
            Self::I64(_) => "I64",
            Self::F32(_) => "F32",
            Self::F64(_) => "F64",
            Self::Bool(_) => "Bool",
            Self::String(_) => "String",
            Self::Array(_) => "Array",
        }
    }

    /// Interpret any integer variant as an i64.
    ///
    /// Writers disagree on integer widths for ids and counts (u32 vs i32 vs
    /// u64), so lookups accept all of them.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::U8(v) => Some(v as i64),
            Self::I8(v) => Some(v as i64),
            Self::U16(v) => Some(v as i64),
            Self::I16(v) => Some(v as i64),
            Self::U32(v) => Some(v as i64),
            Self::I32(v) => Some(v as i64),
            Self::U64(v) => i64::try_from(v).ok(),
            Self::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Interpret a float variant as an f32.
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Self::F32(v) => Some(v),
            Self::F64(v) => Some(v as f32),
            _ => None,
        }
    }
}

/// GGUF KV value type IDs (gguf_type in gguf.h).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GgufValueType {
    Uint8 = 0,
    Int8 = 1,
    Uint16 = 2,
    Int16 = 3,
    Uint32 = 4,
    Int32 = 5,
    Float32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    Uint64 = 10,
    Int64 = 11,
    Float64 = 12,
}

impl GgufValueType {
    fn from_u32(v: u32) -> Result<Self, InferenceError> {
        Ok(match v {
            0 => Self::Uint8,
            1 => Self::Int8,
            2 => Self::Uint16,
            3 => Self::Int16,
            4 => Self::Uint32,
            5 => Self::Int32,
            6 => Self::Float32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::Uint64,
            11 => Self::Int64,
            12 => Self::Float64,
            _ => {
                return Err(InferenceError::GgufParse(format!(
                    "unknown GGUF value type: {}",
                    v
                )))
            }
        })
    }
}

// ---------------------------------------------------------------------------
// TensorInfo
// ---------------------------------------------------------------------------

/// One entry of the tensor table.
///
/// `dims[0]` is the innermost (contiguous) dimension, as in ggml. `offset` is
/// relative to the start of the data section.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    pub dtype: GgufTensorType,
    pub offset: u64,
}

impl TensorInfo {
    /// Total number of elements in the tensor.
    pub fn n_elements(&self) -> u64 {
        self.dims.iter().product::<u64>().max(1)
    }

    /// Byte size of this tensor's data.
    pub fn byte_size(&self) -> u64 {
        quant::tensor_byte_size(self.dtype, self.n_elements())
    }

    /// Shape in row-major order (outermost first), e.g. `[rows, cols]`.
    pub fn row_major_shape(&self) -> Vec<usize> {
        self.dims.iter().rev().map(|&d| d as usize).collect()
    }
}

// ---------------------------------------------------------------------------
// GgufFile
// ---------------------------------------------------------------------------

/// A parsed, memory-mapped GGUF file.
pub struct GgufFile {
    version: u32,
    metadata: HashMap<String, GgufValue>,
    tensor_infos: Vec<TensorInfo>,
    /// Absolute file offset of the tensor data section.
    data_offset: u64,
    alignment: u64,
    mmap: memmap2::Mmap,
}

impl GgufFile {
    /// Open and parse a GGUF file.
    ///
    /// The whole file is mapped once; the header is parsed straight from the
    /// mapping and tensor data is later served as sub-slices of it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening GGUF file");

        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and the file is not modified by us
        // while mapped. Concurrent external truncation is not guarded against
        // (the same contract ggml relies on).
        let mmap = unsafe { memmap2::MmapOptions::new().map(&file)? };

        let mut r = ByteReader::new(&mmap);

        let magic = r.u32()?;
        if magic != GGUF_MAGIC {
            return Err(InferenceError::InvalidMagic(magic));
        }

        let version = r.u32()?;
        if !(GGUF_MIN_VERSION..=GGUF_MAX_VERSION).contains(&version) {
            return Err(InferenceError::UnsupportedVersion(version));
        }

        // Counts are int64 on disk; anything with the sign bit set is corrupt.
        let n_tensors = r.u64()?;
        let n_kv = r.u64()?;
        if n_tensors > MAX_TENSORS {
            return Err(InferenceError::GgufParse(format!(
                "n_tensors {} exceeds maximum {}",
                n_tensors, MAX_TENSORS
            )));
        }
        if n_kv > MAX_KV {
            return Err(InferenceError::GgufParse(format!(
                "n_kv {} exceeds maximum {}",
                n_kv, MAX_KV
            )));
        }
        debug!(version, n_tensors, n_kv, "GGUF header");

        let mut metadata = HashMap::with_capacity(n_kv as usize);
        for _ in 0..n_kv {
            let key = r.string()?;
            let vtype = GgufValueType::from_u32(r.u32()?)?;
            let value = r.value(vtype)?;
            debug!(key = %key, ty = value.type_name(), "GGUF kv");
            metadata.insert(key, value);
        }

        let alignment = match metadata.get("general.alignment").and_then(GgufValue::as_i64) {
            Some(a) => {
                if a <= 0 || (a & (a - 1)) != 0 {
                    return Err(InferenceError::GgufParse(format!(
                        "alignment {} is not a power of 2",
                        a
                    )));
                }
                a as u64
            }
            None => GGUF_DEFAULT_ALIGNMENT,
        };

        let mut tensor_infos = Vec::with_capacity(n_tensors as usize);
        for _ in 0..n_tensors {
            let name = r.string()?;
            let n_dims = r.u32()?;
            if n_dims == 0 || n_dims > MAX_DIMS {
                return Err(InferenceError::GgufParse(format!(
                    "tensor '{}' has {} dimensions",
                    name, n_dims
                )));
            }
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(r.u64()?);
            }
            let dtype = GgufTensorType::from_u32(r.u32()?)?;
            let offset = r.u64()?;
            if offset % alignment != 0 {
                return Err(InferenceError::GgufParse(format!(
                    "tensor '{}' offset {} is not aligned to {}",
                    name, offset, alignment
                )));
            }
            tensor_infos.push(TensorInfo {
                name,
                dims,
                dtype,
                offset,
            });
        }

        let data_offset = align_offset(r.position() as u64, alignment);

        info!(
            version,
            n_tensors,
            n_kv,
            data_offset,
            file_size = mmap.len(),
            "Parsed GGUF file"
        );

        Ok(GgufFile {
            version,
            metadata,
            tensor_infos,
            data_offset,
            alignment,
            mmap,
        })
    }

    // -- Metadata getters ---------------------------------------------------

    /// GGUF format version of the file.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Get a raw metadata value by key.
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.metadata.get(key) {
            Some(GgufValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Any integer value that fits in a u32.
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key)
            .and_then(GgufValue::as_i64)
            .and_then(|v| u32::try_from(v).ok())
    }

    pub fn get_f32(&self, key: &str) -> Option<f32> {
        self.get(key).and_then(GgufValue::as_f32)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.metadata.get(key) {
            Some(GgufValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get a string array. `None` if missing or not all elements are strings.
    pub fn get_str_array(&self, key: &str) -> Option<Vec<&str>> {
        match self.metadata.get(key) {
            Some(GgufValue::Array(arr)) => arr
                .iter()
                .map(|item| match item {
                    GgufValue::String(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    /// Get a float array. `None` if missing or not all elements are floats.
    pub fn get_f32_array(&self, key: &str) -> Option<Vec<f32>> {
        match self.metadata.get(key) {
            Some(GgufValue::Array(arr)) => arr.iter().map(GgufValue::as_f32).collect(),
            _ => None,
        }
    }

    /// Get an integer array as i64. `None` if missing or not all integers.
    pub fn get_int_array(&self, key: &str) -> Option<Vec<i64>> {
        match self.metadata.get(key) {
            Some(GgufValue::Array(arr)) => arr.iter().map(GgufValue::as_i64).collect(),
            _ => None,
        }
    }

    pub fn require_str(&self, key: &str) -> Result<&str, InferenceError> {
        match self.metadata.get(key) {
            Some(GgufValue::String(s)) => Ok(s.as_str()),
            Some(other) => Err(type_mismatch(key, "String", other)),
            None => Err(InferenceError::MissingKey(key.to_string())),
        }
    }

    pub fn require_u32(&self, key: &str) -> Result<u32, InferenceError> {
        match self.metadata.get(key) {
            Some(v) => v
                .as_i64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| type_mismatch(key, "U32", v)),
            None => Err(InferenceError::MissingKey(key.to_string())),
        }
    }

    // -- Tensor table -------------------------------------------------------

    pub fn tensor_infos(&self) -> &[TensorInfo] {
        &self.tensor_infos
    }

    pub fn n_tensors(&self) -> usize {
        self.tensor_infos.len()
    }

    pub fn n_metadata(&self) -> usize {
        self.metadata.len()
    }

    /// Find a tensor by name, returning its index and info.
    pub fn find_tensor(&self, name: &str) -> Option<(usize, &TensorInfo)> {
        self.tensor_infos
            .iter()
            .enumerate()
            .find(|(_, t)| t.name == name)
    }

    /// Absolute file offset of the tensor data section.
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    // -- Tensor data --------------------------------------------------------

    /// Raw bytes for a tensor by index (zero-copy from the mapping).
    pub fn tensor_data(&self, index: usize) -> Result<&[u8], InferenceError> {
        let info = self.tensor_infos.get(index).ok_or_else(|| {
            InferenceError::TensorNotFound(format!("tensor index {} out of range", index))
        })?;
        let start = self.data_offset.checked_add(info.offset);
        let end = start.and_then(|s| s.checked_add(info.byte_size()));
        match (start, end) {
            (Some(start), Some(end)) if end <= self.mmap.len() as u64 => {
                Ok(&self.mmap[start as usize..end as usize])
            }
            _ => Err(InferenceError::GgufParse(format!(
                "tensor '{}' data extends beyond file (offset={}, size={}, file_len={})",
                info.name,
                info.offset,
                info.byte_size(),
                self.mmap.len()
            ))),
        }
    }
}

impl std::fmt::Debug for GgufFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GgufFile")
            .field("version", &self.version)
            .field("n_metadata", &self.metadata.len())
            .field("n_tensors", &self.tensor_infos.len())
            .field("data_offset", &self.data_offset)
            .field("alignment", &self.alignment)
            .field("file_size", &self.mmap.len())
            .finish()
    }
}

fn type_mismatch(key: &str, expected: &str, actual: &GgufValue) -> InferenceError {
    InferenceError::TypeMismatch {
        key: key.to_string(),
        expected: expected.to_string(),
        actual: actual.type_name().to_string(),
    }
}

/// Round `offset` up to the next multiple of `alignment`.
pub(crate) fn align_offset(offset: u64, alignment: u64) -> u64 {
    let remainder = offset % alignment;
    if remainder == 0 {
        offset
    } else {
        offset + (alignment - remainder)
    }
}

// ---------------------------------------------------------------------------
// ByteReader: bounds-checked little-endian cursor over the mapping
// ---------------------------------------------------------------------------

struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], InferenceError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                InferenceError::GgufParse(format!(
                    "unexpected end of file at offset {} (need {} bytes, file is {})",
                    self.pos,
                    n,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], InferenceError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, InferenceError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, InferenceError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, InferenceError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, InferenceError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// GGUF string: u64 length prefix + UTF-8 bytes, no terminator.
    fn string(&mut self) -> Result<String, InferenceError> {
        let len = self.u64()?;
        if len > MAX_STRING_LEN {
            return Err(InferenceError::GgufParse(format!(
                "string length {} is suspiciously large",
                len
            )));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| InferenceError::GgufParse(format!("invalid UTF-8: {}", e)))
    }

    fn value(&mut self, vtype: GgufValueType) -> Result<GgufValue, InferenceError> {
        Ok(match vtype {
            GgufValueType::Uint8 => GgufValue::U8(self.u8()?),
            GgufValueType::Int8 => GgufValue::I8(self.u8()? as i8),
            GgufValueType::Uint16 => GgufValue::U16(self.u16()?),
            GgufValueType::Int16 => GgufValue::I16(self.u16()? as i16),
            GgufValueType::Uint32 => GgufValue::U32(self.u32()?),
            GgufValueType::Int32 => GgufValue::I32(self.u32()? as i32),
            GgufValueType::Float32 => GgufValue::F32(f32::from_bits(self.u32()?)),
            GgufValueType::Bool => GgufValue::Bool(self.u8()? != 0),
            GgufValueType::String => GgufValue::String(self.string()?),
            GgufValueType::Uint64 => GgufValue::U64(self.u64()?),
            GgufValueType::Int64 => GgufValue::I64(self.u64()? as i64),
            GgufValueType::Float64 => GgufValue::F64(f64::from_bits(self.u64()?)),
            GgufValueType::Array => {
                let elem_type = GgufValueType::from_u32(self.u32()?)?;
                if elem_type == GgufValueType::Array {
                    return Err(InferenceError::GgufParse(
                        "nested arrays are not supported".to_string(),
                    ));
                }
                let count = self.u64()?;
                if count > MAX_ARRAY_LEN {
                    return Err(InferenceError::GgufParse(format!(
                        "array with {} elements is suspiciously large",
                        count
                    )));
                }
                // Cap the preallocation by what the remaining bytes could hold.
                let remaining = self.buf.len() - self.pos;
                let mut elements = Vec::with_capacity((count as usize).min(remaining));
                for _ in 0..count {
                    elements.push(self.value(elem_type)?);
                }
                GgufValue::Array(elements)
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
