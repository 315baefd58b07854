//! Host tensor type with F32 and block-quantized storage.
//!
//! Activations are always F32. Weight matrices may stay in Q8_0 or Q4_0 form
//! and are consumed directly by the quantized matmul kernels.

use tracing::trace;

use crate::gguf::quant::{self, bytes_as_q4_0_blocks, bytes_as_q8_0_blocks};

/// Data type of tensor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorDtype {
    F32,
    Q8_0,
    Q4_0,
}

impl TensorDtype {
    /// Number of values per block (1 for F32).
    pub fn block_size(&self) -> usize {
        match self {
            TensorDtype::F32 => 1,
            TensorDtype::Q8_0 | TensorDtype::Q4_0 => 32,
        }
    }

    /// Size in bytes of one block.
    pub fn block_byte_size(&self) -> usize {
        match self {
            TensorDtype::F32 => 4,
            TensorDtype::Q8_0 => 34,
            TensorDtype::Q4_0 => 18,
        }
    }

    pub fn is_quantized(&self) -> bool {
        !matches!(self, TensorDtype::F32)
    }
}

/// Storage for tensor data.
#[derive(Debug, Clone)]
pub enum TensorStorage {
    F32(Vec<f32>),
    /// Raw block bytes, interpreted according to the tensor's dtype.
    Quantized(Vec<u8>),
}

/// Row-major N-dimensional tensor.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Vec<usize>,
    dtype: TensorDtype,
    storage: TensorStorage,
}

impl Tensor {
    /// Create an F32 tensor from shape and data.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        let n_elements: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            n_elements,
            "Data length {} does not match shape {:?} (expected {})",
            data.len(),
            shape,
            n_elements
        );
        Self {
            shape,
            dtype: TensorDtype::F32,
            storage: TensorStorage::F32(data),
        }
    }

    /// Create a zero-filled F32 tensor.
    pub fn zeros(shape: &[usize]) -> Self {
        let n_elements: usize = shape.iter().product();
        Self::new(shape.to_vec(), vec![0.0; n_elements])
    }

    /// Create a quantized tensor from raw block bytes.
    ///
    /// Rows (the last dimension) must be a whole number of blocks.
    ///
    /// # Panics
    /// Panics if `dtype` is F32 or the byte length does not match the shape.
    pub fn from_quantized(shape: Vec<usize>, dtype: TensorDtype, data: Vec<u8>) -> Self {
        assert!(dtype.is_quantized(), "from_quantized requires a quantized dtype");
        let n_elements: usize = shape.iter().product();
        let n_blocks = (n_elements + dtype.block_size() - 1) / dtype.block_size();
        let expected_bytes = n_blocks * dtype.block_byte_size();
        assert_eq!(
            data.len(),
            expected_bytes,
            "Quantized data length {} does not match expected {} bytes for {:?} {:?}",
            data.len(),
            expected_bytes,
            dtype,
            shape,
        );
        trace!(?dtype, ?shape, n_blocks, "Created quantized tensor");
        Self {
            shape,
            dtype,
            storage: TensorStorage::Quantized(data),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    pub fn storage(&self) -> &TensorStorage {
        &self.storage
    }

    pub fn n_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Borrow the F32 data.
    ///
    /// # Panics
    /// Panics if the tensor is quantized.
    pub fn as_f32(&self) -> &[f32] {
        match &self.storage {
            TensorStorage::F32(data) => data,
            TensorStorage::Quantized(_) => panic!("Tensor is {:?}, not F32", self.dtype),
        }
    }

    /// Mutably borrow the F32 data.
    ///
    /// # Panics
    /// Panics if the tensor is quantized.
    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        match &mut self.storage {
            TensorStorage::F32(data) => data,
            TensorStorage::Quantized(_) => panic!("Tensor is {:?}, not F32", self.dtype),
        }
    }

    /// Take ownership of the F32 data.
    ///
    /// # Panics
    /// Panics if the tensor is quantized.
    pub fn into_f32_vec(self) -> Vec<f32> {
        match self.storage {
            TensorStorage::F32(data) => data,
            TensorStorage::Quantized(_) => panic!("Tensor is {:?}, not F32", self.dtype),
        }
    }

    /// Return an F32 copy, dequantizing if necessary.
    pub fn to_f32(&self) -> Tensor {
        let raw = match &self.storage {
            TensorStorage::F32(_) => return self.clone(),
            TensorStorage::Quantized(raw) => raw,
        };
        // Lengths were validated in from_quantized, so the block views cannot fail.
        let mut data = match self.dtype {
            TensorDtype::Q8_0 => bytes_as_q8_0_blocks(raw)
                .map(quant::dequantize_q8_0)
                .unwrap_or_default(),
            TensorDtype::Q4_0 => bytes_as_q4_0_blocks(raw)
                .map(quant::dequantize_q4_0)
                .unwrap_or_default(),
            TensorDtype::F32 => unreachable!("F32 handled above"),
        };
        data.resize(self.n_elements(), 0.0);
        Tensor::new(self.shape.clone(), data)
    }

    /// Number of rows of a 2D tensor.
    ///
    /// # Panics
    /// Panics if the tensor is not 2D.
    pub fn rows(&self) -> usize {
        assert_eq!(self.shape.len(), 2, "rows() requires a 2D tensor, got {:?}", self.shape);
        self.shape[0]
    }

    /// Number of columns of a 2D tensor.
    ///
    /// # Panics
    /// Panics if the tensor is not 2D.
    pub fn cols(&self) -> usize {
        assert_eq!(self.shape.len(), 2, "cols() requires a 2D tensor, got {:?}", self.shape);
        self.shape[1]
    }

    /// Row `i` of a 2D F32 tensor.
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.as_f32()[i * cols..(i + 1) * cols]
    }
}
