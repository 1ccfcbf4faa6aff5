//! Lazy tensor handles and dense `f32` tensors.
//!
//! A [`LazyTensor`] carries dtype and shape up front and defers reading its
//! bytes until [`LazyTensor::materialize`] is called. The naming engine only
//! ever looks at dtype and shape; payloads are forced during splits and in
//! the final encode phase.

use half::{bf16, f16};
use std::fmt;
use std::sync::Arc;

use crate::error::{ConvertError, Result};

/// Element types a source checkpoint may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum SourceDtype {
    F64,
    F32,
    BF16,
    F16,
    I64,
    I32,
    I16,
    U8,
    I8,
    Bool,
    F8_E4M3,
    F8_E5M2,
}

impl SourceDtype {
    /// Map a safetensors dtype, rejecting the ones a checkpoint cannot hold.
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Option<Self> {
        use safetensors::Dtype;
        Some(match dtype {
            Dtype::F64 => SourceDtype::F64,
            Dtype::F32 => SourceDtype::F32,
            Dtype::BF16 => SourceDtype::BF16,
            Dtype::F16 => SourceDtype::F16,
            Dtype::I64 => SourceDtype::I64,
            Dtype::I32 => SourceDtype::I32,
            Dtype::I16 => SourceDtype::I16,
            Dtype::U8 => SourceDtype::U8,
            Dtype::I8 => SourceDtype::I8,
            Dtype::BOOL => SourceDtype::Bool,
            Dtype::F8_E4M3 => SourceDtype::F8_E4M3,
            Dtype::F8_E5M2 => SourceDtype::F8_E5M2,
            _ => return None,
        })
    }

    pub const fn size_in_bytes(self) -> usize {
        match self {
            SourceDtype::F64 | SourceDtype::I64 => 8,
            SourceDtype::F32 | SourceDtype::I32 => 4,
            SourceDtype::BF16 | SourceDtype::F16 | SourceDtype::I16 => 2,
            SourceDtype::U8
            | SourceDtype::I8
            | SourceDtype::Bool
            | SourceDtype::F8_E4M3
            | SourceDtype::F8_E5M2 => 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SourceDtype::F64 => "F64",
            SourceDtype::F32 => "F32",
            SourceDtype::BF16 => "BF16",
            SourceDtype::F16 => "F16",
            SourceDtype::I64 => "I64",
            SourceDtype::I32 => "I32",
            SourceDtype::I16 => "I16",
            SourceDtype::U8 => "U8",
            SourceDtype::I8 => "I8",
            SourceDtype::Bool => "BOOL",
            SourceDtype::F8_E4M3 => "F8_E4M3",
            SourceDtype::F8_E5M2 => "F8_E5M2",
        }
    }
}

impl fmt::Display for SourceDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Loader = Arc<dyn Fn() -> Result<Vec<u8>> + Send + Sync>;

/// An uninstantiated tensor: dtype, shape and a deferred byte loader.
#[derive(Clone)]
pub struct LazyTensor {
    pub dtype: SourceDtype,
    pub shape: Vec<usize>,
    loader: Loader,
}

impl fmt::Debug for LazyTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyTensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

impl LazyTensor {
    pub fn new(
        dtype: SourceDtype,
        shape: Vec<usize>,
        loader: impl Fn() -> Result<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self { dtype, shape, loader: Arc::new(loader) }
    }

    /// A handle over bytes already in memory.
    pub fn from_bytes(dtype: SourceDtype, shape: Vec<usize>, bytes: Vec<u8>) -> Self {
        let bytes = Arc::new(bytes);
        Self::new(dtype, shape, move || Ok(bytes.as_ref().clone()))
    }

    /// A handle over `f32` values, mostly for tests and synthetic tensors.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Self {
        Self::from_bytes(SourceDtype::F32, shape, bytemuck::cast_slice(values).to_vec())
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Read the raw bytes without decoding.
    pub fn load_bytes(&self) -> Result<Vec<u8>> {
        (self.loader)()
    }

    /// Read and decode the payload to `f32`.
    pub fn materialize(&self, name: &str) -> Result<Tensor> {
        let bytes = self.load_bytes()?;
        let expected = self.numel() * self.dtype.size_in_bytes();
        if bytes.len() != expected {
            return Err(ConvertError::PayloadSize {
                name: name.to_string(),
                shape: self.shape.clone(),
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Tensor { shape: self.shape.clone(), data: decode_to_f32(self.dtype, &bytes) })
    }
}

/// A named source tensor as yielded by the checkpoint reader.
#[derive(Debug, Clone)]
pub struct SourceTensor {
    pub name: String,
    pub tensor: LazyTensor,
}

impl SourceTensor {
    pub fn new(name: impl Into<String>, tensor: LazyTensor) -> Self {
        Self { name: name.into(), tensor }
    }
}

/// A dense row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Elements per leading-axis row.
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Copy rows `start..end` of the leading axis.
    pub fn slice_rows(&self, start: usize, end: usize) -> Tensor {
        let row = self.row_len();
        let mut shape = self.shape.clone();
        shape[0] = end - start;
        Tensor { shape, data: self.data[start * row..end * row].to_vec() }
    }

    /// Append zero rows until the leading axis has `rows` entries.
    pub fn pad_rows(mut self, rows: usize) -> Tensor {
        if let Some(first) = self.shape.first_mut()
            && *first < rows
        {
            let row = self.shape.iter().skip(1).product::<usize>();
            self.data.resize(rows * row, 0.0);
            self.shape[0] = rows;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode little-endian `bytes` of `dtype` to `f32`.
pub fn decode_to_f32(dtype: SourceDtype, bytes: &[u8]) -> Vec<f32> {
    match dtype {
        SourceDtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        SourceDtype::F64 => bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        SourceDtype::F16 => {
            bytes.chunks_exact(2).map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32()).collect()
        }
        SourceDtype::BF16 => {
            bytes.chunks_exact(2).map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32()).collect()
        }
        SourceDtype::I64 => bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
        SourceDtype::I32 => bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect(),
        SourceDtype::I16 => {
            bytes.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]]) as f32).collect()
        }
        SourceDtype::U8 => bytes.iter().map(|&b| b as f32).collect(),
        SourceDtype::I8 => bytes.iter().map(|&b| b as i8 as f32).collect(),
        SourceDtype::Bool => bytes.iter().map(|&b| if b != 0 { 1.0 } else { 0.0 }).collect(),
        SourceDtype::F8_E4M3 => bytes.iter().map(|&b| f8_e4m3_to_f32(b)).collect(),
        SourceDtype::F8_E5M2 => bytes.iter().map(|&b| f8_e5m2_to_f32(b)).collect(),
    }
}

/// E5M2 is the top byte of an IEEE half.
#[inline]
pub fn f8_e5m2_to_f32(b: u8) -> f32 {
    f16::from_bits(u16::from(b) << 8).to_f32()
}

/// E4M3 "fn" variant: bias 7, no infinities, `S.1111.111` is NaN.
#[inline]
pub fn f8_e4m3_to_f32(b: u8) -> f32 {
    let sign = if b & 0x80 != 0 { -1.0 } else { 1.0 };
    let exp = i32::from((b >> 3) & 0x0f);
    let mant = f32::from(b & 0x07);
    if exp == 0x0f && mant == 7.0 {
        return f32::NAN;
    }
    let magnitude = if exp == 0 {
        mant / 8.0 * 2f32.powi(-6)
    } else {
        (1.0 + mant / 8.0) * 2f32.powi(exp - 7)
    };
    sign * magnitude
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e4m3_reference_values() {
        assert_eq!(f8_e4m3_to_f32(0x38), 1.0);
        assert_eq!(f8_e4m3_to_f32(0xb8), -1.0);
        assert_eq!(f8_e4m3_to_f32(0x7e), 448.0);
        assert_eq!(f8_e4m3_to_f32(0x01), 2f32.powi(-9));
        assert_eq!(f8_e4m3_to_f32(0x00), 0.0);
        assert!(f8_e4m3_to_f32(0x7f).is_nan());
        assert!(f8_e4m3_to_f32(0xff).is_nan());
    }

    #[test]
    fn e5m2_reference_values() {
        assert_eq!(f8_e5m2_to_f32(0x3c), 1.0);
        assert_eq!(f8_e5m2_to_f32(0xc0), -2.0);
        assert_eq!(f8_e5m2_to_f32(0x7b), 57344.0);
        assert!(f8_e5m2_to_f32(0x7c).is_infinite());
    }

    #[test]
    fn decodes_every_dtype() {
        assert_eq!(decode_to_f32(SourceDtype::BF16, &[0x80, 0x3f]), vec![1.0]);
        assert_eq!(decode_to_f32(SourceDtype::F16, &[0x00, 0xc0]), vec![-2.0]);
        assert_eq!(decode_to_f32(SourceDtype::F64, &2.5f64.to_le_bytes()), vec![2.5]);
        assert_eq!(decode_to_f32(SourceDtype::I64, &(-3i64).to_le_bytes()), vec![-3.0]);
        assert_eq!(decode_to_f32(SourceDtype::I32, &7i32.to_le_bytes()), vec![7.0]);
        assert_eq!(decode_to_f32(SourceDtype::I16, &(-9i16).to_le_bytes()), vec![-9.0]);
        assert_eq!(decode_to_f32(SourceDtype::I8, &[0xff]), vec![-1.0]);
        assert_eq!(decode_to_f32(SourceDtype::U8, &[0xff]), vec![255.0]);
        assert_eq!(decode_to_f32(SourceDtype::Bool, &[0, 1, 2]), vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn materialize_checks_payload_size() {
        let t = LazyTensor::from_bytes(SourceDtype::F32, vec![2, 2], vec![0; 12]);
        assert!(matches!(
            t.materialize("w"),
            Err(ConvertError::PayloadSize { expected: 16, actual: 12, .. })
        ));
    }

    #[test]
    fn slice_and_pad_rows() {
        let t = Tensor::new(vec![3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(t.slice_rows(1, 2), Tensor::new(vec![1, 2], vec![3.0, 4.0]));
        let padded = t.pad_rows(5);
        assert_eq!(padded.shape, vec![5, 2]);
        assert_eq!(&padded.data[6..], &[0.0; 4]);
        assert_eq!(padded.clone().pad_rows(2), padded);
    }
}
