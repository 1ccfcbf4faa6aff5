//! GGUF v3 writer.
//!
//! Metadata entries are written first, then the tensor directory, then the
//! 32-byte aligned tensor-data section. Tensor shapes are accepted in
//! row-major order and written innermost-first, as ggml expects.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

use crate::{GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION, GgufValueType, MAX_TENSOR_NAME_LEN};

/// Errors raised while assembling or writing a GGUF file.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum GgufWriteError {
    #[error("duplicate tensor name `{0}`")]
    DuplicateTensor(String),
    #[error("duplicate metadata key `{0}`")]
    DuplicateMetadata(String),
    #[error("tensor name `{name}` is {len} bytes (max {MAX_TENSOR_NAME_LEN})")]
    TensorNameTooLong { name: String, len: usize },
    #[error("tensor `{name}`: {dtype:?} payload is {actual} bytes, shape requires {expected}")]
    DataSizeMismatch { name: String, dtype: TensorDType, expected: usize, actual: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, GgufWriteError>;

/// Metadata value accepted by the writer.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Bool(bool),
    U32(u32),
    I32(i32),
    F32(f32),
    String(String),
    F32Array(Vec<f32>),
    I32Array(Vec<i32>),
    StringArray(Vec<String>),
}

impl MetadataValue {
    fn value_type(&self) -> GgufValueType {
        match self {
            MetadataValue::Bool(_) => GgufValueType::Bool,
            MetadataValue::U32(_) => GgufValueType::Uint32,
            MetadataValue::I32(_) => GgufValueType::Int32,
            MetadataValue::F32(_) => GgufValueType::Float32,
            MetadataValue::String(_) => GgufValueType::String,
            MetadataValue::F32Array(_)
            | MetadataValue::I32Array(_)
            | MetadataValue::StringArray(_) => GgufValueType::Array,
        }
    }
}

/// On-disk tensor encodings the writer knows how to size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum TensorDType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q4_K,
    Q6_K,
}

impl TensorDType {
    /// ggml type id.
    pub const fn as_gguf_type(self) -> u32 {
        match self {
            TensorDType::F32 => 0,
            TensorDType::F16 => 1,
            TensorDType::Q4_0 => 2,
            TensorDType::Q4_1 => 3,
            TensorDType::Q5_0 => 6,
            TensorDType::Q5_1 => 7,
            TensorDType::Q8_0 => 8,
            TensorDType::Q4_K => 12,
            TensorDType::Q6_K => 14,
        }
    }

    /// Elements per block (1 for plain float types).
    pub const fn block_size(self) -> usize {
        match self {
            TensorDType::F32 | TensorDType::F16 => 1,
            TensorDType::Q4_K | TensorDType::Q6_K => 256,
            _ => 32,
        }
    }

    /// Bytes per block.
    pub const fn type_size(self) -> usize {
        match self {
            TensorDType::F32 => 4,
            TensorDType::F16 => 2,
            TensorDType::Q4_0 => 18,
            TensorDType::Q4_1 => 20,
            TensorDType::Q5_0 => 22,
            TensorDType::Q5_1 => 24,
            TensorDType::Q8_0 => 34,
            TensorDType::Q4_K => 144,
            TensorDType::Q6_K => 210,
        }
    }

    pub const fn is_quantized(self) -> bool {
        self.block_size() > 1
    }

    /// Payload size for `n_elements`, or `None` when they do not fill whole blocks.
    pub fn byte_size(self, n_elements: usize) -> Option<usize> {
        if n_elements % self.block_size() != 0 {
            return None;
        }
        n_elements.checked_div(self.block_size())?.checked_mul(self.type_size())
    }

    pub const fn name(self) -> &'static str {
        match self {
            TensorDType::F32 => "F32",
            TensorDType::F16 => "F16",
            TensorDType::Q4_0 => "Q4_0",
            TensorDType::Q4_1 => "Q4_1",
            TensorDType::Q5_0 => "Q5_0",
            TensorDType::Q5_1 => "Q5_1",
            TensorDType::Q8_0 => "Q8_0",
            TensorDType::Q4_K => "Q4_K",
            TensorDType::Q6_K => "Q6_K",
        }
    }
}

impl std::fmt::Display for TensorDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One tensor ready to be written.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub name: String,
    /// Row-major shape (outermost dimension first).
    pub shape: Vec<u64>,
    pub dtype: TensorDType,
    pub data: Vec<u8>,
}

impl TensorEntry {
    pub fn new(name: String, shape: Vec<u64>, dtype: TensorDType, data: Vec<u8>) -> Self {
        Self { name, shape, dtype, data }
    }

    pub fn n_elements(&self) -> usize {
        self.shape.iter().product::<u64>() as usize
    }
}

/// Accumulates metadata and tensors, then writes them out in one pass.
#[derive(Debug, Default)]
pub struct GgufWriter {
    pub metadata: Vec<(String, MetadataValue)>,
    tensors: Vec<TensorEntry>,
    tensor_names: HashSet<String>,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metadata entry. Keys are unique per file.
    pub fn add_metadata(&mut self, key: &str, value: MetadataValue) -> Result<()> {
        if self.has_metadata(key) {
            return Err(GgufWriteError::DuplicateMetadata(key.to_string()));
        }
        self.metadata.push((key.to_string(), value));
        Ok(())
    }

    /// Whether a metadata key has already been added.
    pub fn has_metadata(&self, key: &str) -> bool {
        self.metadata.iter().any(|(k, _)| k == key)
    }

    /// Add a tensor, validating its name and payload size.
    pub fn add_tensor(&mut self, tensor: TensorEntry) -> Result<()> {
        if tensor.name.len() > MAX_TENSOR_NAME_LEN {
            return Err(GgufWriteError::TensorNameTooLong {
                len: tensor.name.len(),
                name: tensor.name,
            });
        }
        if self.tensor_names.contains(&tensor.name) {
            return Err(GgufWriteError::DuplicateTensor(tensor.name));
        }
        let expected = tensor.dtype.byte_size(tensor.n_elements());
        if expected != Some(tensor.data.len()) {
            return Err(GgufWriteError::DataSizeMismatch {
                name: tensor.name,
                dtype: tensor.dtype,
                expected: expected.unwrap_or(0),
                actual: tensor.data.len(),
            });
        }
        self.tensor_names.insert(tensor.name.clone());
        self.tensors.push(tensor);
        Ok(())
    }

    /// Whether a tensor with this name has already been added.
    pub fn contains_tensor(&self, name: &str) -> bool {
        self.tensor_names.contains(name)
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Serialize the whole file into `w`.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut out = CountingWriter { inner: w, written: 0 };

        out.write_all(&GGUF_MAGIC)?;
        out.write_all(&GGUF_VERSION.to_le_bytes())?;
        out.write_all(&(self.tensors.len() as u64).to_le_bytes())?;
        out.write_all(&(self.metadata.len() as u64).to_le_bytes())?;

        for (key, value) in &self.metadata {
            write_string(&mut out, key)?;
            write_value(&mut out, value)?;
        }

        let mut offset = 0usize;
        for tensor in &self.tensors {
            write_string(&mut out, &tensor.name)?;
            out.write_all(&(tensor.shape.len() as u32).to_le_bytes())?;
            for &d in tensor.shape.iter().rev() {
                out.write_all(&d.to_le_bytes())?;
            }
            out.write_all(&tensor.dtype.as_gguf_type().to_le_bytes())?;
            out.write_all(&(offset as u64).to_le_bytes())?;
            offset = crate::align_up(offset + tensor.data.len(), GGUF_DEFAULT_ALIGNMENT);
        }

        pad_to_alignment(&mut out)?;

        for tensor in &self.tensors {
            out.write_all(&tensor.data)?;
            pad_to_alignment(&mut out)?;
        }

        out.flush()?;
        tracing::debug!(
            tensors = self.tensors.len(),
            metadata = self.metadata.len(),
            bytes = out.written,
            "wrote GGUF image"
        );
        Ok(())
    }

    /// Write the file to `path`, creating or truncating it.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);
        self.write(&mut w)?;
        w.flush()?;
        Ok(())
    }
}

struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    written: usize,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn pad_to_alignment<W: Write>(out: &mut CountingWriter<'_, W>) -> io::Result<()> {
    let pad = crate::align_up(out.written, GGUF_DEFAULT_ALIGNMENT) - out.written;
    if pad > 0 {
        out.write_all(&[0u8; GGUF_DEFAULT_ALIGNMENT][..pad])?;
    }
    Ok(())
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(&(s.len() as u64).to_le_bytes())?;
    w.write_all(s.as_bytes())
}

fn write_value<W: Write>(w: &mut W, value: &MetadataValue) -> io::Result<()> {
    w.write_all(&(value.value_type() as u32).to_le_bytes())?;
    match value {
        MetadataValue::Bool(v) => w.write_all(&[u8::from(*v)]),
        MetadataValue::U32(v) => w.write_all(&v.to_le_bytes()),
        MetadataValue::I32(v) => w.write_all(&v.to_le_bytes()),
        MetadataValue::F32(v) => w.write_all(&v.to_le_bytes()),
        MetadataValue::String(s) => write_string(w, s),
        MetadataValue::F32Array(values) => {
            w.write_all(&(GgufValueType::Float32 as u32).to_le_bytes())?;
            w.write_all(&(values.len() as u64).to_le_bytes())?;
            for v in values {
                w.write_all(&v.to_le_bytes())?;
            }
            Ok(())
        }
        MetadataValue::I32Array(values) => {
            w.write_all(&(GgufValueType::Int32 as u32).to_le_bytes())?;
            w.write_all(&(values.len() as u64).to_le_bytes())?;
            for v in values {
                w.write_all(&v.to_le_bytes())?;
            }
            Ok(())
        }
        MetadataValue::StringArray(values) => {
            w.write_all(&(GgufValueType::String as u32).to_le_bytes())?;
            w.write_all(&(values.len() as u64).to_le_bytes())?;
            values.iter().try_for_each(|s| write_string(w, s))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_requires_whole_blocks() {
        assert_eq!(TensorDType::F32.byte_size(3), Some(12));
        assert_eq!(TensorDType::F16.byte_size(3), Some(6));
        assert_eq!(TensorDType::Q8_0.byte_size(64), Some(68));
        assert_eq!(TensorDType::Q4_0.byte_size(32), Some(18));
        assert_eq!(TensorDType::Q5_1.byte_size(96), Some(72));
        assert_eq!(TensorDType::Q4_1.byte_size(33), None);
        assert_eq!(TensorDType::Q6_K.byte_size(512), Some(420));
        assert_eq!(TensorDType::Q4_K.byte_size(32), None);
    }

    #[test]
    fn add_tensor_rejects_size_mismatch() {
        let mut w = GgufWriter::new();
        let err = w
            .add_tensor(TensorEntry::new("x".into(), vec![2, 2], TensorDType::F32, vec![0; 8]))
            .unwrap_err();
        assert!(matches!(err, GgufWriteError::DataSizeMismatch { expected: 16, actual: 8, .. }));
        assert!(!w.contains_tensor("x"));
    }

    #[test]
    fn add_tensor_rejects_long_name() {
        let mut w = GgufWriter::new();
        let name = "a".repeat(MAX_TENSOR_NAME_LEN + 1);
        let err = w.add_tensor(TensorEntry::new(name, vec![1], TensorDType::F32, vec![0; 4]));
        assert!(matches!(err, Err(GgufWriteError::TensorNameTooLong { len: 64, .. })));
    }

    #[test]
    fn contains_tensor_tracks_additions() {
        let mut w = GgufWriter::new();
        assert!(!w.contains_tensor("output.weight"));
        w.add_tensor(TensorEntry::new("output.weight".into(), vec![1], TensorDType::F32, vec![0; 4]))
            .unwrap();
        assert!(w.contains_tensor("output.weight"));
        let dup =
            w.add_tensor(TensorEntry::new("output.weight".into(), vec![1], TensorDType::F32, vec![0; 4]));
        assert!(matches!(dup, Err(GgufWriteError::DuplicateTensor(_))));
        assert_eq!(w.tensor_count(), 1);
    }

    #[test]
    fn metadata_keys_are_unique() {
        let mut w = GgufWriter::new();
        w.add_metadata("general.architecture", MetadataValue::String("llama".into())).unwrap();
        assert!(w.has_metadata("general.architecture"));
        assert!(matches!(
            w.add_metadata("general.architecture", MetadataValue::String("clip".into())),
            Err(GgufWriteError::DuplicateMetadata(_))
        ));
    }

    #[test]
    fn tensor_data_section_is_aligned() {
        let mut w = GgufWriter::new();
        w.add_metadata("general.name", MetadataValue::String("odd".into())).unwrap();
        w.add_tensor(TensorEntry::new("a".into(), vec![3], TensorDType::F32, vec![1; 12])).unwrap();
        w.add_tensor(TensorEntry::new("b".into(), vec![1], TensorDType::F16, vec![2; 2])).unwrap();
        let mut buf = Vec::new();
        w.write(&mut buf).unwrap();

        let index = crate::read_index(&buf).unwrap();
        assert_eq!(index.data_offset % GGUF_DEFAULT_ALIGNMENT, 0);
        assert_eq!(index.tensors[0].offset, 0);
        assert_eq!(index.tensors[1].offset, 32);
        let b_start = index.data_offset + 32;
        assert_eq!(&buf[b_start..b_start + 2], &[2, 2]);
        assert_eq!(buf.len() % GGUF_DEFAULT_ALIGNMENT, 0);
    }

    #[test]
    fn header_is_little_endian() {
        let mut w = GgufWriter::new();
        w.add_metadata("general.alignment", MetadataValue::U32(32)).unwrap();
        w.add_tensor(TensorEntry::new("a".into(), vec![2, 3], TensorDType::F32, vec![0; 24])).unwrap();
        let mut buf = Vec::new();
        w.write(&mut buf).unwrap();

        assert_eq!(&buf[0..4], b"GGUF");
        assert_eq!(buf[4..8], GGUF_VERSION.to_le_bytes());
        assert_eq!(buf[8..16], 1u64.to_le_bytes());
        assert_eq!(buf[16..24], 1u64.to_le_bytes());
        // dims are stored innermost first
        assert_eq!(crate::read_index(&buf).unwrap().tensors[0].dims, vec![3, 2]);
    }
}
