use serde::{Deserialize, Serialize};
use std::io::{self, Cursor, Read};
use thiserror::Error;

use crate::{GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION_MAX, GGUF_VERSION_MIN, align_up};

/// Errors returned when reading a GGUF index.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum GgufError {
    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),
    #[error("short header: read {0} bytes, need 24")]
    ShortHeader(usize),
    #[error("malformed header")]
    Malformed,
    #[error("invalid KV type: {0}")]
    InvalidKvType(u32),
    #[error("string too large: {0} bytes")]
    StringTooLarge(u64),
    #[error("too many entries: {0}")]
    TooManyEntries(u64),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, GgufError>;

/// GGUF value types as tagged in the file format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            GgufValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[GgufValue]> {
        match self {
            GgufValue::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// A key-value pair from the GGUF metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GgufKv {
    pub key: String,
    pub value: GgufValue,
}

/// Tensor descriptor from the GGUF tensor directory.
///
/// `dims` is kept in file order, innermost dimension first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<u64>,
    /// Raw ggml type discriminant.
    pub dtype: u32,
    /// Byte offset into the tensor-data section.
    pub offset: u64,
}

impl TensorInfo {
    /// Dimensions in row-major order (outermost first).
    pub fn shape(&self) -> Vec<u64> {
        self.dims.iter().rev().copied().collect()
    }
}

/// Everything in a GGUF file except the tensor payloads.
#[derive(Debug, Clone)]
pub struct GgufIndex {
    pub version: u32,
    pub metadata: Vec<GgufKv>,
    pub tensors: Vec<TensorInfo>,
    /// Absolute byte offset of the tensor-data section.
    pub data_offset: usize,
}

impl GgufIndex {
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata.iter().find(|kv| kv.key == key).map(|kv| &kv.value)
    }

    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }
}

// Bounds that keep a corrupt file from triggering huge allocations.
const MAX_STR_LEN: u64 = 10 * 1024 * 1024;
const MAX_ENTRIES: u64 = 1_000_000;
const MAX_DIMS: u32 = 8;

#[inline]
fn read_u32_le<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

#[inline]
fn read_u64_le<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

#[inline]
fn read_string<R: Read>(r: &mut R) -> Result<String> {
    let len = read_u64_le(r)?;
    if len > MAX_STR_LEN {
        return Err(GgufError::StringTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| GgufError::Malformed)
}

fn read_value<R: Read>(r: &mut R, ty: u32) -> Result<GgufValue> {
    Ok(match ty {
        0 => {
            let mut b = [0];
            r.read_exact(&mut b)?;
            GgufValue::U8(b[0])
        }
        1 => {
            let mut b = [0];
            r.read_exact(&mut b)?;
            GgufValue::I8(b[0] as i8)
        }
        2 => {
            let mut b = [0; 2];
            r.read_exact(&mut b)?;
            GgufValue::U16(u16::from_le_bytes(b))
        }
        3 => {
            let mut b = [0; 2];
            r.read_exact(&mut b)?;
            GgufValue::I16(i16::from_le_bytes(b))
        }
        4 => GgufValue::U32(read_u32_le(r)?),
        5 => GgufValue::I32(read_u32_le(r)? as i32),
        6 => GgufValue::F32(f32::from_bits(read_u32_le(r)?)),
        7 => {
            let mut b = [0];
            r.read_exact(&mut b)?;
            GgufValue::Bool(b[0] != 0)
        }
        8 => GgufValue::String(read_string(r)?),
        9 => {
            let elem_ty = read_u32_le(r)?;
            if elem_ty == 9 {
                return Err(GgufError::InvalidKvType(elem_ty));
            }
            let len = read_u64_le(r)?;
            if len > MAX_ENTRIES {
                return Err(GgufError::TooManyEntries(len));
            }
            let mut out = Vec::with_capacity(len as usize);
            for _ in 0..len {
                out.push(read_value(r, elem_ty)?);
            }
            GgufValue::Array(out)
        }
        10 => GgufValue::U64(read_u64_le(r)?),
        11 => GgufValue::I64(read_u64_le(r)? as i64),
        12 => GgufValue::F64(f64::from_bits(read_u64_le(r)?)),
        _ => return Err(GgufError::InvalidKvType(ty)),
    })
}

/// Parse the header, metadata and tensor directory from an in-memory GGUF image.
pub fn read_index(buf: &[u8]) -> Result<GgufIndex> {
    if buf.len() < 24 {
        return Err(GgufError::ShortHeader(buf.len()));
    }
    let magic = <[u8; 4]>::try_from(&buf[0..4]).map_err(|_| GgufError::Malformed)?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::BadMagic(magic));
    }

    let mut r = Cursor::new(buf);
    r.set_position(4);
    let version = read_u32_le(&mut r)?;
    if !(GGUF_VERSION_MIN..=GGUF_VERSION_MAX).contains(&version) {
        return Err(GgufError::UnsupportedVersion(version));
    }
    let n_tensors = read_u64_le(&mut r)?;
    let n_kv = read_u64_le(&mut r)?;
    if n_tensors > MAX_ENTRIES {
        return Err(GgufError::TooManyEntries(n_tensors));
    }
    if n_kv > MAX_ENTRIES {
        return Err(GgufError::TooManyEntries(n_kv));
    }

    let mut metadata = Vec::with_capacity(n_kv as usize);
    for _ in 0..n_kv {
        let key = read_string(&mut r)?;
        let ty = read_u32_le(&mut r)?;
        let value = read_value(&mut r, ty)?;
        metadata.push(GgufKv { key, value });
    }

    let mut tensors = Vec::with_capacity(n_tensors as usize);
    for _ in 0..n_tensors {
        let name = read_string(&mut r)?;
        let n_dims = read_u32_le(&mut r)?;
        if n_dims > MAX_DIMS {
            return Err(GgufError::Malformed);
        }
        let mut dims = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            dims.push(read_u64_le(&mut r)?);
        }
        let dtype = read_u32_le(&mut r)?;
        let offset = read_u64_le(&mut r)?;
        tensors.push(TensorInfo { name, dims, dtype, offset });
    }

    let alignment = metadata
        .iter()
        .find(|kv| kv.key == "general.alignment")
        .and_then(|kv| kv.value.as_u32())
        .map(|a| a as usize)
        .filter(|a| a.is_power_of_two())
        .unwrap_or(GGUF_DEFAULT_ALIGNMENT);
    let data_offset = align_up(r.position() as usize, alignment);

    Ok(GgufIndex { version, metadata, tensors, data_offset })
}

/// Read a GGUF file from disk and parse its index.
pub fn read_index_file(path: impl AsRef<std::path::Path>) -> Result<GgufIndex> {
    let data = std::fs::read(path)?;
    read_index(&data)
}
