//! GGUF container types, index reader and writer.
//!
//! The converter only ever needs three things from the container format:
//! a writer that lays out metadata before the tensor directory, a way to ask
//! whether a key is already present, and a reader good enough to verify what
//! was written. This crate provides exactly that.
//!
//! # Example
//!
//! ```no_run
//! use ovis_gguf::writer::{GgufWriter, MetadataValue, TensorDType, TensorEntry};
//!
//! let mut w = GgufWriter::new();
//! w.add_metadata("general.architecture", MetadataValue::String("llama".into())).unwrap();
//! w.add_tensor(TensorEntry::new("output_norm.weight".into(), vec![4], TensorDType::F32, vec![0; 16]))
//!     .unwrap();
//! w.write_to_file(std::path::Path::new("model.gguf")).unwrap();
//! ```

pub mod kv;
pub mod writer;

pub use kv::{GgufError, GgufIndex, GgufKv, GgufValue, TensorInfo, read_index, read_index_file};
pub use writer::{GgufWriteError, GgufWriter, MetadataValue, TensorDType, TensorEntry};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// The four-byte magic that every GGUF file starts with.
pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";
/// Version written by [`writer::GgufWriter`].
pub const GGUF_VERSION: u32 = 3;
/// Minimum version accepted by the reader.
pub const GGUF_VERSION_MIN: u32 = 2;
/// Maximum version accepted by the reader (inclusive).
pub const GGUF_VERSION_MAX: u32 = 3;
/// Alignment of the tensor-data section and of every tensor inside it.
pub const GGUF_DEFAULT_ALIGNMENT: usize = 32;
/// Longest tensor name consumers accept (ggml reserves one byte for the NUL).
pub const MAX_TENSOR_NAME_LEN: usize = 63;

// ---------------------------------------------------------------------------
// Value-type discriminant
// ---------------------------------------------------------------------------

/// Discriminant tag for GGUF metadata values.
///
/// Numeric values are the on-disk tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
#[non_exhaustive]
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

/// Round `off` up to the next multiple of `align` (a power of two).
#[inline]
pub fn align_up(off: usize, align: usize) -> usize {
    if align == 0 {
        return off;
    }
    debug_assert!(align.is_power_of_two(), "alignment should be power-of-two");
    (off + align - 1) & !(align - 1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, 32), 0);
        assert_eq!(align_up(1, 32), 32);
        assert_eq!(align_up(32, 32), 32);
        assert_eq!(align_up(33, 32), 64);
        assert_eq!(align_up(5, 0), 5);
    }

    #[test]
    fn value_type_tags() {
        assert_eq!(GgufValueType::Uint32 as u32, 4);
        assert_eq!(GgufValueType::String as u32, 8);
        assert_eq!(GgufValueType::Array as u32, 9);
    }
}
