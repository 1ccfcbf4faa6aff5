//! Block quantizers for GGUF tensor payloads
//!
//! The legacy formats group 32 consecutive weights into one block that
//! carries an f16 scale (and, for the `_1` variants, an f16 minimum):
//! - Q8_0: 8-bit signed, symmetric
//! - Q4_0 / Q4_1: 4-bit, symmetric / asymmetric
//! - Q5_0 / Q5_1: 5-bit, symmetric / asymmetric
//!
//! The K formats work on 256-element super-blocks whose sub-block scales are
//! themselves quantized against one f16 super-scale:
//! - Q4_K: 8 × 32 sub-blocks, 6-bit scales and minimums, 4-bit weights
//! - Q6_K: 16 × 16 sub-blocks, 8-bit signed scales, 6-bit weights
//!
//! Byte layouts match ggml's reference quantizers so the output can be
//! consumed by any GGUF reader.

use std::fmt;
use thiserror::Error;

pub mod k_quants;
pub mod q4;
pub mod q5;
pub mod q8_0;
pub mod utils;

pub use k_quants::{Q4KQuantizer, Q6KQuantizer};
pub use q4::{Q4_0Quantizer, Q4_1Quantizer};
pub use q5::{Q5_0Quantizer, Q5_1Quantizer};
pub use q8_0::Q8_0Quantizer;

/// Elements per block of the legacy formats.
pub const QK: usize = 32;

/// Elements per super-block of the K formats.
pub const QK_K: usize = 256;

/// Errors produced by the quantizers.
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantizationError {
    #[error("{qtype}: input has {len} elements, not a multiple of the {block}-element block")]
    UnalignedInput { qtype: QuantizationType, len: usize, block: usize },
    #[error("{qtype}: payload is {actual} bytes, expected {expected}")]
    InvalidPayload { qtype: QuantizationType, expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, QuantizationError>;

/// Supported block formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum QuantizationType {
    Q8_0,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q4_K,
    Q6_K,
}

impl QuantizationType {
    pub const ALL: [QuantizationType; 7] = [
        QuantizationType::Q8_0,
        QuantizationType::Q4_0,
        QuantizationType::Q4_1,
        QuantizationType::Q5_0,
        QuantizationType::Q5_1,
        QuantizationType::Q4_K,
        QuantizationType::Q6_K,
    ];

    /// Elements per (super-)block.
    pub const fn block_size(self) -> usize {
        match self {
            QuantizationType::Q4_K | QuantizationType::Q6_K => QK_K,
            _ => QK,
        }
    }

    /// Encoded bytes per block.
    pub const fn type_size(self) -> usize {
        match self {
            QuantizationType::Q8_0 => 34,
            QuantizationType::Q4_0 => 18,
            QuantizationType::Q4_1 => 20,
            QuantizationType::Q5_0 => 22,
            QuantizationType::Q5_1 => 24,
            QuantizationType::Q4_K => 144,
            QuantizationType::Q6_K => 210,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            QuantizationType::Q8_0 => "q8_0",
            QuantizationType::Q4_0 => "q4_0",
            QuantizationType::Q4_1 => "q4_1",
            QuantizationType::Q5_0 => "q5_0",
            QuantizationType::Q5_1 => "q5_1",
            QuantizationType::Q4_K => "q4_k",
            QuantizationType::Q6_K => "q6_k",
        }
    }
}

impl fmt::Display for QuantizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for block quantizer implementations
pub trait QuantizerTrait: Send + Sync {
    /// Quantize `values` into packed blocks.
    fn quantize(&self, values: &[f32]) -> Result<Vec<u8>>;

    /// Reconstruct `f32` values from packed blocks.
    fn dequantize(&self, data: &[u8]) -> Result<Vec<f32>>;

    /// The format this quantizer produces.
    fn quantization_type(&self) -> QuantizationType;

    fn block_size(&self) -> usize {
        self.quantization_type().block_size()
    }

    fn type_size(&self) -> usize {
        self.quantization_type().type_size()
    }
}

/// Quantizer factory for creating appropriate quantizers
pub struct QuantizerFactory;

impl QuantizerFactory {
    /// Create a quantizer for the specified type
    pub fn create(qtype: QuantizationType) -> Box<dyn QuantizerTrait> {
        match qtype {
            QuantizationType::Q8_0 => Box::new(Q8_0Quantizer::new()),
            QuantizationType::Q4_0 => Box::new(Q4_0Quantizer::new()),
            QuantizationType::Q4_1 => Box::new(Q4_1Quantizer::new()),
            QuantizationType::Q5_0 => Box::new(Q5_0Quantizer::new()),
            QuantizationType::Q5_1 => Box::new(Q5_1Quantizer::new()),
            QuantizationType::Q4_K => Box::new(Q4KQuantizer::new()),
            QuantizationType::Q6_K => Box::new(Q6KQuantizer::new()),
        }
    }
}

/// Quantize `values` with `qtype`, encoding blocks in parallel.
///
/// Output is byte-identical to [`QuantizerTrait::quantize`]; large tensors are
/// split into block-aligned chunks that rayon encodes independently.
pub fn quantize_parallel(qtype: QuantizationType, values: &[f32]) -> Result<Vec<u8>> {
    use rayon::prelude::*;

    const CHUNK_BLOCKS: usize = 4096;

    let quantizer = QuantizerFactory::create(qtype);
    utils::check_block_aligned(qtype, values.len())?;
    let chunk_len = CHUNK_BLOCKS * qtype.block_size();
    if values.len() <= chunk_len {
        return quantizer.quantize(values);
    }

    let chunks: Vec<Vec<u8>> = values
        .par_chunks(chunk_len)
        .map(|chunk| quantizer.quantize(chunk))
        .collect::<Result<_>>()?;
    tracing::trace!(%qtype, chunks = chunks.len(), "parallel block quantization");
    Ok(chunks.concat())
}
