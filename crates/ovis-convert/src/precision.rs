//! Output precision selection and payload encoding.

use ovis_gguf::TensorDType;
use ovis_quantization::{QuantizationType, quantize_parallel, utils};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::classify::{TensorClass, is_quantizable};
use crate::error::{ConvertError, Result};
use crate::tensor::Tensor;

/// Requested output precision (`--outtype`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[allow(non_camel_case_types)]
pub enum PrecisionMode {
    F32,
    F16,
    Q8_0,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q4_K,
    Q6_K,
}

impl PrecisionMode {
    pub const ALL: [PrecisionMode; 9] = [
        PrecisionMode::F32,
        PrecisionMode::F16,
        PrecisionMode::Q8_0,
        PrecisionMode::Q4_0,
        PrecisionMode::Q4_1,
        PrecisionMode::Q5_0,
        PrecisionMode::Q5_1,
        PrecisionMode::Q4_K,
        PrecisionMode::Q6_K,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            PrecisionMode::F32 => "f32",
            PrecisionMode::F16 => "f16",
            PrecisionMode::Q8_0 => "q8_0",
            PrecisionMode::Q4_0 => "q4_0",
            PrecisionMode::Q4_1 => "q4_1",
            PrecisionMode::Q5_0 => "q5_0",
            PrecisionMode::Q5_1 => "q5_1",
            PrecisionMode::Q4_K => "q4_k",
            PrecisionMode::Q6_K => "q6_k",
        }
    }

    /// `general.file_type` value (llama.cpp `LlamaFileType`).
    pub const fn file_type(self) -> u32 {
        match self {
            PrecisionMode::F32 => 0,
            PrecisionMode::F16 => 1,
            PrecisionMode::Q4_0 => 2,
            PrecisionMode::Q4_1 => 3,
            PrecisionMode::Q8_0 => 7,
            PrecisionMode::Q5_0 => 8,
            PrecisionMode::Q5_1 => 9,
            PrecisionMode::Q4_K => 14,
            PrecisionMode::Q6_K => 18,
        }
    }

    /// The on-disk format a quantizable tensor gets under this request.
    pub const fn target(self) -> TensorDType {
        match self {
            PrecisionMode::F32 => TensorDType::F32,
            PrecisionMode::F16 => TensorDType::F16,
            PrecisionMode::Q8_0 => TensorDType::Q8_0,
            PrecisionMode::Q4_0 => TensorDType::Q4_0,
            PrecisionMode::Q4_1 => TensorDType::Q4_1,
            PrecisionMode::Q5_0 => TensorDType::Q5_0,
            PrecisionMode::Q5_1 => TensorDType::Q5_1,
            PrecisionMode::Q4_K => TensorDType::Q4_K,
            PrecisionMode::Q6_K => TensorDType::Q6_K,
        }
    }
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrecisionMode {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ConvertError::UnknownPrecision(s.to_string()))
    }
}

/// Pick the concrete on-disk format for one tensor.
///
/// Full precision requested, or a non-quantizable tensor, gives F32. A
/// quantizable tensor whose innermost dimension does not fill whole blocks
/// of the target format (32 elements, 256 for the K formats) falls back to
/// F16.
pub fn select_precision(class: TensorClass, shape: &[usize], requested: PrecisionMode) -> TensorDType {
    if requested == PrecisionMode::F32 || !is_quantizable(class, shape) {
        return TensorDType::F32;
    }
    let target = requested.target();
    if target.is_quantized() && shape.last().is_none_or(|&inner| inner % target.block_size() != 0) {
        return TensorDType::F16;
    }
    target
}

fn quantization_type(format: TensorDType) -> Option<QuantizationType> {
    match format {
        TensorDType::Q8_0 => Some(QuantizationType::Q8_0),
        TensorDType::Q4_0 => Some(QuantizationType::Q4_0),
        TensorDType::Q4_1 => Some(QuantizationType::Q4_1),
        TensorDType::Q5_0 => Some(QuantizationType::Q5_0),
        TensorDType::Q5_1 => Some(QuantizationType::Q5_1),
        TensorDType::Q4_K => Some(QuantizationType::Q4_K),
        TensorDType::Q6_K => Some(QuantizationType::Q6_K),
        TensorDType::F32 | TensorDType::F16 => None,
    }
}

/// Encode a dense tensor into `format` bytes.
pub fn encode(tensor: &Tensor, format: TensorDType) -> Result<Vec<u8>> {
    match format {
        TensorDType::F32 => Ok(utils::f32_to_bytes(&tensor.data)),
        TensorDType::F16 => Ok(utils::f32_to_f16_bytes(&tensor.data)),
        block => {
            let qtype = quantization_type(block).ok_or_else(|| {
                ConvertError::InvalidConfig(format!("no quantizer for {block}"))
            })?;
            Ok(quantize_parallel(qtype, &tensor.data)?)
        }
    }
}
