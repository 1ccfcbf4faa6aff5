//! Utility functions for quantization operations

use half::f16;

use crate::{QuantizationError, QuantizationType, Result};

/// Fail unless `len` is a whole number of `qtype` blocks.
pub fn check_block_aligned(qtype: QuantizationType, len: usize) -> Result<()> {
    let block = qtype.block_size();
    if len % block != 0 {
        return Err(QuantizationError::UnalignedInput { qtype, len, block });
    }
    Ok(())
}

/// Fail unless `data` is a whole number of `qtype` blocks.
pub fn check_payload(qtype: QuantizationType, data: &[u8]) -> Result<()> {
    let size = qtype.type_size();
    if data.len() % size != 0 {
        return Err(QuantizationError::InvalidPayload {
            qtype,
            expected: (data.len() / size + 1) * size,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Value with the largest magnitude, sign preserved.
pub fn signed_absmax(block: &[f32]) -> f32 {
    block.iter().fold(0.0f32, |acc, &x| if x.abs() > acc.abs() { x } else { acc })
}

/// Largest magnitude in the block.
pub fn absmax(block: &[f32]) -> f32 {
    block.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()))
}

pub fn min_max(block: &[f32]) -> (f32, f32) {
    block
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &x| (lo.min(x), hi.max(x)))
}

/// Inverse of a scale, mapping a zero scale to zero.
#[inline]
pub fn inverse(d: f32) -> f32 {
    if d != 0.0 { 1.0 / d } else { 0.0 }
}

#[inline]
pub fn push_f16(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&f16::from_f32(v).to_le_bytes());
}

#[inline]
pub fn read_f16(bytes: &[u8], at: usize) -> f32 {
    f16::from_le_bytes([bytes[at], bytes[at + 1]]).to_f32()
}

/// Encode `values` as little-endian IEEE half floats.
pub fn f32_to_f16_bytes(values: &[f32]) -> Vec<u8> {
    let halves: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
    bytemuck::cast_slice::<f16, u8>(&halves).to_vec()
}

/// Decode little-endian IEEE half floats.
pub fn f16_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
        .collect()
}

/// Encode `values` as little-endian f32.
pub fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice::<f32, u8>(values).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_absmax_keeps_sign() {
        assert_eq!(signed_absmax(&[0.5, -2.0, 1.5]), -2.0);
        assert_eq!(signed_absmax(&[0.5, 2.0, -1.5]), 2.0);
        assert_eq!(signed_absmax(&[]), 0.0);
    }

    #[test]
    fn min_max_of_block() {
        assert_eq!(min_max(&[3.0, -1.0, 2.0]), (-1.0, 3.0));
    }

    #[test]
    fn inverse_of_zero_is_zero() {
        assert_eq!(inverse(0.0), 0.0);
        assert_eq!(inverse(4.0), 0.25);
    }

    #[test]
    fn f16_bytes_round_trip_exact_values() {
        let values = [0.0, 1.0, -2.5, 65504.0];
        let bytes = f32_to_f16_bytes(&values);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[2..4], &[0x00, 0x3c]);
        assert_eq!(f16_bytes_to_f32(&bytes), values);
    }

    #[test]
    fn payload_must_be_whole_blocks() {
        assert!(check_payload(QuantizationType::Q8_0, &[0; 68]).is_ok());
        assert_eq!(
            check_payload(QuantizationType::Q8_0, &[0; 40]),
            Err(QuantizationError::InvalidPayload {
                qtype: QuantizationType::Q8_0,
                expected: 68,
                actual: 40
            })
        );
    }
}
