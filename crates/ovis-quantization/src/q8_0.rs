//! Q8_0: symmetric 8-bit blocks.
//!
//! Block layout (34 bytes): `d: f16`, `qs: [i8; 32]`, value = `qs[i] * d`.

use crate::utils::{absmax, check_block_aligned, check_payload, inverse, push_f16, read_f16};
use crate::{QK, QuantizationType, QuantizerTrait, Result};

#[derive(Debug, Default, Clone, Copy)]
pub struct Q8_0Quantizer;

impl Q8_0Quantizer {
    pub fn new() -> Self {
        Self
    }

    fn quantize_block(block: &[f32], out: &mut Vec<u8>) {
        let d = absmax(block) / 127.0;
        let id = inverse(d);
        push_f16(out, d);
        out.extend(block.iter().map(|&x| (x * id).round() as i8 as u8));
    }
}

impl QuantizerTrait for Q8_0Quantizer {
    fn quantize(&self, values: &[f32]) -> Result<Vec<u8>> {
        check_block_aligned(QuantizationType::Q8_0, values.len())?;
        let mut out = Vec::with_capacity(values.len() / QK * QuantizationType::Q8_0.type_size());
        for block in values.chunks_exact(QK) {
            Self::quantize_block(block, &mut out);
        }
        Ok(out)
    }

    fn dequantize(&self, data: &[u8]) -> Result<Vec<f32>> {
        check_payload(QuantizationType::Q8_0, data)?;
        let mut out = Vec::with_capacity(data.len() / 34 * QK);
        for block in data.chunks_exact(34) {
            let d = read_f16(block, 0);
            out.extend(block[2..].iter().map(|&q| q as i8 as f32 * d));
        }
        Ok(out)
    }

    fn quantization_type(&self) -> QuantizationType {
        QuantizationType::Q8_0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_layout() {
        let mut values = [0.0f32; 32];
        values[0] = 127.0;
        values[1] = -63.5;
        let bytes = Q8_0Quantizer::new().quantize(&values).unwrap();
        assert_eq!(bytes.len(), 34);
        // d = 1.0
        assert_eq!(&bytes[0..2], &[0x00, 0x3c]);
        assert_eq!(bytes[2] as i8, 127);
        assert_eq!(bytes[3] as i8, -64);
        assert!(bytes[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn zero_block_stays_zero() {
        let q = Q8_0Quantizer::new();
        let bytes = q.quantize(&[0.0; 32]).unwrap();
        assert_eq!(q.dequantize(&bytes).unwrap(), vec![0.0; 32]);
    }

    #[test]
    fn reconstruction_error_is_bounded() {
        let values: Vec<f32> = (0..128).map(|i| ((i as f32) * 0.37).cos() * 3.0).collect();
        let q = Q8_0Quantizer::new();
        let restored = q.dequantize(&q.quantize(&values).unwrap()).unwrap();
        for (block, rblock) in values.chunks(32).zip(restored.chunks(32)) {
            let step = absmax(block) / 127.0;
            for (a, b) in block.iter().zip(rblock) {
                assert!((a - b).abs() <= step * 0.6, "{a} vs {b}");
            }
        }
    }
}
