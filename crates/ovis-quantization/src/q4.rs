//! 4-bit block formats.
//!
//! Q4_0 (18 bytes): `d: f16`, `qs: [u8; 16]`, value = `(q - 8) * d`.
//! Q4_1 (20 bytes): `d: f16`, `m: f16`, `qs: [u8; 16]`, value = `q * d + m`.
//!
//! In both, byte `j` of `qs` holds element `j` in its low nibble and element
//! `j + 16` in its high nibble.

use crate::utils::{
    check_block_aligned, check_payload, inverse, min_max, push_f16, read_f16, signed_absmax,
};
use crate::{QK, QuantizationType, QuantizerTrait, Result};

const HALF: usize = QK / 2;

fn pack_nibbles(out: &mut Vec<u8>, q: &[u8; QK]) {
    out.extend((0..HALF).map(|j| q[j] | (q[j + HALF] << 4)));
}

fn unpack_nibbles(qs: &[u8]) -> [u8; QK] {
    let mut q = [0u8; QK];
    for j in 0..HALF {
        q[j] = qs[j] & 0x0f;
        q[j + HALF] = qs[j] >> 4;
    }
    q
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Q4_0Quantizer;

impl Q4_0Quantizer {
    pub fn new() -> Self {
        Self
    }
}

impl QuantizerTrait for Q4_0Quantizer {
    fn quantize(&self, values: &[f32]) -> Result<Vec<u8>> {
        check_block_aligned(QuantizationType::Q4_0, values.len())?;
        let mut out = Vec::with_capacity(values.len() / QK * QuantizationType::Q4_0.type_size());
        for block in values.chunks_exact(QK) {
            let d = signed_absmax(block) / -8.0;
            let id = inverse(d);
            let mut q = [0u8; QK];
            for (slot, &x) in q.iter_mut().zip(block) {
                *slot = ((x * id + 8.5) as i32).clamp(0, 15) as u8;
            }
            push_f16(&mut out, d);
            pack_nibbles(&mut out, &q);
        }
        Ok(out)
    }

    fn dequantize(&self, data: &[u8]) -> Result<Vec<f32>> {
        check_payload(QuantizationType::Q4_0, data)?;
        let mut out = Vec::with_capacity(data.len() / 18 * QK);
        for block in data.chunks_exact(18) {
            let d = read_f16(block, 0);
            out.extend(unpack_nibbles(&block[2..]).iter().map(|&q| (q as f32 - 8.0) * d));
        }
        Ok(out)
    }

    fn quantization_type(&self) -> QuantizationType {
        QuantizationType::Q4_0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Q4_1Quantizer;

impl Q4_1Quantizer {
    pub fn new() -> Self {
        Self
    }
}

impl QuantizerTrait for Q4_1Quantizer {
    fn quantize(&self, values: &[f32]) -> Result<Vec<u8>> {
        check_block_aligned(QuantizationType::Q4_1, values.len())?;
        let mut out = Vec::with_capacity(values.len() / QK * QuantizationType::Q4_1.type_size());
        for block in values.chunks_exact(QK) {
            let (min, max) = min_max(block);
            let d = (max - min) / 15.0;
            let id = inverse(d);
            let mut q = [0u8; QK];
            for (slot, &x) in q.iter_mut().zip(block) {
                *slot = (((x - min) * id + 0.5) as i32).clamp(0, 15) as u8;
            }
            push_f16(&mut out, d);
            push_f16(&mut out, min);
            pack_nibbles(&mut out, &q);
        }
        Ok(out)
    }

    fn dequantize(&self, data: &[u8]) -> Result<Vec<f32>> {
        check_payload(QuantizationType::Q4_1, data)?;
        let mut out = Vec::with_capacity(data.len() / 20 * QK);
        for block in data.chunks_exact(20) {
            let d = read_f16(block, 0);
            let m = read_f16(block, 2);
            out.extend(unpack_nibbles(&block[4..]).iter().map(|&q| q as f32 * d + m));
        }
        Ok(out)
    }

    fn quantization_type(&self) -> QuantizationType {
        QuantizationType::Q4_1
    }
}
