//! 5-bit block formats.
//!
//! The low four bits of each element are packed like the 4-bit formats; the
//! fifth bit of element `j` lives in bit `j` of a little-endian `u32` (`qh`).
//!
//! Q5_0 (22 bytes): `d: f16`, `qh: u32`, `qs: [u8; 16]`, value = `(q - 16) * d`.
//! Q5_1 (24 bytes): `d: f16`, `m: f16`, `qh: u32`, `qs: [u8; 16]`, value = `q * d + m`.

use crate::utils::{
    check_block_aligned, check_payload, inverse, min_max, push_f16, read_f16, signed_absmax,
};
use crate::{QK, QuantizationType, QuantizerTrait, Result};

const HALF: usize = QK / 2;

fn pack(out: &mut Vec<u8>, q: &[u8; QK]) {
    let qh = q
        .iter()
        .enumerate()
        .fold(0u32, |acc, (j, &v)| acc | (u32::from(v >> 4) << j));
    out.extend_from_slice(&qh.to_le_bytes());
    out.extend((0..HALF).map(|j| (q[j] & 0x0f) | ((q[j + HALF] & 0x0f) << 4)));
}

fn unpack(block: &[u8]) -> [u8; QK] {
    let qh = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    let qs = &block[4..];
    let mut q = [0u8; QK];
    for j in 0..HALF {
        let hi0 = ((qh >> j) & 1) as u8;
        let hi1 = ((qh >> (j + HALF)) & 1) as u8;
        q[j] = (qs[j] & 0x0f) | (hi0 << 4);
        q[j + HALF] = (qs[j] >> 4) | (hi1 << 4);
    }
    q
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Q5_0Quantizer;

impl Q5_0Quantizer {
    pub fn new() -> Self {
        Self
    }
}

impl QuantizerTrait for Q5_0Quantizer {
    fn quantize(&self, values: &[f32]) -> Result<Vec<u8>> {
        check_block_aligned(QuantizationType::Q5_0, values.len())?;
        let mut out = Vec::with_capacity(values.len() / QK * QuantizationType::Q5_0.type_size());
        for block in values.chunks_exact(QK) {
            let d = signed_absmax(block) / -16.0;
            let id = inverse(d);
            let mut q = [0u8; QK];
            for (slot, &x) in q.iter_mut().zip(block) {
                *slot = ((x * id + 16.5) as i32).clamp(0, 31) as u8;
            }
            push_f16(&mut out, d);
            pack(&mut out, &q);
        }
        Ok(out)
    }

    fn dequantize(&self, data: &[u8]) -> Result<Vec<f32>> {
        check_payload(QuantizationType::Q5_0, data)?;
        let mut out = Vec::with_capacity(data.len() / 22 * QK);
        for block in data.chunks_exact(22) {
            let d = read_f16(block, 0);
            out.extend(unpack(&block[2..]).iter().map(|&q| (q as f32 - 16.0) * d));
        }
        Ok(out)
    }

    fn quantization_type(&self) -> QuantizationType {
        QuantizationType::Q5_0
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Q5_1Quantizer;

impl Q5_1Quantizer {
    pub fn new() -> Self {
        Self
    }
}

impl QuantizerTrait for Q5_1Quantizer {
    fn quantize(&self, values: &[f32]) -> Result<Vec<u8>> {
        check_block_aligned(QuantizationType::Q5_1, values.len())?;
        let mut out = Vec::with_capacity(values.len() / QK * QuantizationType::Q5_1.type_size());
        for block in values.chunks_exact(QK) {
            let (min, max) = min_max(block);
            let d = (max - min) / 31.0;
            let id = inverse(d);
            let mut q = [0u8; QK];
            for (slot, &x) in q.iter_mut().zip(block) {
                *slot = (((x - min) * id + 0.5) as i32).clamp(0, 31) as u8;
            }
            push_f16(&mut out, d);
            push_f16(&mut out, min);
            pack(&mut out, &q);
        }
        Ok(out)
    }

    fn dequantize(&self, data: &[u8]) -> Result<Vec<f32>> {
        check_payload(QuantizationType::Q5_1, data)?;
        let mut out = Vec::with_capacity(data.len() / 24 * QK);
        for block in data.chunks_exact(24) {
            let d = read_f16(block, 0);
            let m = read_f16(block, 2);
            out.extend(unpack(&block[4..]).iter().map(|&q| q as f32 * d + m));
        }
        Ok(out)
    }

    fn quantization_type(&self) -> QuantizationType {
        QuantizationType::Q5_1
    }
}
