//! 256-element super-block formats.
//!
//! Q4_K (144 bytes): `d: f16`, `dmin: f16`, `scales: [u8; 12]`, `qs: [u8; 128]`.
//! Eight 32-element sub-blocks each carry a 6-bit scale and a 6-bit minimum,
//! value = `d * sc * q - dmin * m`. Every 64 elements share 32 bytes of `qs`:
//! the first 32 in low nibbles, the next 32 in high nibbles.
//!
//! Q6_K (210 bytes): `ql: [u8; 128]`, `qh: [u8; 64]`, `scales: [i8; 16]`,
//! `d: f16`. Sixteen 16-element sub-blocks each carry a signed 8-bit scale,
//! value = `d * sc * (q - 32)` with `q` split into 4 low and 2 high bits.

use half::f16;

use crate::utils::{
    check_block_aligned, check_payload, inverse, min_max, push_f16, read_f16, signed_absmax,
};
use crate::{QK_K, QuantizationType, QuantizerTrait, Result};

const Q4K_BYTES: usize = 144;
const Q6K_BYTES: usize = 210;

/// Round through f16 so quantization uses the scale a reader will see.
#[inline]
fn as_stored(v: f32) -> f32 {
    f16::from_f32(v).to_f32()
}

#[inline]
fn nearest(v: f32) -> i32 {
    v.round() as i32
}

/// Pack eight 6-bit scales and minimums into the 12-byte Q4_K header.
fn pack_scale_min(ls: &[u8; 8], lm: &[u8; 8]) -> [u8; 12] {
    let mut packed = [0u8; 12];
    for j in 0..4 {
        packed[j] = (ls[j] & 0x3f) | ((ls[j + 4] & 0x30) << 2);
        packed[j + 4] = (lm[j] & 0x3f) | ((lm[j + 4] & 0x30) << 2);
        packed[j + 8] = (ls[j + 4] & 0x0f) | ((lm[j + 4] & 0x0f) << 4);
    }
    packed
}

fn scale_min(packed: &[u8], j: usize) -> (u8, u8) {
    if j < 4 {
        (packed[j] & 63, packed[j + 4] & 63)
    } else {
        (
            (packed[j + 4] & 0x0f) | ((packed[j - 4] >> 6) << 4),
            (packed[j + 4] >> 4) | ((packed[j] >> 6) << 4),
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Q4KQuantizer;

impl Q4KQuantizer {
    pub fn new() -> Self {
        Self
    }
}

impl QuantizerTrait for Q4KQuantizer {
    fn quantize(&self, values: &[f32]) -> Result<Vec<u8>> {
        check_block_aligned(QuantizationType::Q4_K, values.len())?;
        let mut out = Vec::with_capacity(values.len() / QK_K * Q4K_BYTES);

        for block in values.chunks_exact(QK_K) {
            let mut scales = [0.0f32; 8];
            let mut mins = [0.0f32; 8];
            for (j, sub) in block.chunks_exact(32).enumerate() {
                // the minimum is stored as a non-negative offset
                let (lo, hi) = min_max(sub);
                let lo = lo.min(0.0);
                scales[j] = (hi - lo) / 15.0;
                mins[j] = -lo;
            }
            let max_scale = scales.iter().fold(0.0f32, |a, &s| a.max(s));
            let max_min = mins.iter().fold(0.0f32, |a, &m| a.max(m));
            let inv_scale = inverse(max_scale / 63.0);
            let inv_min = inverse(max_min / 63.0);

            let mut ls = [0u8; 8];
            let mut lm = [0u8; 8];
            for j in 0..8 {
                ls[j] = nearest(inv_scale * scales[j]).clamp(0, 63) as u8;
                lm[j] = nearest(inv_min * mins[j]).clamp(0, 63) as u8;
            }
            let d = as_stored(max_scale / 63.0);
            let dmin = as_stored(max_min / 63.0);

            let mut q = [0u8; QK_K];
            for (j, sub) in block.chunks_exact(32).enumerate() {
                let sd = d * ls[j] as f32;
                if sd == 0.0 {
                    continue;
                }
                let dm = dmin * lm[j] as f32;
                for (slot, &x) in q[j * 32..(j + 1) * 32].iter_mut().zip(sub) {
                    *slot = nearest((x + dm) / sd).clamp(0, 15) as u8;
                }
            }

            push_f16(&mut out, d);
            push_f16(&mut out, dmin);
            out.extend_from_slice(&pack_scale_min(&ls, &lm));
            for chunk in q.chunks_exact(64) {
                out.extend((0..32).map(|l| chunk[l] | (chunk[l + 32] << 4)));
            }
        }
        Ok(out)
    }

    fn dequantize(&self, data: &[u8]) -> Result<Vec<f32>> {
        check_payload(QuantizationType::Q4_K, data)?;
        let mut out = Vec::with_capacity(data.len() / Q4K_BYTES * QK_K);
        for block in data.chunks_exact(Q4K_BYTES) {
            let d = read_f16(block, 0);
            let dmin = read_f16(block, 2);
            let packed = &block[4..16];
            for (pair, qs) in block[16..].chunks_exact(32).enumerate() {
                let (sc1, m1) = scale_min(packed, 2 * pair);
                let (sc2, m2) = scale_min(packed, 2 * pair + 1);
                let (d1, dm1) = (d * sc1 as f32, dmin * m1 as f32);
                let (d2, dm2) = (d * sc2 as f32, dmin * m2 as f32);
                out.extend(qs.iter().map(|&b| d1 * (b & 0x0f) as f32 - dm1));
                out.extend(qs.iter().map(|&b| d2 * (b >> 4) as f32 - dm2));
            }
        }
        Ok(out)
    }

    fn quantization_type(&self) -> QuantizationType {
        QuantizationType::Q4_K
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Q6KQuantizer;

impl Q6KQuantizer {
    pub fn new() -> Self {
        Self
    }
}

impl QuantizerTrait for Q6KQuantizer {
    fn quantize(&self, values: &[f32]) -> Result<Vec<u8>> {
        check_block_aligned(QuantizationType::Q6_K, values.len())?;
        let mut out = Vec::with_capacity(values.len() / QK_K * Q6K_BYTES);

        for block in values.chunks_exact(QK_K) {
            // per sub-block: the signed extreme lands on q = 0
            let mut scales = [0.0f32; 16];
            for (ib, sub) in block.chunks_exact(16).enumerate() {
                scales[ib] = signed_absmax(sub) / -32.0;
            }
            let max_scale = signed_absmax(&scales);
            let iscale = inverse(max_scale / -128.0);

            let mut sc = [0i8; 16];
            for (s, &scale) in sc.iter_mut().zip(&scales) {
                *s = nearest(iscale * scale).clamp(-128, 127) as i8;
            }
            let d = as_stored(inverse(iscale));

            let mut q = [32u8; QK_K];
            for (ib, sub) in block.chunks_exact(16).enumerate() {
                let sd = d * sc[ib] as f32;
                if sd == 0.0 {
                    continue;
                }
                for (slot, &x) in q[ib * 16..(ib + 1) * 16].iter_mut().zip(sub) {
                    *slot = (nearest(x / sd) + 32).clamp(0, 63) as u8;
                }
            }

            let mut ql = [0u8; 128];
            let mut qh = [0u8; 64];
            for half in 0..2 {
                let (n, lo, hi) = (half * 128, half * 64, half * 32);
                for l in 0..32 {
                    let (q1, q2, q3, q4) = (q[n + l], q[n + l + 32], q[n + l + 64], q[n + l + 96]);
                    ql[lo + l] = (q1 & 0x0f) | ((q3 & 0x0f) << 4);
                    ql[lo + l + 32] = (q2 & 0x0f) | ((q4 & 0x0f) << 4);
                    qh[hi + l] = (q1 >> 4) | ((q2 >> 4) << 2) | ((q3 >> 4) << 4) | ((q4 >> 4) << 6);
                }
            }

            out.extend_from_slice(&ql);
            out.extend_from_slice(&qh);
            out.extend(sc.iter().map(|&s| s as u8));
            push_f16(&mut out, d);
        }
        Ok(out)
    }

    fn dequantize(&self, data: &[u8]) -> Result<Vec<f32>> {
        check_payload(QuantizationType::Q6_K, data)?;
        let mut out = Vec::with_capacity(data.len() / Q6K_BYTES * QK_K);
        for block in data.chunks_exact(Q6K_BYTES) {
            let (ql, rest) = block.split_at(128);
            let (qh, rest) = rest.split_at(64);
            let sc: Vec<f32> = rest[..16].iter().map(|&s| s as i8 as f32).collect();
            let d = read_f16(rest, 16);

            let mut y = [0.0f32; QK_K];
            for half in 0..2 {
                let (n, lo, hi, s) = (half * 128, half * 64, half * 32, half * 8);
                for l in 0..32 {
                    let is = s + l / 16;
                    let (a, b, h) = (ql[lo + l], ql[lo + l + 32], qh[hi + l]);
                    let q1 = ((a & 0x0f) | ((h & 3) << 4)) as i32 - 32;
                    let q2 = ((b & 0x0f) | (((h >> 2) & 3) << 4)) as i32 - 32;
                    let q3 = ((a >> 4) | (((h >> 4) & 3) << 4)) as i32 - 32;
                    let q4 = ((b >> 4) | (((h >> 6) & 3) << 4)) as i32 - 32;
                    y[n + l] = d * sc[is] * q1 as f32;
                    y[n + l + 32] = d * sc[is + 2] * q2 as f32;
                    y[n + l + 64] = d * sc[is + 4] * q3 as f32;
                    y[n + l + 96] = d * sc[is + 6] * q4 as f32;
                }
            }
            out.extend_from_slice(&y);
        }
        Ok(out)
    }

    fn quantization_type(&self) -> QuantizationType {
        QuantizationType::Q6_K
    }
}
