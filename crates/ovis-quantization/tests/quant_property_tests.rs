//! Property-based tests for the block quantizers.
//!
//! Invariants tested:
//! - Output length is exactly `blocks * type_size` for every format
//! - Quantization is deterministic
//! - Dequantized values stay within one quantization step of the input
//!   (per block for the legacy formats, per super-block for the K formats)
//! - Unaligned input is always rejected

use ovis_quantization::{QuantizationType, QuantizerFactory};
use proptest::prelude::*;

// ── Strategies ───────────────────────────────────────────────────────────────

fn arb_qtype() -> impl Strategy<Value = QuantizationType> {
    prop::sample::select(QuantizationType::ALL.to_vec())
}

/// A format together with 1-8 whole blocks of input for it.
fn arb_input() -> impl Strategy<Value = (QuantizationType, Vec<f32>)> {
    (arb_qtype(), 1usize..=8).prop_flat_map(|(qtype, n)| {
        (Just(qtype), prop::collection::vec(-50.0f32..50.0, n * qtype.block_size()))
    })
}

/// Largest reconstruction error a single block may show for `qtype`.
///
/// One rounding step of the block's scale, plus slack for storing the scale
/// and minimum as f16.
fn step_bound(qtype: QuantizationType, block: &[f32]) -> f32 {
    let amax = block.iter().fold(0.0f32, |a, &x| a.max(x.abs()));
    let (lo, hi) = block.iter().fold((f32::MAX, f32::MIN), |(l, h), &x| (l.min(x), h.max(x)));
    let step = match qtype {
        QuantizationType::Q8_0 => amax / 127.0,
        QuantizationType::Q4_0 => amax / 8.0,
        QuantizationType::Q5_0 => amax / 16.0,
        QuantizationType::Q4_1 => (hi - lo) / 15.0,
        QuantizationType::Q5_1 => (hi - lo) / 31.0,
        // sub-block scales are rounded to 6 bits, minimums stored as offsets
        QuantizationType::Q4_K => amax / 4.0,
        QuantizationType::Q6_K => amax / 12.0,
    };
    step + amax * 2e-3 + 1e-6
}

// ── Properties ───────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn output_length_matches_block_count((qtype, values) in arb_input()) {
        let bytes = QuantizerFactory::create(qtype).quantize(&values).unwrap();
        prop_assert_eq!(bytes.len(), values.len() / qtype.block_size() * qtype.type_size());
    }

    #[test]
    fn quantization_is_deterministic((qtype, values) in arb_input()) {
        let q = QuantizerFactory::create(qtype);
        prop_assert_eq!(q.quantize(&values).unwrap(), q.quantize(&values).unwrap());
    }

    #[test]
    fn reconstruction_within_one_step((qtype, values) in arb_input()) {
        let q = QuantizerFactory::create(qtype);
        let restored = q.dequantize(&q.quantize(&values).unwrap()).unwrap();
        prop_assert_eq!(restored.len(), values.len());
        let block_len = qtype.block_size();
        for (block, rblock) in values.chunks(block_len).zip(restored.chunks(block_len)) {
            let bound = step_bound(qtype, block);
            for (a, b) in block.iter().zip(rblock) {
                prop_assert!((a - b).abs() <= bound, "{qtype}: {a} vs {b} (bound {bound})");
            }
        }
    }

    #[test]
    fn unaligned_input_is_rejected(qtype in arb_qtype(), extra in 1usize..32) {
        let values = vec![1.0f32; qtype.block_size() + extra];
        prop_assert!(QuantizerFactory::create(qtype).quantize(&values).is_err());
    }
}
