//! Fused query/key/value projection splitting.

use serde::Serialize;

use crate::error::{ConvertError, Result};
use crate::tensor::Tensor;

/// One third of a fused projection.
///
/// The partition order along the leading axis is fixed: query rows first,
/// then key, then value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QkvPart {
    Query,
    Key,
    Value,
}

impl QkvPart {
    pub const ORDER: [QkvPart; 3] = [QkvPart::Query, QkvPart::Key, QkvPart::Value];

    /// Name token replacing `attn_qkv`.
    pub const fn token(self) -> &'static str {
        match self {
            QkvPart::Query => "attn_q",
            QkvPart::Key => "attn_k",
            QkvPart::Value => "attn_v",
        }
    }

    pub const fn index(self) -> usize {
        match self {
            QkvPart::Query => 0,
            QkvPart::Key => 1,
            QkvPart::Value => 2,
        }
    }
}

/// Split a fused projection `[3c, ...]` into three `[c, ...]` tensors along
/// axis 0, in query, key, value order.
pub fn split_fused_projection(name: &str, tensor: &Tensor) -> Result<[Tensor; 3]> {
    let rows = tensor.shape.first().copied().unwrap_or(0);
    if rows == 0 || rows % 3 != 0 {
        return Err(ConvertError::FusedNotDivisible {
            name: name.to_string(),
            shape: tensor.shape.clone(),
        });
    }
    let c = rows / 3;
    Ok(QkvPart::ORDER.map(|part| {
        let start = part.index() * c;
        tensor.slice_rows(start, start + c)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_weight_rows_in_order() {
        let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let t = Tensor::new(vec![6, 2], data);
        let [q, k, v] = split_fused_projection("w", &t).unwrap();
        assert_eq!(q, Tensor::new(vec![2, 2], vec![0.0, 1.0, 2.0, 3.0]));
        assert_eq!(k, Tensor::new(vec![2, 2], vec![4.0, 5.0, 6.0, 7.0]));
        assert_eq!(v, Tensor::new(vec![2, 2], vec![8.0, 9.0, 10.0, 11.0]));
    }

    #[test]
    fn splits_bias_vectors() {
        let t = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
        let parts = split_fused_projection("b", &t).unwrap();
        assert_eq!(parts.map(|p| p.data), [vec![1.0], vec![2.0], vec![3.0]]);
    }

    #[test]
    fn rejects_indivisible_leading_dim() {
        let t = Tensor::new(vec![4, 2], vec![0.0; 8]);
        assert!(matches!(
            split_fused_projection("blk.attn_qkv.weight", &t),
            Err(ConvertError::FusedNotDivisible { ref shape, .. }) if shape == &vec![4, 2]
        ));
        let scalar = Tensor::new(vec![], vec![0.0]);
        assert!(split_fused_projection("s", &scalar).is_err());
    }
}
