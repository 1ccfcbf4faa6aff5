//! Tensor classification on first-pass names.

use serde::Serialize;

use crate::names::{OUTPUT_TENSOR, TOKEN_EMBD, VISION_PROJECTION_TENSOR};

/// Position of a tensor inside the vision backbone, outside the blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VisionStage {
    PatchEmbedding,
    PositionEmbedding,
    PostNorm,
    Head,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TensorClass {
    TextEmbedding,
    TextOutput,
    VisionProjector,
    VisionBackbone(VisionStage),
    VisionBlockAttention,
    VisionBlockMLP,
    VisionBlockNorm,
    Unclassified,
}

impl TensorClass {
    pub fn is_vision(self) -> bool {
        matches!(
            self,
            TensorClass::VisionProjector
                | TensorClass::VisionBackbone(_)
                | TensorClass::VisionBlockAttention
                | TensorClass::VisionBlockMLP
                | TensorClass::VisionBlockNorm
        )
    }

    /// Embedding tables: never quantized.
    pub fn is_embedding(self) -> bool {
        matches!(
            self,
            TensorClass::TextEmbedding
                | TensorClass::VisionBackbone(VisionStage::PatchEmbedding)
                | TensorClass::VisionBackbone(VisionStage::PositionEmbedding)
        )
    }

    /// Only attention tensors inside a vision block may carry a fused projection.
    pub fn is_split_eligible(self) -> bool {
        self == TensorClass::VisionBlockAttention
    }
}

/// Quantizable iff rank ≥ 2 and not an embedding table.
///
/// Rank-1 tensors (biases, normalization vectors) are always kept at full
/// precision.
pub fn is_quantizable(class: TensorClass, shape: &[usize]) -> bool {
    shape.len() >= 2 && !class.is_embedding()
}

fn vision_block_class(rest: &str) -> TensorClass {
    let module = rest.split_once('.').map_or(rest, |(_, m)| m);
    if module.starts_with("attn") {
        TensorClass::VisionBlockAttention
    } else if module.starts_with("mlp.") || module.starts_with("ffn_") {
        TensorClass::VisionBlockMLP
    } else if module.starts_with("norm") || module.starts_with("ln") {
        TensorClass::VisionBlockNorm
    } else {
        TensorClass::VisionBackbone(VisionStage::Other)
    }
}

fn vision_stage(name: &str) -> VisionStage {
    if name.contains("patch_embd") {
        VisionStage::PatchEmbedding
    } else if name.contains("pos_embd") || name.contains("position_embd") {
        VisionStage::PositionEmbedding
    } else if name.contains("post_t_norm") || name.contains("post_ln") {
        VisionStage::PostNorm
    } else if name.starts_with("clip.vision.model.head.") {
        VisionStage::Head
    } else {
        VisionStage::Other
    }
}

/// Classify a tensor by its first-pass name.
pub fn classify(name: &str) -> TensorClass {
    if name == TOKEN_EMBD || name.ends_with("embed_tokens.weight") {
        return TensorClass::TextEmbedding;
    }
    if name == OUTPUT_TENSOR || name.ends_with("lm_head.weight") {
        return TensorClass::TextOutput;
    }
    if name == VISION_PROJECTION_TENSOR
        || name.starts_with("clip.vision.mm_proj.")
        || name.starts_with("mm.")
    {
        return TensorClass::VisionProjector;
    }

    let block_rest = name
        .strip_prefix("clip.vision.model.bb.blk.")
        .or_else(|| name.strip_prefix("v.blk."));
    if let Some(rest) = block_rest {
        return vision_block_class(rest);
    }
    if name.starts_with("clip.vision.") || name.starts_with("v.") {
        return TensorClass::VisionBackbone(vision_stage(name));
    }
    TensorClass::Unclassified
}
