//! Name rewrite engine: source name → zero or more destination names.

use serde::Serialize;
use tracing::{debug, warn};

use crate::classify::TensorClass;
use crate::config::ConversionMode;
use crate::error::{ConvertError, Result};
use crate::names;
use crate::rules::{Group, RuleTable};
use crate::split::QkvPart;

/// How a destination tensor's payload derives from its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransformKind {
    /// Source payload, unchanged.
    Passthrough,
    /// One third of a fused projection.
    FusedSplit(QkvPart),
}

/// Applies a [`RuleTable`] under a [`ConversionMode`].
#[derive(Debug, Clone)]
pub struct RewriteEngine {
    table: RuleTable,
    mode: ConversionMode,
    strict_mapping: bool,
}

impl RewriteEngine {
    /// Engine with the table that matches `mode`.
    pub fn new(mode: ConversionMode, strict_mapping: bool) -> Self {
        let table = match mode {
            ConversionMode::VisionEncoder => RuleTable::ovis2_encoder(),
            ConversionMode::TextOnly | ConversionMode::Multimodal => RuleTable::ovis2(),
        };
        Self::with_table(table, mode, strict_mapping)
    }

    pub fn with_table(table: RuleTable, mode: ConversionMode, strict_mapping: bool) -> Self {
        Self { table, mode, strict_mapping }
    }

    pub fn mode(&self) -> ConversionMode {
        self.mode
    }

    pub fn table(&self) -> &RuleTable {
        &self.table
    }

    fn keeps(&self, group: Group) -> bool {
        match group {
            Group::Text => self.mode.keeps_text(),
            Group::Vision => self.mode.keeps_vision(),
        }
    }

    /// Exact, prefix and substitution stages. `None` means the tensor is
    /// discarded in this mode.
    pub fn first_pass(&self, name: &str) -> Option<String> {
        let applied = self.table.apply(name);
        let group = applied.group()?;
        if !self.keeps(group) {
            debug!(name, mode = %self.mode, ?group, "discarding tensor outside conversion mode");
            return None;
        }
        applied.name().map(str::to_string)
    }

    /// Whether a first-pass name is already in the canonical scheme.
    pub fn is_mapped(&self, first_pass: &str) -> bool {
        names::canonical_name(first_pass).is_some()
    }

    /// Full rewrite of a source name.
    ///
    /// An empty result means "discard". A fused projection yields three
    /// pairs in query, key, value order.
    pub fn rewrite(&self, name: &str, class: TensorClass) -> Result<Vec<(String, TransformKind)>> {
        let Some(first) = self.first_pass(name) else {
            return Ok(Vec::new());
        };
        let canonical = match names::canonical_name(&first) {
            Some(c) => c,
            None if self.strict_mapping => return Err(ConvertError::UnmappedTensor(name.to_string())),
            None => {
                warn!(source = name, kept = %first, "no canonical mapping; keeping name verbatim");
                first
            }
        };

        if class.is_split_eligible() && names::has_fused_qkv(&canonical) {
            return Ok(QkvPart::ORDER
                .iter()
                .map(|&part| {
                    (names::replace_fused_qkv(&canonical, part.token()), TransformKind::FusedSplit(part))
                })
                .collect());
        }
        Ok(vec![(canonical, TransformKind::Passthrough)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;

    fn run(engine: &RewriteEngine, name: &str) -> Vec<(String, TransformKind)> {
        let class = engine.first_pass(name).map_or(TensorClass::Unclassified, |n| classify(&n));
        engine.rewrite(name, class).unwrap()
    }

    #[test]
    fn fused_vision_attention_splits_in_order() {
        let engine = RewriteEngine::new(ConversionMode::Multimodal, false);
        let out = run(&engine, "visual_tokenizer.backbone.trunk.blocks.3.attn.qkv.weight");
        insta::assert_debug_snapshot!(out, @r#"
        [
            (
                "clip.vision.model.bb.blk.3.attn_q.weight",
                FusedSplit(
                    Query,
                ),
            ),
            (
                "clip.vision.model.bb.blk.3.attn_k.weight",
                FusedSplit(
                    Key,
                ),
            ),
            (
                "clip.vision.model.bb.blk.3.attn_v.weight",
                FusedSplit(
                    Value,
                ),
            ),
        ]
        "#);
    }

    #[test]
    fn text_names_map_to_llama_scheme() {
        let engine = RewriteEngine::new(ConversionMode::TextOnly, true);
        assert_eq!(
            run(&engine, "llm.model.layers.2.self_attn.k_proj.bias"),
            vec![("blk.2.attn_k.bias".to_string(), TransformKind::Passthrough)]
        );
        assert_eq!(
            run(&engine, "llm.model.norm.weight"),
            vec![("output_norm.weight".to_string(), TransformKind::Passthrough)]
        );
    }

    #[test]
    fn mode_discards_other_group() {
        let text = RewriteEngine::new(ConversionMode::TextOnly, false);
        assert!(run(&text, "visual_tokenizer.backbone.trunk.blocks.0.mlp.fc1.weight").is_empty());
        assert!(run(&text, "vte.weight").is_empty());

        let encoder = RewriteEngine::new(ConversionMode::VisionEncoder, false);
        assert!(run(&encoder, "language_model.model.layers.0.mlp.up_proj.weight").is_empty());
        assert_eq!(run(&encoder, "vision_model.encoder.layers.1.self_attn.qkv.bias").len(), 3);
    }

    #[test]
    fn unmapped_names_kept_or_rejected() {
        let lenient = RewriteEngine::new(ConversionMode::Multimodal, false);
        assert_eq!(
            run(&lenient, "llm.model.mystery_buffer"),
            vec![("model.mystery_buffer".to_string(), TransformKind::Passthrough)]
        );
        let strict = RewriteEngine::new(ConversionMode::Multimodal, true);
        assert!(matches!(
            strict.rewrite("llm.model.mystery_buffer", TensorClass::Unclassified),
            Err(ConvertError::UnmappedTensor(_))
        ));
    }

    #[test]
    fn rewrite_is_idempotent_on_canonical_names() {
        let engine = RewriteEngine::new(ConversionMode::Multimodal, true);
        for name in [
            "token_embd.weight",
            "output.weight",
            "blk.7.ffn_gate.weight",
            "clip.vision.model.bb.blk.0.mlp.fc1.weight",
            "clip.vision.mm_proj.output.weight",
        ] {
            assert_eq!(run(&engine, name), vec![(name.to_string(), TransformKind::Passthrough)]);
        }
    }
}
