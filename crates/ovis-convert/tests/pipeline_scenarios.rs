//! End-to-end planning scenarios over in-memory source tensors.

use ovis_convert::pipeline::{Payload, Plan};
use ovis_convert::{
    ConversionMode, ConvertConfig, ConvertError, Converter, LazyTensor, NameGuard, Outcome,
    PrecisionMode, ReservedPolicy, SourceTensor, TensorClass, classify,
};
use ovis_gguf::TensorDType;

fn source(name: &str, shape: &[usize]) -> SourceTensor {
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|i| i as f32 / n as f32 - 0.5).collect();
    SourceTensor::new(name, LazyTensor::from_f32(shape.to_vec(), &values))
}

fn plan(mode: ConversionMode, precision: PrecisionMode, sources: &[SourceTensor]) -> Plan {
    Converter::new(ConvertConfig::new(mode, precision)).plan(sources, None).unwrap()
}

fn tensor<'a>(plan: &'a Plan, name: &str) -> &'a ovis_convert::DestinationTensor {
    plan.tensors
        .iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("`{name}` not planned"))
}

#[test]
fn fused_vision_qkv_splits_into_three_square_projections() {
    let name = "visual_tokenizer.backbone.trunk.blocks.3.attn.qkv.weight";
    let src = source(name, &[384, 128]);
    let engine = ovis_convert::RewriteEngine::new(ConversionMode::Multimodal, true);
    let first = engine.first_pass(name).unwrap();
    assert_eq!(first, "clip.vision.model.bb.blk.3.attn_qkv.weight");
    assert_eq!(classify(&first), TensorClass::VisionBlockAttention);

    let plan = plan(ConversionMode::Multimodal, PrecisionMode::F16, std::slice::from_ref(&src));
    let names: Vec<&str> = plan.tensors.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "clip.vision.model.bb.blk.3.attn_q.weight",
            "clip.vision.model.bb.blk.3.attn_k.weight",
            "clip.vision.model.bb.blk.3.attn_v.weight",
        ]
    );

    // concatenating q, k, v along axis 0 gives the source back
    let mut joined = Vec::new();
    for t in &plan.tensors {
        assert_eq!(t.shape, vec![128, 128]);
        match &t.payload {
            Payload::Dense(part) => joined.extend_from_slice(&part.data),
            other => panic!("expected dense payload, got {other:?}"),
        }
    }
    assert_eq!(joined, src.tensor.materialize(name).unwrap().data);
}

#[test]
fn fused_qkv_with_indivisible_rows_is_fatal() {
    let err = Converter::new(ConvertConfig::new(ConversionMode::Multimodal, PrecisionMode::F16))
        .plan(&[source("visual_tokenizer.backbone.trunk.blocks.0.attn.qkv.weight", &[100, 32])], None)
        .unwrap_err();
    assert!(matches!(err, ConvertError::FusedNotDivisible { .. }));
}

#[test]
fn lm_head_and_visual_embedding_coexist() {
    let plan = plan(
        ConversionMode::Multimodal,
        PrecisionMode::F16,
        &[source("llm.lm_head.weight", &[64, 32]), source("vte.weight", &[16, 32])],
    );
    assert_eq!(tensor(&plan, "output.weight").shape, vec![64, 32]);
    assert_eq!(tensor(&plan, "clip.vision.mm_proj.output.weight").shape, vec![16, 32]);
    assert!(plan.report.dropped_reserved.is_empty());
}

#[test]
fn eighty_char_name_is_rehashed_identically_on_rerun() {
    let name = format!("clip.vision.model.head.{}.weight", "0".repeat(50));
    assert_eq!(name.len(), 80);

    let run = || {
        let mut guard = NameGuard::new(ReservedPolicy::Strict);
        match guard.validate(&name, "src").unwrap() {
            Outcome::Accept(n) => n,
            Outcome::Drop => panic!("unexpected drop"),
        }
    };
    let first = run();
    assert!(first.len() <= 63);
    assert!(first.starts_with("tensor."));
    assert!(first.ends_with(".weight"));
    assert_eq!(first, run());
}

#[test]
fn long_names_are_rehashed_during_planning() {
    let long = format!("visual_tokenizer.head.{}.weight", "9".repeat(60));
    let plan = plan(ConversionMode::Multimodal, PrecisionMode::F32, &[source(&long, &[4, 4])]);
    assert_eq!(plan.report.renamed.len(), 1);
    let renamed = &plan.report.renamed[0];
    assert_eq!(renamed.from, format!("clip.vision.model.head.{}.weight", "9".repeat(60)));
    assert_eq!(plan.tensors[0].name, renamed.to);
    assert!(renamed.to.len() <= 63);
}

#[test]
fn reserved_duplicate_first_writer_wins_in_text_mode() {
    let sources = [source("llm.lm_head.weight", &[8, 32]), source("lm_head.weight", &[8, 32])];
    let plan = plan(ConversionMode::TextOnly, PrecisionMode::F16, &sources);
    let outputs: Vec<_> = plan.tensors.iter().filter(|t| t.name == "output.weight").collect();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].source, "llm.lm_head.weight");
    assert_eq!(plan.report.dropped_reserved, vec!["lm_head.weight".to_string()]);
}

#[test]
fn reserved_policy_override() {
    let sources = [source("llm.lm_head.weight", &[8, 32]), source("lm_head.weight", &[8, 32])];

    let mut strict = ConvertConfig::new(ConversionMode::TextOnly, PrecisionMode::F16);
    strict.reserved_policy = Some(ReservedPolicy::Strict);
    assert!(matches!(
        Converter::new(strict).plan(&sources, None),
        Err(ConvertError::DuplicateDestination { ref name, .. }) if name == "output.weight"
    ));

    let mut lenient = ConvertConfig::new(ConversionMode::Multimodal, PrecisionMode::F16);
    lenient.reserved_policy = Some(ReservedPolicy::FirstWriterWins);
    let plan = Converter::new(lenient).plan(&sources, None).unwrap();
    assert_eq!(plan.tensors.len(), 1);
}

#[test]
fn non_reserved_duplicates_are_always_fatal() {
    let sources = [
        source("llm.model.layers.0.mlp.up_proj.weight", &[4, 32]),
        source("model.layers.0.mlp.up_proj.weight", &[4, 32]),
    ];
    let mut config = ConvertConfig::new(ConversionMode::TextOnly, PrecisionMode::F16);
    config.reserved_policy = Some(ReservedPolicy::FirstWriterWins);
    assert!(matches!(
        Converter::new(config).plan(&sources, None),
        Err(ConvertError::DuplicateDestination { .. })
    ));
}

#[test]
fn quantizability_guard_under_block_request() {
    let sources = [
        source("llm.model.embed_tokens.weight", &[64, 32]),
        source("llm.model.layers.0.self_attn.q_proj.weight", &[32, 32]),
        source("llm.model.layers.0.self_attn.q_proj.bias", &[32]),
        source("llm.model.layers.0.input_layernorm.weight", &[32]),
        source("visual_tokenizer.backbone.preprocessor.patchifier.proj.weight", &[32, 3, 2, 32]),
        source("visual_tokenizer.backbone.trunk.blocks.0.mlp.fc1.weight", &[64, 32]),
        source("vte.weight", &[16, 40]),
    ];
    let plan = plan(ConversionMode::Multimodal, PrecisionMode::Q4_0, &sources);

    for t in &plan.tensors {
        if t.shape.len() < 2 || t.class.is_embedding() {
            assert_eq!(t.format, TensorDType::F32, "{} must stay full precision", t.name);
        } else {
            assert_ne!(t.format, TensorDType::F32, "{} must not be written as F32", t.name);
        }
    }
    assert_eq!(tensor(&plan, "blk.0.attn_q.weight").format, TensorDType::Q4_0);
    assert_eq!(tensor(&plan, "clip.vision.mm_proj.output.weight").format, TensorDType::F16);
    assert_eq!(plan.report.f16_fallbacks, vec!["clip.vision.mm_proj.output.weight".to_string()]);
}

#[test]
fn text_only_mode_discards_vision() {
    let sources = [
        source("llm.model.norm.weight", &[32]),
        source("visual_tokenizer.backbone.trunk.blocks.0.attn.qkv.weight", &[96, 32]),
        source("vte.weight", &[16, 32]),
    ];
    let plan = plan(ConversionMode::TextOnly, PrecisionMode::F16, &sources);
    let names: Vec<&str> = plan.tensors.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["output_norm.weight"]);
    assert_eq!(plan.report.discarded, 2);
    assert_eq!(plan.report.split_sources, 0);
}

#[test]
fn k_format_request_falls_back_below_super_block_width() {
    let sources = [
        source("llm.model.layers.0.self_attn.q_proj.weight", &[4, 256]),
        source("llm.model.layers.0.mlp.up_proj.weight", &[4, 64]),
        source("llm.model.layers.0.input_layernorm.weight", &[256]),
    ];
    let plan = plan(ConversionMode::TextOnly, PrecisionMode::Q6_K, &sources);
    assert_eq!(tensor(&plan, "blk.0.attn_q.weight").format, TensorDType::Q6_K);
    assert_eq!(tensor(&plan, "blk.0.ffn_up.weight").format, TensorDType::F16);
    assert_eq!(tensor(&plan, "blk.0.attn_norm.weight").format, TensorDType::F32);
    assert_eq!(plan.report.f16_fallbacks, vec!["blk.0.ffn_up.weight".to_string()]);
}

#[test]
fn token_embedding_below_rank_two_is_rejected() {
    let config = ConvertConfig::new(ConversionMode::TextOnly, PrecisionMode::F16);
    for shape in [&[][..], &[32][..]] {
        let err = Converter::new(config.clone())
            .plan(&[source("llm.model.embed_tokens.weight", shape)], Some(40))
            .unwrap_err();
        assert!(
            matches!(&err, ConvertError::EmbeddingRank { name, shape: s }
                if name == "llm.model.embed_tokens.weight" && s.as_slice() == shape),
            "{err}"
        );
    }
}
