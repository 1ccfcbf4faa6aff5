//! GGUF header metadata for each conversion mode.

use ovis_gguf::{GgufWriter, MetadataValue};
use tracing::debug;

use crate::config::{ConversionMode, ModelHparams, TextHparams, VisionHparams};
use crate::error::{ConvertError, Result};
use crate::precision::PrecisionMode;

/// `general.quantization_version` written by llama.cpp-compatible tools.
pub const QUANTIZATION_VERSION: u32 = 2;

/// Keys every text-mode file must carry.
pub const REQUIRED_TEXT_KEYS: &[&str] = &[
    "general.architecture",
    "llama.context_length",
    "llama.embedding_length",
    "llama.block_count",
    "llama.attention.head_count",
    "llama.vocab_size",
    "general.file_type",
];

/// Keys every vision-encoder file must carry.
pub const REQUIRED_ENCODER_KEYS: &[&str] = &[
    "general.architecture",
    "clip.projector_type",
    "clip.vision.image_size",
    "clip.vision.patch_size",
    "clip.vision.embedding_length",
    "clip.vision.projection_dim",
    "clip.vision.block_count",
];

const IMAGE_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const IMAGE_STD: [f32; 3] = [0.5, 0.5, 0.5];

/// Write the header for `mode`. Returns the number of keys added.
pub fn write_model_metadata(
    writer: &mut GgufWriter,
    hparams: &ModelHparams,
    mode: ConversionMode,
    precision: PrecisionMode,
    vocab_size: Option<u32>,
) -> Result<usize> {
    let before = writer.metadata.len();
    match mode {
        ConversionMode::TextOnly | ConversionMode::Multimodal => {
            let text = hparams
                .text
                .as_ref()
                .ok_or_else(|| ConvertError::MissingConfig("text hyper-parameters".into()))?;
            let vocab_size = vocab_size.ok_or(ConvertError::VocabUnresolved)?;
            write_text_header(writer, hparams, text, precision, vocab_size)?;
            if mode == ConversionMode::Multimodal {
                let vision = hparams
                    .vision
                    .as_ref()
                    .ok_or_else(|| ConvertError::MissingConfig("vision hyper-parameters".into()))?;
                let projection_dim = hparams.text_hidden_size.unwrap_or(text.hidden_size);
                write_clip_vision_keys(writer, vision, projection_dim)?;
            }
        }
        ConversionMode::VisionEncoder => write_encoder_header(writer, hparams, precision)?,
    }
    let added = writer.metadata.len() - before;
    debug!(mode = %mode, keys = added, "model metadata written");
    Ok(added)
}

fn put(writer: &mut GgufWriter, key: &str, value: MetadataValue) -> Result<()> {
    writer.add_metadata(key, value)?;
    Ok(())
}

fn write_text_header(
    writer: &mut GgufWriter,
    hparams: &ModelHparams,
    text: &TextHparams,
    precision: PrecisionMode,
    vocab_size: u32,
) -> Result<()> {
    let name = hparams.model_name.clone().unwrap_or_else(|| "ovis2".to_string());
    put(writer, "general.architecture", MetadataValue::String("llama".into()))?;
    put(writer, "general.name", MetadataValue::String(name))?;
    put(writer, "llama.context_length", MetadataValue::U32(text.max_position_embeddings))?;
    put(writer, "llama.embedding_length", MetadataValue::U32(text.hidden_size))?;
    put(writer, "llama.block_count", MetadataValue::U32(text.num_hidden_layers))?;
    put(writer, "llama.feed_forward_length", MetadataValue::U32(text.intermediate_size))?;
    put(writer, "llama.attention.head_count", MetadataValue::U32(text.num_attention_heads))?;
    put(writer, "llama.attention.head_count_kv", MetadataValue::U32(text.num_key_value_heads))?;
    put(writer, "llama.attention.layer_norm_rms_epsilon", MetadataValue::F32(text.rms_norm_eps))?;
    // heads divide hidden_size; checked when the config was parsed
    let rope_dims = text.hidden_size / text.num_attention_heads;
    put(writer, "llama.rope.dimension_count", MetadataValue::U32(rope_dims))?;
    put(writer, "llama.rope.freq_base", MetadataValue::F32(text.rope_theta))?;
    put(writer, "llama.vocab_size", MetadataValue::U32(vocab_size))?;
    put(writer, "general.file_type", MetadataValue::U32(precision.file_type()))?;
    put(writer, "general.quantization_version", MetadataValue::U32(QUANTIZATION_VERSION))?;
    Ok(())
}

fn write_clip_vision_keys(
    writer: &mut GgufWriter,
    vision: &VisionHparams,
    projection_dim: u32,
) -> Result<()> {
    put(writer, "clip.vision.image_size", MetadataValue::U32(vision.image_size))?;
    put(writer, "clip.vision.patch_size", MetadataValue::U32(vision.patch_size))?;
    put(writer, "clip.vision.hidden_size", MetadataValue::U32(vision.hidden_size))?;
    put(writer, "clip.vision.projection_dim", MetadataValue::U32(projection_dim))?;
    Ok(())
}

fn write_encoder_header(
    writer: &mut GgufWriter,
    hparams: &ModelHparams,
    precision: PrecisionMode,
) -> Result<()> {
    let vision = hparams
        .vision
        .as_ref()
        .ok_or_else(|| ConvertError::MissingConfig("vision_config".into()))?;
    let required = |field: &str, value: Option<u32>| {
        value.ok_or_else(|| ConvertError::MissingConfig(format!("vision_config.{field}")))
    };
    let projection_dim = hparams
        .text_hidden_size
        .ok_or_else(|| ConvertError::MissingConfig("text_config.hidden_size".into()))?;

    put(writer, "general.architecture", MetadataValue::String("clip".into()))?;
    put(writer, "general.name", MetadataValue::String("ovis2-vision".into()))?;
    put(writer, "clip.projector_type", MetadataValue::String("ovis2".into()))?;
    put(writer, "clip.has_text_encoder", MetadataValue::Bool(false))?;
    put(writer, "clip.has_vision_encoder", MetadataValue::Bool(true))?;
    put(writer, "clip.has_llava_projector", MetadataValue::Bool(false))?;
    put(writer, "clip.vision.image_size", MetadataValue::U32(vision.image_size))?;
    put(writer, "clip.vision.patch_size", MetadataValue::U32(vision.patch_size))?;
    put(writer, "clip.vision.embedding_length", MetadataValue::U32(vision.hidden_size))?;
    put(
        writer,
        "clip.vision.feed_forward_length",
        MetadataValue::U32(required("intermediate_size", vision.intermediate_size)?),
    )?;
    put(writer, "clip.vision.projection_dim", MetadataValue::U32(projection_dim))?;
    put(
        writer,
        "clip.vision.block_count",
        MetadataValue::U32(required("num_hidden_layers", vision.num_hidden_layers)?),
    )?;
    put(
        writer,
        "clip.vision.attention.head_count",
        MetadataValue::U32(required("num_attention_heads", vision.num_attention_heads)?),
    )?;
    put(
        writer,
        "clip.vision.attention.layer_norm_epsilon",
        MetadataValue::F32(vision.layer_norm_eps),
    )?;
    put(writer, "clip.vision.image_mean", MetadataValue::F32Array(IMAGE_MEAN.to_vec()))?;
    put(writer, "clip.vision.image_std", MetadataValue::F32Array(IMAGE_STD.to_vec()))?;
    put(writer, "clip.use_gelu", MetadataValue::Bool(true))?;
    put(writer, "general.file_type", MetadataValue::U32(precision.file_type()))?;
    Ok(())
}

/// Keys from `required` that `present` lacks.
pub fn missing_keys<'a>(required: &[&'a str], present: impl Fn(&str) -> bool) -> Vec<&'a str> {
    required.iter().copied().filter(|k| !present(k)).collect()
}

/// The required-key list for `mode`.
pub fn required_keys(mode: ConversionMode) -> &'static [&'static str] {
    match mode {
        ConversionMode::VisionEncoder => REQUIRED_ENCODER_KEYS,
        ConversionMode::TextOnly | ConversionMode::Multimodal => REQUIRED_TEXT_KEYS,
    }
}
