//! Conversion settings and model hyper-parameters.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use tracing::warn;

use crate::error::{ConvertError, Result};
use crate::precision::PrecisionMode;

/// Which parts of the checkpoint end up in the output file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConversionMode {
    /// Language model only; vision tensors are discarded.
    TextOnly,
    /// Language model plus the vision tower under `clip.vision.*`.
    Multimodal,
    /// Standalone vision encoder and projector (`mmproj`).
    VisionEncoder,
}

impl ConversionMode {
    pub fn keeps_text(self) -> bool {
        !matches!(self, ConversionMode::VisionEncoder)
    }

    pub fn keeps_vision(self) -> bool {
        !matches!(self, ConversionMode::TextOnly)
    }

    /// Reserved-name policy used when none is configured: strict whenever
    /// vision tensors are written.
    pub fn default_reserved_policy(self) -> ReservedPolicy {
        if self.keeps_vision() { ReservedPolicy::Strict } else { ReservedPolicy::FirstWriterWins }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ConversionMode::TextOnly => "text-only",
            ConversionMode::Multimodal => "multimodal",
            ConversionMode::VisionEncoder => "vision-encoder",
        }
    }
}

impl fmt::Display for ConversionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when a second source tensor maps onto a reserved name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ReservedPolicy {
    /// Keep the first producer, drop later ones.
    FirstWriterWins,
    /// Any second producer is a fatal duplicate.
    Strict,
}

/// Settings for one conversion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertConfig {
    pub mode: ConversionMode,
    pub precision: PrecisionMode,
    /// Unmapped tensor names are fatal instead of kept verbatim.
    pub strict_mapping: bool,
    /// Overrides [`ConversionMode::default_reserved_policy`].
    pub reserved_policy: Option<ReservedPolicy>,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            mode: ConversionMode::Multimodal,
            precision: PrecisionMode::F16,
            strict_mapping: false,
            reserved_policy: None,
        }
    }
}

impl ConvertConfig {
    pub fn new(mode: ConversionMode, precision: PrecisionMode) -> Self {
        Self { mode, precision, ..Self::default() }
    }

    pub fn reserved_policy(&self) -> ReservedPolicy {
        self.reserved_policy.unwrap_or_else(|| self.mode.default_reserved_policy())
    }
}

// ---------------------------------------------------------------------------
// Hyper-parameters
// ---------------------------------------------------------------------------

/// Language-model hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextHparams {
    pub hidden_size: u32,
    pub num_hidden_layers: u32,
    pub num_attention_heads: u32,
    pub intermediate_size: u32,
    pub num_key_value_heads: u32,
    pub max_position_embeddings: u32,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    pub vocab_size: Option<u32>,
}

/// Vision-tower hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisionHparams {
    pub image_size: u32,
    pub patch_size: u32,
    pub hidden_size: u32,
    pub layer_norm_eps: f32,
    pub intermediate_size: Option<u32>,
    pub num_hidden_layers: Option<u32>,
    pub num_attention_heads: Option<u32>,
}

/// Everything the converter reads from `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelHparams {
    pub architecture: Option<String>,
    pub model_name: Option<String>,
    pub text: Option<TextHparams>,
    /// Hidden size of the language model, used as the vision projection width.
    pub text_hidden_size: Option<u32>,
    pub vision: Option<VisionHparams>,
}

pub const ENCODER_ARCHITECTURE: &str = "Ovis2ForConditionalGeneration";

/// Read `config.json` from a model directory.
pub fn load_config(dir: &Path) -> Result<Value> {
    let path = dir.join("config.json");
    let raw = std::fs::read(&path).map_err(|e| ConvertError::io(&path, e))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Ordered list of JSON objects searched for a key.
struct Sections<'a>(Vec<&'a Value>);

impl<'a> Sections<'a> {
    fn new(root: &'a Value, keys: &[&str]) -> Self {
        Self(keys.iter().filter_map(|k| root.get(*k)).filter(|v| v.is_object()).collect())
    }

    fn with_root(mut self, root: &'a Value) -> Self {
        self.0.push(root);
        self
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.0.iter().find_map(|section| section.get(key).filter(|v| !v.is_null()))
    }

    fn u32(&self, key: &str) -> Result<Option<u32>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| ConvertError::InvalidConfig(format!("`{key}` is not a u32: {v}"))),
        }
    }

    fn f32(&self, key: &str) -> Result<Option<f32>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(|n| Some(n as f32))
                .ok_or_else(|| ConvertError::InvalidConfig(format!("`{key}` is not a number: {v}"))),
        }
    }

    fn required_u32(&self, key: &str) -> Result<u32> {
        self.u32(key)?.ok_or_else(|| ConvertError::MissingConfig(key.to_string()))
    }

    fn u32_or(&self, key: &str, default: u32) -> Result<u32> {
        Ok(self.u32(key)?.unwrap_or_else(|| {
            warn!(field = key, default, "config field missing; using default");
            default
        }))
    }

    fn f32_or(&self, key: &str, default: f32) -> Result<f32> {
        Ok(self.f32(key)?.unwrap_or_else(|| {
            warn!(field = key, default, "config field missing; using default");
            default
        }))
    }
}

impl ModelHparams {
    /// Extract the hyper-parameters `mode` needs, enforcing its required fields.
    pub fn from_json(config: &Value, mode: ConversionMode) -> Result<Self> {
        let architecture = config
            .get("architectures")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(str::to_string);
        let model_name = config
            .get("_name_or_path")
            .or_else(|| config.get("model_type"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let text_sections = Sections::new(config, &["llm_config", "text_config"]).with_root(config);
        let text_hidden_size = text_sections.u32("hidden_size")?;

        let text = if mode.keeps_text() {
            Some(parse_text(&text_sections)?)
        } else {
            None
        };

        let vision = match mode {
            ConversionMode::TextOnly => None,
            ConversionMode::Multimodal => Some(parse_vision(config)?),
            ConversionMode::VisionEncoder => {
                if architecture.as_deref() != Some(ENCODER_ARCHITECTURE) {
                    return Err(ConvertError::InvalidConfig(format!(
                        "vision-encoder mode expects architecture {ENCODER_ARCHITECTURE}, found {}",
                        architecture.as_deref().unwrap_or("none")
                    )));
                }
                if config.get("vision_config").is_none_or(|v| !v.is_object()) {
                    return Err(ConvertError::MissingConfig("vision_config".into()));
                }
                let text_config = Sections::new(config, &["text_config"]);
                if text_config.0.is_empty() {
                    return Err(ConvertError::MissingConfig("text_config".into()));
                }
                text_config.required_u32("hidden_size").map_err(|_| {
                    ConvertError::MissingConfig("text_config.hidden_size".into())
                })?;
                let vision = parse_vision(config)?;
                for (field, value) in [
                    ("vision_config.intermediate_size", vision.intermediate_size),
                    ("vision_config.num_hidden_layers", vision.num_hidden_layers),
                    ("vision_config.num_attention_heads", vision.num_attention_heads),
                ] {
                    if value.is_none() {
                        return Err(ConvertError::MissingConfig(field.into()));
                    }
                }
                Some(vision)
            }
        };

        let text_hidden_size = match mode {
            ConversionMode::VisionEncoder => Sections::new(config, &["text_config"]).u32("hidden_size")?,
            _ => text_hidden_size,
        };

        Ok(Self { architecture, model_name, text, text_hidden_size, vision })
    }
}

fn parse_text(s: &Sections<'_>) -> Result<TextHparams> {
    let hidden_size = s.required_u32("hidden_size")?;
    let num_hidden_layers = s.required_u32("num_hidden_layers")?;
    let num_attention_heads = s.required_u32("num_attention_heads")?;
    let intermediate_size = s.required_u32("intermediate_size")?;
    if num_attention_heads == 0 || hidden_size % num_attention_heads != 0 {
        return Err(ConvertError::InvalidConfig(format!(
            "hidden_size {hidden_size} is not divisible by num_attention_heads {num_attention_heads}"
        )));
    }
    Ok(TextHparams {
        hidden_size,
        num_hidden_layers,
        num_attention_heads,
        intermediate_size,
        num_key_value_heads: s.u32_or("num_key_value_heads", num_attention_heads)?,
        max_position_embeddings: s.u32_or("max_position_embeddings", 4096)?,
        rms_norm_eps: s.f32_or("rms_norm_eps", 1e-6)?,
        rope_theta: s.f32_or("rope_theta", 10_000.0)?,
        vocab_size: s.u32("vocab_size")?,
    })
}

fn parse_vision(config: &Value) -> Result<VisionHparams> {
    let backbone = config
        .get("visual_tokenizer_config")
        .and_then(|v| v.get("backbone_config"))
        .filter(|v| v.is_object());
    let mut sections = Sections::new(config, &["vision_config"]);
    if let Some(b) = backbone {
        sections.0.push(b);
    }
    if sections.0.is_empty() {
        warn!("no vision_config in config.json; vision metadata uses defaults");
    }
    Ok(VisionHparams {
        image_size: sections.u32_or("image_size", 336)?,
        patch_size: sections.u32_or("patch_size", 14)?,
        hidden_size: sections.u32_or("hidden_size", 1024)?,
        layer_norm_eps: sections.f32_or("layer_norm_eps", 1e-6)?,
        intermediate_size: sections.u32("intermediate_size")?,
        num_hidden_layers: sections.u32("num_hidden_layers")?,
        num_attention_heads: sections.u32("num_attention_heads")?,
    })
}
