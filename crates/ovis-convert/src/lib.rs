//! Ovis2 safetensors checkpoint → GGUF conversion.
//!
//! The engine decides, for every source tensor, whether it is written, under
//! which name, whether it is split into query/key/value parts and at which
//! precision:
//!
//! - [`rules`] and [`rewrite`] turn source names into canonical names
//! - [`classify`] tags tensors and decides quantizability
//! - [`split`] slices fused attention projections
//! - [`precision`] picks the on-disk format and encodes payloads
//! - [`guard`] keeps destination names unique and within 63 bytes
//!
//! [`pipeline::Converter`] ties them to the [`checkpoint`] reader, the
//! [`metadata`] and [`vocab`] header writers and the GGUF writer.
//!
//! ```no_run
//! use ovis_convert::{ConversionMode, ConvertConfig, Converter, PrecisionMode};
//!
//! let converter = Converter::new(ConvertConfig::new(ConversionMode::Multimodal, PrecisionMode::Q8_0));
//! let conversion = converter.convert_dir(std::path::Path::new("Ovis2-1B"))?;
//! conversion.write_to_file(std::path::Path::new("ggml-model-q8_0.gguf"))?;
//! # Ok::<(), ovis_convert::ConvertError>(())
//! ```

pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod error;
pub mod guard;
pub mod metadata;
pub mod names;
pub mod pipeline;
pub mod precision;
pub mod rewrite;
pub mod rules;
pub mod split;
pub mod tensor;
pub mod vocab;

pub use classify::{TensorClass, VisionStage, classify};
pub use config::{ConversionMode, ConvertConfig, ModelHparams, ReservedPolicy};
pub use error::{ConvertError, Result};
pub use guard::{NameGuard, Outcome};
pub use pipeline::{Conversion, ConversionReport, Converter, DestinationTensor};
pub use precision::{PrecisionMode, select_precision};
pub use rewrite::{RewriteEngine, TransformKind};
pub use split::{QkvPart, split_fused_projection};
pub use tensor::{LazyTensor, SourceTensor, Tensor};
