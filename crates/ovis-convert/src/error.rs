use std::io;
use std::path::PathBuf;
use thiserror::Error;

use ovis_gguf::GgufWriteError;
use ovis_quantization::QuantizationError;

/// Fatal conversion failures.
///
/// Every variant aborts the run before an output file is written.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("fused projection `{name}` has shape {shape:?}; leading dimension must be divisible by 3")]
    FusedNotDivisible { name: String, shape: Vec<usize> },

    #[error("destination `{name}` produced twice (from `{first}` and `{second}`)")]
    DuplicateDestination { name: String, first: String, second: String },

    #[error("tensor `{0}` has no canonical mapping and strict mapping is enabled")]
    UnmappedTensor(String),

    #[error("tensor `{name}` appears in both {} and {}", .first.display(), .second.display())]
    DuplicateSourceTensor { name: String, first: PathBuf, second: PathBuf },

    #[error("tensor `{name}`: unsupported source dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("tensor `{name}`: payload is {actual} bytes, shape {shape:?} needs {expected}")]
    PayloadSize { name: String, shape: Vec<usize>, expected: usize, actual: usize },

    #[error("shard {}: {reason}", .path.display())]
    CorruptShard { path: PathBuf, reason: String },

    #[error("no safetensors shards found in {}", .0.display())]
    NoShards(PathBuf),

    #[error("config.json: missing required field `{0}`")]
    MissingConfig(String),

    #[error("config.json: {0}")]
    InvalidConfig(String),

    #[error("cannot determine vocabulary size: no `vocab_size` in config and no token embedding")]
    VocabUnresolved,

    #[error("token embedding `{name}` has shape {shape:?}; expected at least two dimensions")]
    EmbeddingRank { name: String, shape: Vec<usize> },

    #[error("tokenizer.json: {0}")]
    Tokenizer(String),

    #[error("unknown output type `{0}` (expected f32, f16, q8_0, q4_0, q4_1, q5_0, q5_1, q4_k or q6_k)")]
    UnknownPrecision(String),

    #[error(transparent)]
    Quantization(#[from] QuantizationError),

    #[error(transparent)]
    Write(#[from] GgufWriteError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConvertError>;

impl ConvertError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ConvertError::Io { path: path.into(), source }
    }
}
