//! Conversion pipeline: plan serially, encode in parallel, assemble the file.
//!
//! Planning walks the source tensors in checkpoint order and is the only
//! place destination names are decided, so the [`NameGuard`] needs no
//! locking. Payloads stay lazy through planning except for fused
//! projections, which are read once and sliced. Encoding then runs on the
//! rayon pool and the [`GgufWriter`] is filled in plan order.

use ovis_gguf::{GgufWriter, TensorDType, TensorEntry};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::classify::{TensorClass, classify, is_quantizable};
use crate::config::{ConversionMode, ConvertConfig, ModelHparams, ReservedPolicy, load_config};
use crate::error::{ConvertError, Result};
use crate::guard::{NameGuard, Outcome};
use crate::metadata::write_model_metadata;
use crate::names::TOKEN_EMBD;
use crate::precision::{PrecisionMode, encode, select_precision};
use crate::rewrite::{RewriteEngine, TransformKind};
use crate::split::split_fused_projection;
use crate::tensor::{LazyTensor, SourceTensor, Tensor};
use crate::vocab::{TokenizerModel, inspect_tokenizer, resolve_vocab_size, write_tokenizer_metadata};

/// Where a destination tensor's values come from.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Read from the checkpoint at encode time.
    Lazy(LazyTensor),
    /// Already materialized (one part of a split).
    Dense(Tensor),
    /// Read at encode time, then zero-padded to `rows` leading rows.
    Padded { tensor: LazyTensor, rows: usize },
}

/// A planned output tensor.
#[derive(Debug, Clone)]
pub struct DestinationTensor {
    pub name: String,
    pub source: String,
    pub class: TensorClass,
    pub format: TensorDType,
    pub shape: Vec<usize>,
    pub payload: Payload,
}

impl DestinationTensor {
    /// Materialize and encode into a writer entry.
    pub fn into_entry(self) -> Result<TensorEntry> {
        let tensor = match self.payload {
            Payload::Lazy(lazy) => lazy.materialize(&self.source)?,
            Payload::Dense(tensor) => tensor,
            Payload::Padded { tensor, rows } => tensor.materialize(&self.source)?.pad_rows(rows),
        };
        let data = encode(&tensor, self.format)?;
        debug!(name = %self.name, format = %self.format, bytes = data.len(), "encoded tensor");
        let shape = self.shape.iter().map(|&d| d as u64).collect();
        Ok(TensorEntry::new(self.name, shape, self.format, data))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rename {
    pub from: String,
    pub to: String,
}

/// Summary of one run, written next to the output as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub mode: ConversionMode,
    pub precision: PrecisionMode,
    pub reserved_policy: ReservedPolicy,
    pub source_tensors: usize,
    pub written_tensors: usize,
    pub discarded: usize,
    pub split_sources: usize,
    pub renamed: Vec<Rename>,
    pub unmapped: Vec<String>,
    pub dropped_reserved: Vec<String>,
    pub f16_fallbacks: Vec<String>,
    pub formats: BTreeMap<String, usize>,
    pub vocab_size: Option<u32>,
    pub tokenizer: Option<TokenizerModel>,
    pub metadata_entries: usize,
}

impl ConversionReport {
    fn new(config: &ConvertConfig) -> Self {
        Self {
            mode: config.mode,
            precision: config.precision,
            reserved_policy: config.reserved_policy(),
            source_tensors: 0,
            written_tensors: 0,
            discarded: 0,
            split_sources: 0,
            renamed: Vec::new(),
            unmapped: Vec::new(),
            dropped_reserved: Vec::new(),
            f16_fallbacks: Vec::new(),
            formats: BTreeMap::new(),
            vocab_size: None,
            tokenizer: None,
            metadata_entries: 0,
        }
    }
}

/// Output of [`Converter::plan`].
#[derive(Debug)]
pub struct Plan {
    pub tensors: Vec<DestinationTensor>,
    pub report: ConversionReport,
}

/// A finished conversion held in memory, not yet written.
#[derive(Debug)]
pub struct Conversion {
    pub writer: GgufWriter,
    pub report: ConversionReport,
}

impl Conversion {
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        self.writer.write_to_file(path)?;
        Ok(())
    }
}

pub struct Converter {
    config: ConvertConfig,
    engine: RewriteEngine,
}

impl Converter {
    pub fn new(config: ConvertConfig) -> Self {
        let engine = RewriteEngine::new(config.mode, config.strict_mapping);
        Self { config, engine }
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    pub fn engine(&self) -> &RewriteEngine {
        &self.engine
    }

    /// Leading dimension of the token embedding, if the sources carry one.
    pub fn embedding_rows(&self, sources: &[SourceTensor]) -> Option<usize> {
        sources
            .iter()
            .find(|s| self.engine.first_pass(&s.name).as_deref() == Some(TOKEN_EMBD))
            .and_then(|s| s.tensor.shape.first().copied())
    }

    /// Decide every destination tensor's name, format and payload.
    ///
    /// `vocab_size` pads a shorter token embedding with zero rows.
    pub fn plan(&self, sources: &[SourceTensor], vocab_size: Option<u32>) -> Result<Plan> {
        let requested = self.config.precision;
        let mut guard = NameGuard::new(self.config.reserved_policy());
        let mut report = ConversionReport::new(&self.config);
        let mut tensors = Vec::new();
        report.source_tensors = sources.len();
        report.vocab_size = vocab_size;

        for src in sources {
            let Some(first) = self.engine.first_pass(&src.name) else {
                debug!(name = %src.name, "discarded");
                report.discarded += 1;
                continue;
            };
            let class = classify(&first);
            let outputs = self.engine.rewrite(&src.name, class)?;
            if !self.engine.is_mapped(&first) {
                report.unmapped.push(src.name.clone());
            }

            let is_split = outputs.iter().any(|(_, k)| matches!(k, TransformKind::FusedSplit(_)));
            let mut parts = if is_split {
                let fused = src.tensor.materialize(&src.name)?;
                report.split_sources += 1;
                split_fused_projection(&src.name, &fused)?.map(Some)
            } else {
                [None, None, None]
            };

            for (dest, kind) in outputs {
                let name = match guard.validate(&dest, &src.name)? {
                    Outcome::Accept(name) => name,
                    Outcome::Drop => {
                        report.dropped_reserved.push(src.name.clone());
                        continue;
                    }
                };
                if name != dest {
                    report.renamed.push(Rename { from: dest, to: name.clone() });
                }

                let (shape, payload) = match kind {
                    TransformKind::FusedSplit(part) => match parts[part.index()].take() {
                        Some(t) => (t.shape.clone(), Payload::Dense(t)),
                        None => continue,
                    },
                    TransformKind::Passthrough if name == TOKEN_EMBD => {
                        let shape = &src.tensor.shape;
                        if shape.len() < 2 {
                            return Err(ConvertError::EmbeddingRank {
                                name: src.name.clone(),
                                shape: shape.clone(),
                            });
                        }
                        match vocab_size.map(|v| v as usize) {
                            Some(vocab) if shape[0] < vocab => {
                                info!(from = shape[0], to = vocab, "padding token embedding to vocab size");
                                let mut padded = shape.clone();
                                padded[0] = vocab;
                                (padded, Payload::Padded { tensor: src.tensor.clone(), rows: vocab })
                            }
                            _ => (shape.clone(), Payload::Lazy(src.tensor.clone())),
                        }
                    }
                    TransformKind::Passthrough => {
                        (src.tensor.shape.clone(), Payload::Lazy(src.tensor.clone()))
                    }
                };

                let format = select_precision(class, &shape, requested);
                if format == TensorDType::F16
                    && requested.target().is_quantized()
                    && is_quantizable(class, &shape)
                {
                    warn!(name = %name, ?shape, requested = %requested, "inner dimension not block aligned; writing F16");
                    report.f16_fallbacks.push(name.clone());
                }
                *report.formats.entry(format.to_string()).or_default() += 1;
                debug!(source = %src.name, dest = %name, ?class, %format, ?shape, "planned");

                tensors.push(DestinationTensor {
                    name,
                    source: src.name.clone(),
                    class,
                    format,
                    shape,
                    payload,
                });
            }
        }

        report.written_tensors = tensors.len();
        info!(
            sources = report.source_tensors,
            outputs = report.written_tensors,
            discarded = report.discarded,
            split = report.split_sources,
            renamed = report.renamed.len(),
            "planned conversion"
        );
        Ok(Plan { tensors, report })
    }

    /// Encode every planned tensor on the rayon pool, preserving plan order.
    pub fn encode(&self, tensors: Vec<DestinationTensor>) -> Result<Vec<TensorEntry>> {
        let start = Instant::now();
        let entries = tensors
            .into_par_iter()
            .map(DestinationTensor::into_entry)
            .collect::<Result<Vec<_>>>()?;
        info!(tensors = entries.len(), elapsed_ms = start.elapsed().as_millis() as u64, "encoded tensors");
        Ok(entries)
    }

    /// Plan, encode and assemble from already-loaded parts.
    pub fn convert_sources(
        &self,
        sources: &[SourceTensor],
        hparams: &ModelHparams,
        tokenizer_dir: Option<&Path>,
    ) -> Result<Conversion> {
        let mode = self.config.mode;
        let vocab_size = if mode.keeps_text() {
            let config_vocab = hparams.text.as_ref().and_then(|t| t.vocab_size);
            Some(resolve_vocab_size(config_vocab, self.embedding_rows(sources))?)
        } else {
            None
        };

        let Plan { tensors, mut report } = self.plan(sources, vocab_size)?;
        let entries = self.encode(tensors)?;

        let mut writer = GgufWriter::new();
        write_model_metadata(&mut writer, hparams, mode, self.config.precision, vocab_size)?;
        if mode.keeps_text()
            && let Some(dir) = tokenizer_dir
        {
            let info = inspect_tokenizer(dir)?;
            write_tokenizer_metadata(&mut writer, &info, vocab_size)?;
            report.tokenizer = info.vocab.is_some().then_some(info.model);
        }
        report.metadata_entries = writer.metadata.len();

        for entry in entries {
            writer.add_tensor(entry)?;
        }
        Ok(Conversion { writer, report })
    }

    /// Convert a model directory into an in-memory GGUF image.
    pub fn convert_dir(&self, dir: &Path) -> Result<Conversion> {
        let config = load_config(dir)?;
        let hparams = ModelHparams::from_json(&config, self.config.mode)?;
        let checkpoint = Checkpoint::open(dir)?;
        let sources = checkpoint.tensors()?;
        info!(
            mode = %self.config.mode,
            outtype = %self.config.precision,
            tensors = sources.len(),
            "converting checkpoint"
        );
        self.convert_sources(&sources, &hparams, Some(dir))
    }
}
