//! Ovis2 checkpoint to GGUF converter
//!
//! Converts a sharded Ovis2 safetensors checkpoint into a single GGUF file,
//! renaming tensors into the llama / `clip.vision.*` scheme, splitting fused
//! vision attention projections and optionally quantizing weights.
//!
//! # Usage
//!
//! ```bash
//! # Language model plus vision tower, f16 weights
//! ovis2gguf --input Ovis2-1B/
//!
//! # Language model only, Q8_0
//! ovis2gguf --input Ovis2-1B/ --mode text-only --outtype q8_0 --output ovis2-1b-q8_0.gguf
//!
//! # Standalone vision encoder + projector (mmproj)
//! ovis2gguf --input Ovis2-1B-hf/ --mode vision-encoder --outtype f32
//!
//! # Fail on unknown tensor names and re-read the result
//! ovis2gguf --input Ovis2-1B/ --strict --verify
//! ```
//!
//! A `<output>.meta.json` sidecar with the conversion report is written next
//! to the GGUF file.

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use serde_json::json;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use ovis_convert::metadata::{missing_keys, required_keys};
use ovis_convert::{
    Conversion, ConversionMode, ConversionReport, ConvertConfig, Converter, PrecisionMode,
    ReservedPolicy,
};
use ovis_gguf::{MAX_TENSOR_NAME_LEN, read_index_file};

/// Ovis2 safetensors to GGUF converter
#[derive(Parser, Debug)]
#[command(name = "ovis2gguf")]
#[command(about = "Convert Ovis2 safetensors checkpoints to GGUF")]
#[command(version)]
struct Args {
    /// Model directory with config.json and *.safetensors shards
    #[arg(short, long)]
    input: PathBuf,

    /// Output GGUF file
    ///
    /// Defaults to `ggml-model-<outtype>.gguf` (or `mmproj-model-<outtype>.gguf`
    /// in vision-encoder mode) inside the input directory.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output precision: f32, f16, q8_0, q4_0, q4_1, q5_0, q5_1, q4_k or q6_k
    #[arg(long, default_value = "f16")]
    outtype: PrecisionMode,

    /// Which parts of the model to convert
    #[arg(long, value_enum, default_value_t = ConversionMode::Multimodal)]
    mode: ConversionMode,

    /// Fail on tensor names with no canonical mapping instead of keeping them
    #[arg(short, long)]
    strict: bool,

    /// Policy for a second producer of a reserved tensor name
    ///
    /// Defaults to strict when vision tensors are written, first-writer-wins otherwise.
    #[arg(long, value_enum)]
    reserved_policy: Option<ReservedPolicy>,

    /// Re-read the written file and check its index
    #[arg(long)]
    verify: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    ensure!(args.input.is_dir(), "input is not a directory: {}", args.input.display());
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input, args.mode, args.outtype));

    let config = ConvertConfig {
        mode: args.mode,
        precision: args.outtype,
        strict_mapping: args.strict,
        reserved_policy: args.reserved_policy,
    };
    tracing::info!("Input: {}", args.input.display());
    tracing::info!("Output: {}", output.display());
    tracing::info!(
        "Mode: {}, outtype: {}, reserved policy: {:?}",
        config.mode,
        config.precision,
        config.reserved_policy()
    );

    let conversion = Converter::new(config)
        .convert_dir(&args.input)
        .with_context(|| format!("failed to convert {}", args.input.display()))?;

    conversion
        .write_to_file(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    write_sidecar_metadata(&output, &args.input, &conversion.report)?;

    if args.verify {
        verify_output(&output, &conversion).context("verification failed")?;
        tracing::info!("Verification passed");
    }

    let report = &conversion.report;
    tracing::info!("Conversion complete!");
    tracing::info!(
        "  Tensors: {} written from {} sources ({} discarded, {} split, {} renamed)",
        report.written_tensors,
        report.source_tensors,
        report.discarded,
        report.split_sources,
        report.renamed.len()
    );
    if !report.unmapped.is_empty() {
        tracing::warn!("  {} tensors kept without a canonical name", report.unmapped.len());
    }
    tracing::info!("  Output: {}", output.display());
    Ok(())
}

/// `ggml-model-<outtype>.gguf` or `mmproj-model-<outtype>.gguf` in `input`.
fn default_output(input: &Path, mode: ConversionMode, outtype: PrecisionMode) -> PathBuf {
    let prefix = match mode {
        ConversionMode::VisionEncoder => "mmproj",
        ConversionMode::TextOnly | ConversionMode::Multimodal => "ggml",
    };
    input.join(format!("{prefix}-model-{outtype}.gguf"))
}

fn sidecar_path(output: &Path) -> PathBuf {
    output.with_extension("gguf.meta.json")
}

/// Write the conversion report next to the output file.
fn write_sidecar_metadata(output: &Path, source: &Path, report: &ConversionReport) -> Result<()> {
    let metadata = json!({
        "source": source.display().to_string(),
        "format": "gguf",
        "version": ovis_gguf::GGUF_VERSION,
        "conversion_tool": "ovis2gguf",
        "conversion_version": env!("CARGO_PKG_VERSION"),
        "report": report,
    });

    let meta_path = sidecar_path(output);
    let meta_json = serde_json::to_string_pretty(&metadata).context("Failed to serialize metadata")?;
    fs::write(&meta_path, meta_json)
        .with_context(|| format!("Failed to write metadata file: {}", meta_path.display()))?;
    tracing::debug!("Wrote sidecar metadata: {}", meta_path.display());
    Ok(())
}

/// Re-read `path` and compare it with what was assembled in memory.
fn verify_output(path: &Path, conversion: &Conversion) -> Result<()> {
    let index = read_index_file(path)?;
    let writer = &conversion.writer;

    ensure!(
        index.tensors.len() == writer.tensor_count(),
        "tensor count mismatch: file has {}, expected {}",
        index.tensors.len(),
        writer.tensor_count()
    );
    ensure!(
        index.metadata.len() == writer.metadata.len(),
        "metadata count mismatch: file has {}, expected {}",
        index.metadata.len(),
        writer.metadata.len()
    );

    let mut seen = HashSet::new();
    for t in &index.tensors {
        ensure!(t.name.len() <= MAX_TENSOR_NAME_LEN, "tensor name too long: {}", t.name);
        ensure!(seen.insert(t.name.as_str()), "duplicate tensor name: {}", t.name);
    }

    let missing = missing_keys(required_keys(conversion.report.mode), |k| index.get(k).is_some());
    if !missing.is_empty() {
        bail!("missing required metadata keys: {}", missing.join(", "));
    }
    Ok(())
}
