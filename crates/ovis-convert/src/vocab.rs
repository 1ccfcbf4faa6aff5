//! Vocabulary size resolution and tokenizer metadata.

use ovis_gguf::{GgufWriter, MetadataValue};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{ConvertError, Result};

/// Pick the vocabulary size: the config value, else the embedding row count.
pub fn resolve_vocab_size(config: Option<u32>, embedding_rows: Option<usize>) -> Result<u32> {
    if let Some(n) = config {
        return Ok(n);
    }
    let rows = embedding_rows.ok_or(ConvertError::VocabUnresolved)?;
    let n = u32::try_from(rows)
        .map_err(|_| ConvertError::InvalidConfig(format!("embedding has {rows} rows")))?;
    warn!(vocab_size = n, "no vocab_size in config; using token embedding rows");
    Ok(n)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerModel {
    /// SentencePiece (`tokenizer.model` present).
    Llama,
    /// Byte-level BPE fallback.
    Gpt2,
}

impl TokenizerModel {
    pub const fn as_str(self) -> &'static str {
        match self {
            TokenizerModel::Llama => "llama",
            TokenizerModel::Gpt2 => "gpt2",
        }
    }
}

/// ggml token types (`tokenizer.ggml.token_type`).
pub mod token_type {
    pub const NORMAL: i32 = 1;
    pub const UNKNOWN: i32 = 2;
    pub const CONTROL: i32 = 3;
    pub const USER_DEFINED: i32 = 4;
    pub const UNUSED: i32 = 5;
    pub const BYTE: i32 = 6;
}

/// Token list from `tokenizer.json`, indexed by id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TokenVocab {
    pub tokens: Vec<String>,
    pub token_types: Vec<i32>,
    /// Piece scores (unigram models only).
    pub scores: Option<Vec<f32>>,
    /// BPE merges as `"left right"`.
    pub merges: Vec<String>,
}

impl TokenVocab {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Fill up to `size` entries with unused `[PAD<id>]` tokens.
    pub fn pad_to(&mut self, size: usize) {
        for id in self.tokens.len()..size {
            self.tokens.push(format!("[PAD{id}]"));
            self.token_types.push(token_type::UNUSED);
            if let Some(scores) = &mut self.scores {
                scores.push(0.0);
            }
        }
    }
}

/// What the model directory says about its tokenizer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenizerInfo {
    pub model: TokenizerModel,
    pub spm_path: Option<PathBuf>,
    pub add_bos_token: Option<bool>,
    pub add_eos_token: Option<bool>,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    #[serde(skip)]
    pub vocab: Option<TokenVocab>,
}

fn read_json(path: &Path) -> Result<Option<Value>> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read(path).map_err(|e| ConvertError::io(path, e))?;
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// `"<s>"` or `{"content": "<s>", ...}`.
fn token_content(v: &Value) -> Option<&str> {
    v.as_str().or_else(|| v.get("content").and_then(Value::as_str))
}

/// content → id from `added_tokens_decoder` and `tokenizer.json` `added_tokens`.
fn added_token_ids(tokenizer_config: Option<&Value>, tokenizer_json: Option<&Value>) -> HashMap<String, u32> {
    let mut ids = HashMap::new();
    if let Some(json) = tokenizer_json
        && let Some(list) = json.get("added_tokens").and_then(Value::as_array)
    {
        for tok in list {
            let id = tok.get("id").and_then(Value::as_u64).and_then(|n| u32::try_from(n).ok());
            if let (Some(id), Some(content)) = (id, token_content(tok)) {
                ids.insert(content.to_string(), id);
            }
        }
    }
    // the decoder map is authoritative when both exist
    if let Some(decoder) = tokenizer_config
        .and_then(|c| c.get("added_tokens_decoder"))
        .and_then(Value::as_object)
    {
        for (id, tok) in decoder {
            if let (Ok(id), Some(content)) = (id.parse::<u32>(), token_content(tok)) {
                ids.insert(content.to_string(), id);
            }
        }
    }
    ids
}

fn is_byte_token(piece: &str) -> bool {
    piece.len() == 6 && piece.starts_with("<0x") && piece.ends_with('>')
}

/// Read the token list of a `tokenizer.json`.
///
/// Unigram vocabularies are `[piece, score]` lists indexed by position; every
/// other model type maps piece to id. Added tokens override the base entry for
/// their id. Gaps in the id range become unused `[PAD<id>]` tokens.
pub fn token_vocab(tokenizer_json: &Value) -> Result<Option<TokenVocab>> {
    let Some(model) = tokenizer_json.get("model") else {
        return Ok(None);
    };
    let unigram = model.get("type").and_then(Value::as_str) == Some("Unigram");
    let malformed = |what: &str| ConvertError::Tokenizer(format!("malformed {what}"));

    let mut by_id: BTreeMap<u32, (String, i32, f32)> = BTreeMap::new();
    if unigram {
        let pieces = model.get("vocab").and_then(Value::as_array).ok_or_else(|| malformed("vocab"))?;
        let unk_id = model.get("unk_id").and_then(Value::as_u64);
        for (id, entry) in pieces.iter().enumerate() {
            let piece = entry.get(0).and_then(Value::as_str).ok_or_else(|| malformed("piece"))?;
            let score = entry.get(1).and_then(Value::as_f64).unwrap_or(0.0) as f32;
            let kind = if unk_id == Some(id as u64) {
                token_type::UNKNOWN
            } else if is_byte_token(piece) {
                token_type::BYTE
            } else {
                token_type::NORMAL
            };
            let id = u32::try_from(id).map_err(|_| malformed("vocab size"))?;
            by_id.insert(id, (piece.to_string(), kind, score));
        }
    } else if let Some(vocab) = model.get("vocab").and_then(Value::as_object) {
        for (piece, id) in vocab {
            let id = id.as_u64().and_then(|n| u32::try_from(n).ok()).ok_or_else(|| malformed(piece.as_str()))?;
            let kind = if is_byte_token(piece) { token_type::BYTE } else { token_type::NORMAL };
            by_id.insert(id, (piece.clone(), kind, 0.0));
        }
    }

    if let Some(added) = tokenizer_json.get("added_tokens").and_then(Value::as_array) {
        for tok in added {
            let id = tok.get("id").and_then(Value::as_u64).and_then(|n| u32::try_from(n).ok());
            if let (Some(id), Some(content)) = (id, token_content(tok)) {
                let special = tok.get("special").and_then(Value::as_bool).unwrap_or(false);
                let kind = if special { token_type::CONTROL } else { token_type::USER_DEFINED };
                by_id.insert(id, (content.to_string(), kind, 0.0));
            }
        }
    }

    let Some(&last) = by_id.keys().next_back() else {
        return Ok(None);
    };
    let mut vocab = TokenVocab {
        scores: unigram.then(Vec::new),
        ..TokenVocab::default()
    };
    for id in 0..=last {
        match by_id.remove(&id) {
            Some((piece, kind, score)) => {
                vocab.tokens.push(piece);
                vocab.token_types.push(kind);
                if let Some(scores) = &mut vocab.scores {
                    scores.push(score);
                }
            }
            None => vocab.pad_to(id as usize + 1),
        }
    }

    // merges are either "a b" strings or ["a", "b"] pairs
    if let Some(merges) = model.get("merges").and_then(Value::as_array) {
        for merge in merges {
            let joined = match merge {
                Value::String(s) => s.clone(),
                Value::Array(pair) => pair.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(" "),
                _ => return Err(malformed("merges")),
            };
            vocab.merges.push(joined);
        }
    }
    Ok(Some(vocab))
}

/// Inspect the tokenizer files of a model directory.
pub fn inspect_tokenizer(dir: &Path) -> Result<TokenizerInfo> {
    let spm_path = [dir.join("tokenizer.model"), dir.join("llm").join("tokenizer.model")]
        .into_iter()
        .find(|p| p.is_file());
    let model = if spm_path.is_some() {
        TokenizerModel::Llama
    } else {
        warn!(dir = %dir.display(), "no tokenizer.model found; falling back to gpt2 tokenizer");
        TokenizerModel::Gpt2
    };

    let tokenizer_config = read_json(&dir.join("tokenizer_config.json"))?;
    let special_tokens = read_json(&dir.join("special_tokens_map.json"))?;
    let tokenizer_json = read_json(&dir.join("tokenizer.json"))?;

    let flag = |key: &str| tokenizer_config.as_ref().and_then(|c| c.get(key)).and_then(Value::as_bool);
    let ids = added_token_ids(tokenizer_config.as_ref(), tokenizer_json.as_ref());
    let special_id = |key: &str| -> Option<u32> {
        let content = special_tokens
            .as_ref()
            .and_then(|m| m.get(key))
            .or_else(|| tokenizer_config.as_ref().and_then(|c| c.get(key)))
            .and_then(token_content)?;
        let id = ids.get(content).copied();
        if id.is_none() {
            debug!(token = key, content, "special token not among added tokens");
        }
        id
    };

    let vocab = match &tokenizer_json {
        Some(json) => token_vocab(json)?,
        None => None,
    };
    if vocab.is_none() {
        warn!(dir = %dir.display(), "no token list in tokenizer.json; tokenizer.ggml.model not written");
    }

    Ok(TokenizerInfo {
        model,
        add_bos_token: flag("add_bos_token"),
        add_eos_token: flag("add_eos_token"),
        bos_token_id: special_id("bos_token"),
        eos_token_id: special_id("eos_token"),
        spm_path,
        vocab,
    })
}

/// Add the `tokenizer.ggml.*` keys. Keys already present are left alone.
///
/// The model key and token arrays are only written together: without a token
/// list only the special-token ids and flags go out. The list is padded to
/// `vocab_size` when it is shorter.
pub fn write_tokenizer_metadata(
    writer: &mut GgufWriter,
    info: &TokenizerInfo,
    vocab_size: Option<u32>,
) -> Result<usize> {
    let mut entries = Vec::new();
    if let Some(vocab) = &info.vocab {
        let mut vocab = vocab.clone();
        if let Some(size) = vocab_size.map(|n| n as usize) {
            if vocab.len() > size {
                warn!(tokens = vocab.len(), vocab_size = size, "tokenizer has more tokens than the model");
            }
            vocab.pad_to(size);
        }
        entries.push(("tokenizer.ggml.model", MetadataValue::String(info.model.as_str().into())));
        entries.push(("tokenizer.ggml.tokens", MetadataValue::StringArray(vocab.tokens)));
        entries.push(("tokenizer.ggml.token_type", MetadataValue::I32Array(vocab.token_types)));
        if let Some(scores) = vocab.scores {
            entries.push(("tokenizer.ggml.scores", MetadataValue::F32Array(scores)));
        }
        if !vocab.merges.is_empty() {
            entries.push(("tokenizer.ggml.merges", MetadataValue::StringArray(vocab.merges)));
        }
    }
    if let Some(v) = info.add_bos_token {
        entries.push(("tokenizer.ggml.add_bos_token", MetadataValue::Bool(v)));
    }
    if let Some(v) = info.add_eos_token {
        entries.push(("tokenizer.ggml.add_eos_token", MetadataValue::Bool(v)));
    }
    if let Some(id) = info.bos_token_id {
        entries.push(("tokenizer.ggml.bos_token_id", MetadataValue::U32(id)));
    }
    if let Some(id) = info.eos_token_id {
        entries.push(("tokenizer.ggml.eos_token_id", MetadataValue::U32(id)));
    }

    let mut added = 0;
    for (key, value) in entries {
        if writer.has_metadata(key) {
            debug!(key, "tokenizer key already set; skipping");
            continue;
        }
        writer.add_metadata(key, value)?;
        added += 1;
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, v: &Value) {
        fs::write(dir.join(name), serde_json::to_vec(v).unwrap()).unwrap();
    }

    #[test]
    fn vocab_prefers_config() {
        assert_eq!(resolve_vocab_size(Some(151_936), Some(151_643)).unwrap(), 151_936);
        assert_eq!(resolve_vocab_size(None, Some(1000)).unwrap(), 1000);
        assert!(matches!(resolve_vocab_size(None, None), Err(ConvertError::VocabUnresolved)));
    }

    #[test]
    fn spm_model_in_llm_subdir() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("llm")).unwrap();
        fs::write(tmp.path().join("llm/tokenizer.model"), b"spm").unwrap();
        let info = inspect_tokenizer(tmp.path()).unwrap();
        assert_eq!(info.model, TokenizerModel::Llama);
        assert_eq!(info.spm_path, Some(tmp.path().join("llm/tokenizer.model")));
    }

    #[test]
    fn special_tokens_resolved_from_added_tokens() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "tokenizer_config.json",
            &json!({
                "add_bos_token": false,
                "add_eos_token": true,
                "added_tokens_decoder": {
                    "151643": { "content": "<|endoftext|>", "special": true },
                    "151645": { "content": "<|im_end|>", "special": true }
                }
            }),
        );
        write(
            tmp.path(),
            "special_tokens_map.json",
            &json!({ "bos_token": "<|endoftext|>", "eos_token": { "content": "<|im_end|>" } }),
        );
        let info = inspect_tokenizer(tmp.path()).unwrap();
        assert_eq!(info.model, TokenizerModel::Gpt2);
        assert_eq!(info.add_bos_token, Some(false));
        assert_eq!(info.add_eos_token, Some(true));
        assert_eq!(info.bos_token_id, Some(151_643));
        assert_eq!(info.eos_token_id, Some(151_645));
    }

    #[test]
    fn tokenizer_json_is_a_fallback_for_ids() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "special_tokens_map.json", &json!({ "eos_token": "</s>" }));
        write(tmp.path(), "tokenizer.json", &json!({ "added_tokens": [{ "id": 2, "content": "</s>" }] }));
        let info = inspect_tokenizer(tmp.path()).unwrap();
        assert_eq!(info.eos_token_id, Some(2));
        assert_eq!(info.bos_token_id, None);
    }

    fn info(vocab: Option<TokenVocab>) -> TokenizerInfo {
        TokenizerInfo {
            model: TokenizerModel::Gpt2,
            spm_path: None,
            add_bos_token: Some(true),
            add_eos_token: None,
            bos_token_id: Some(1),
            eos_token_id: None,
            vocab,
        }
    }

    fn bpe_json() -> Value {
        json!({
            "model": {
                "type": "BPE",
                "vocab": { "a": 0, "b": 1, "ab": 2, "<0x0A>": 4 },
                "merges": ["a b", ["ab", "b"]]
            },
            "added_tokens": [{ "id": 5, "content": "<|im_end|>", "special": true }]
        })
    }

    #[test]
    fn bpe_vocab_is_ordered_by_id_with_gaps_padded() {
        let vocab = token_vocab(&bpe_json()).unwrap().unwrap();
        assert_eq!(vocab.tokens, ["a", "b", "ab", "[PAD3]", "<0x0A>", "<|im_end|>"]);
        assert_eq!(
            vocab.token_types,
            [
                token_type::NORMAL,
                token_type::NORMAL,
                token_type::NORMAL,
                token_type::UNUSED,
                token_type::BYTE,
                token_type::CONTROL
            ]
        );
        assert_eq!(vocab.scores, None);
        assert_eq!(vocab.merges, ["a b", "ab b"]);
    }

    #[test]
    fn unigram_vocab_keeps_scores() {
        let json = json!({
            "model": { "type": "Unigram", "unk_id": 0, "vocab": [["<unk>", 0.0], ["▁a", -1.5], ["<0x41>", -9.0]] }
        });
        let vocab = token_vocab(&json).unwrap().unwrap();
        assert_eq!(vocab.tokens, ["<unk>", "▁a", "<0x41>"]);
        assert_eq!(vocab.token_types, [token_type::UNKNOWN, token_type::NORMAL, token_type::BYTE]);
        assert_eq!(vocab.scores, Some(vec![0.0, -1.5, -9.0]));
        assert!(vocab.merges.is_empty());
    }

    #[test]
    fn tokenizer_json_without_model_has_no_vocab() {
        assert_eq!(token_vocab(&json!({ "added_tokens": [] })).unwrap(), None);
    }

    #[test]
    fn tokens_are_written_with_model_and_padded() {
        let mut w = GgufWriter::new();
        let vocab = token_vocab(&bpe_json()).unwrap();
        write_tokenizer_metadata(&mut w, &info(vocab), Some(8)).unwrap();
        assert!(w.has_metadata("tokenizer.ggml.model"));
        assert!(w.has_metadata("tokenizer.ggml.merges"));
        assert!(!w.has_metadata("tokenizer.ggml.scores"));
        let tokens = w.metadata.iter().find(|(k, _)| k == "tokenizer.ggml.tokens").map(|(_, v)| v);
        match tokens {
            Some(MetadataValue::StringArray(t)) => {
                assert_eq!(t.len(), 8);
                assert_eq!(t[7], "[PAD7]");
            }
            other => panic!("unexpected tokens entry: {other:?}"),
        }
    }

    #[test]
    fn model_key_needs_a_token_list() {
        let mut w = GgufWriter::new();
        assert_eq!(write_tokenizer_metadata(&mut w, &info(None), Some(8)).unwrap(), 2);
        assert!(!w.has_metadata("tokenizer.ggml.model"));
        assert!(!w.has_metadata("tokenizer.ggml.tokens"));
        assert!(w.has_metadata("tokenizer.ggml.bos_token_id"));
    }

    #[test]
    fn existing_keys_are_skipped() {
        let mut w = GgufWriter::new();
        w.add_metadata("tokenizer.ggml.model", MetadataValue::String("llama".into())).unwrap();
        let vocab = token_vocab(&bpe_json()).unwrap();
        // tokens, token_type, merges, add_bos_token, bos_token_id
        assert_eq!(write_tokenizer_metadata(&mut w, &info(vocab), None).unwrap(), 5);
        assert_eq!(w.metadata[0].1, MetadataValue::String("llama".into()));
        assert!(w.has_metadata("tokenizer.ggml.bos_token_id"));
    }
}
