//! Canonical destination names.
//!
//! Text tensors follow the llama GGUF scheme (`token_embd`, `blk.N.attn_q`,
//! `output_norm`, ...). Vision tensors live under `clip.vision.*` in the
//! multimodal layout and under `v.*` / `mm.*` in the standalone encoder
//! layout.

/// Token embedding table.
pub const TOKEN_EMBD: &str = "token_embd.weight";
/// Language-model head. Reserved: produced at most once per run.
pub const OUTPUT_TENSOR: &str = "output.weight";
/// Vision-to-text projection. Reserved: produced at most once per run.
pub const VISION_PROJECTION_TENSOR: &str = "clip.vision.mm_proj.output.weight";
/// Fused attention projection token.
pub const FUSED_QKV: &str = "attn_qkv";

/// Destination names that may be produced by at most one source tensor.
pub const RESERVED_NAMES: [&str; 2] = [OUTPUT_TENSOR, VISION_PROJECTION_TENSOR];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Whether `name` belongs to one of the vision namespaces.
pub fn is_vision_name(name: &str) -> bool {
    name.starts_with("clip.vision.") || name.starts_with("v.") || name.starts_with("mm.")
}

/// Whether `name` contains the fused projection token as a whole segment.
pub fn has_fused_qkv(name: &str) -> bool {
    name.split('.').any(|seg| seg == FUSED_QKV)
}

/// Swap the fused token for `part` (`attn_q`, `attn_k` or `attn_v`).
pub fn replace_fused_qkv(name: &str, part: &str) -> String {
    name.split('.').map(|seg| if seg == FUSED_QKV { part } else { seg }).collect::<Vec<_>>().join(".")
}

/// Split `prefix.N.rest` into `(N, rest)`.
fn layer_suffix<'a>(name: &'a str, prefix: &str) -> Option<(usize, &'a str)> {
    let after = name.strip_prefix(prefix)?;
    let (idx, rest) = after.split_once('.')?;
    Some((idx.parse().ok()?, rest))
}

const TEXT_LAYER_MAP: &[(&str, &str)] = &[
    ("self_attn.q_proj", "attn_q"),
    ("self_attn.k_proj", "attn_k"),
    ("self_attn.v_proj", "attn_v"),
    ("self_attn.o_proj", "attn_output"),
    ("input_layernorm", "attn_norm"),
    ("post_attention_layernorm", "ffn_norm"),
    ("mlp.gate_proj", "ffn_gate"),
    ("mlp.up_proj", "ffn_up"),
    ("mlp.down_proj", "ffn_down"),
];

const TEXT_LAYER_CANONICAL: &[&str] = &[
    "attn_q",
    "attn_k",
    "attn_v",
    "attn_output",
    "attn_norm",
    "ffn_norm",
    "ffn_gate",
    "ffn_up",
    "ffn_down",
    FUSED_QKV,
];

fn split_param(rest: &str) -> Option<(&str, &str)> {
    rest.rsplit_once('.').filter(|(_, p)| *p == "weight" || *p == "bias")
}

/// Map a llama/Qwen2 text tensor name into the GGUF scheme.
///
/// Names already in the scheme map to themselves. Returns `None` for names
/// the scheme does not know.
///
/// # Examples
///
/// ```
/// use ovis_convert::names::map_text_name;
///
/// assert_eq!(map_text_name("model.layers.3.self_attn.o_proj.weight").as_deref(), Some("blk.3.attn_output.weight"));
/// assert_eq!(map_text_name("model.norm.weight").as_deref(), Some("output_norm.weight"));
/// assert_eq!(map_text_name("blk.3.ffn_up.weight").as_deref(), Some("blk.3.ffn_up.weight"));
/// assert_eq!(map_text_name("model.layers.3.mystery.weight"), None);
/// ```
pub fn map_text_name(name: &str) -> Option<String> {
    match name {
        TOKEN_EMBD | "model.embed_tokens.weight" => return Some(TOKEN_EMBD.to_string()),
        OUTPUT_TENSOR | "lm_head.weight" => return Some(OUTPUT_TENSOR.to_string()),
        "output_norm.weight" | "model.norm.weight" => return Some("output_norm.weight".to_string()),
        _ => {}
    }

    if let Some((layer, rest)) = layer_suffix(name, "model.layers.") {
        let (module, param) = split_param(rest)?;
        let (_, target) = TEXT_LAYER_MAP.iter().find(|(src, _)| *src == module)?;
        return Some(format!("blk.{layer}.{target}.{param}"));
    }
    if let Some((_, rest)) = layer_suffix(name, "blk.") {
        let (module, _) = split_param(rest)?;
        return TEXT_LAYER_CANONICAL.contains(&module).then(|| name.to_string());
    }
    None
}

const VISION_BLOCK_SUFFIXES: &[&str] = &[
    ".mlp.fc1.weight",
    ".mlp.fc2.weight",
    ".mlp.fc3.weight",
    ".norm_1.weight",
    ".norm_2.weight",
    ".attn_out.weight",
    ".attn_out.bias",
    ".attn_qkv.weight",
    ".attn_qkv.bias",
    ".attn_q.weight",
    ".attn_k.weight",
    ".attn_v.weight",
    ".attn_q.bias",
    ".attn_k.bias",
    ".attn_v.bias",
];

const VISION_FIXED: &[&str] = &[
    "clip.vision.model.bb.patch_embd.norm.weight",
    "clip.vision.model.bb.patch_embd.proj.bias",
    "clip.vision.model.bb.patch_embd.proj.weight",
    "clip.vision.model.bb.pos_embd",
    "clip.vision.model.bb.t.post_t_norm.weight",
    VISION_PROJECTION_TENSOR,
];

const ENCODER_FIXED: &[&str] = &[
    "v.patch_embd.weight",
    "v.patch_embd.bias",
    "v.position_embd.weight",
    "v.post_ln.weight",
    "v.post_ln.bias",
];

const ENCODER_BLOCK_MODULES: &[&str] = &[
    "attn_q", "attn_k", "attn_v", "attn_out", FUSED_QKV, "ln1", "ln2", "ffn_down", "ffn_up",
];

/// Whether a vision-namespace name is one the consumers recognize.
pub fn is_known_vision_name(name: &str) -> bool {
    if VISION_FIXED.contains(&name) || ENCODER_FIXED.contains(&name) {
        return true;
    }
    if name.starts_with("clip.vision.model.head.") || name.starts_with("clip.vision.mm_proj.") {
        return true;
    }
    if name.starts_with("mm.") {
        return true;
    }
    if let Some((_, rest)) = layer_suffix(name, "clip.vision.model.bb.blk.") {
        let dotted = format!(".{rest}");
        return VISION_BLOCK_SUFFIXES.contains(&dotted.as_str());
    }
    if let Some((_, rest)) = layer_suffix(name, "v.blk.") {
        return split_param(rest).is_some_and(|(module, _)| ENCODER_BLOCK_MODULES.contains(&module));
    }
    false
}

/// Map a first-pass name into the canonical scheme, or `None` if unknown.
pub fn canonical_name(name: &str) -> Option<String> {
    if is_vision_name(name) {
        is_known_vision_name(name).then(|| name.to_string())
    } else {
        map_text_name(name)
    }
}
