//! Declarative rename tables.
//!
//! A [`RuleTable`] is applied in a fixed order:
//!
//! 1. discard suffixes (buffers that never reach the output)
//! 2. exact whole-name rules
//! 3. the first matching prefix rule, which also assigns the tensor a [`Group`]
//! 4. literal substitutions, in table order, every occurrence replaced
//! 5. compound substitutions anchored at dot-segment boundaries
//! 6. exact fix-ups on the substituted name
//!
//! Later stages see the output of earlier ones, so `trunk.blocks.` becomes
//! `t.b.` in stage 4 and `blk.` in stage 5.

/// Which half of a multimodal checkpoint a tensor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Text,
    Vision,
}

/// Whole-name rename. Later stages are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExactRule {
    pub source: &'static str,
    pub target: &'static str,
    pub group: Group,
}

/// Replace a leading `prefix` with `replacement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixRule {
    pub prefix: &'static str,
    pub replacement: &'static str,
    pub group: Group,
}

/// Literal `pattern` → `replacement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Substitution {
    pub pattern: &'static str,
    pub replacement: &'static str,
}

/// Outcome of running a name through the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Buffer that is never converted.
    Discard,
    /// Renamed by an exact rule.
    Exact { name: String, group: Group },
    /// Renamed by the prefix/substitution stages.
    Rewritten { name: String, group: Group },
}

impl Applied {
    pub fn name(&self) -> Option<&str> {
        match self {
            Applied::Discard => None,
            Applied::Exact { name, .. } | Applied::Rewritten { name, .. } => Some(name),
        }
    }

    pub fn group(&self) -> Option<Group> {
        match self {
            Applied::Discard => None,
            Applied::Exact { group, .. } | Applied::Rewritten { group, .. } => Some(*group),
        }
    }
}

/// An ordered, immutable rename table.
#[derive(Debug, Clone)]
pub struct RuleTable {
    pub name: &'static str,
    pub discard_suffixes: &'static [&'static str],
    pub exact: &'static [ExactRule],
    pub prefixes: &'static [PrefixRule],
    /// Group of names no prefix rule matched.
    pub default_group: Group,
    pub substitutions: &'static [Substitution],
    pub compound: &'static [Substitution],
    pub fixups: &'static [ExactRule],
}

// ---------------------------------------------------------------------------
// Ovis2 LLM table (text + clip.vision.* namespace)
// ---------------------------------------------------------------------------

const OVIS2_DISCARD: &[&str] = &["rotary_emb.inv_freq"];

const OVIS2_EXACT: &[ExactRule] = &[
    ExactRule { source: "model.embed_tokens.weight", target: "token_embd.weight", group: Group::Text },
    ExactRule { source: "llm.model.embed_tokens.weight", target: "token_embd.weight", group: Group::Text },
    ExactRule { source: "llm.lm_head.weight", target: "output.weight", group: Group::Text },
    ExactRule {
        source: "vte.weight",
        target: "clip.vision.mm_proj.output.weight",
        group: Group::Vision,
    },
];

const OVIS2_PREFIXES: &[PrefixRule] = &[
    PrefixRule { prefix: "llm.", replacement: "", group: Group::Text },
    PrefixRule {
        prefix: "visual_tokenizer.",
        replacement: "clip.vision.model.",
        group: Group::Vision,
    },
    PrefixRule { prefix: "vision_tower.", replacement: "clip.vision.model.", group: Group::Vision },
    PrefixRule {
        prefix: "multi_modal_projector.",
        replacement: "clip.vision.mm_proj.",
        group: Group::Vision,
    },
    // already canonical
    PrefixRule { prefix: "clip.vision.", replacement: "clip.vision.", group: Group::Vision },
];

const OVIS2_SUBSTITUTIONS: &[Substitution] = &[
    Substitution { pattern: "preprocessor.patchifier", replacement: "patch_embd" },
    Substitution { pattern: "backbone", replacement: "bb" },
    Substitution { pattern: "trunk", replacement: "t" },
    Substitution { pattern: "blocks", replacement: "b" },
    Substitution { pattern: "pre_patch.norm", replacement: "patch_embd.norm" },
    Substitution { pattern: "pre_patch.proj", replacement: "patch_embd.proj" },
    Substitution { pattern: "position_embedding", replacement: "pos_embd" },
    Substitution { pattern: "attn.proj", replacement: "attn_out" },
    Substitution { pattern: "attn.qkv", replacement: "attn_qkv" },
];

const OVIS2_COMPOUND: &[Substitution] = &[Substitution { pattern: "t.b.", replacement: "blk." }];

const OVIS2_FIXUPS: &[ExactRule] = &[ExactRule {
    source: "clip.vision.model.bb.preprocessor.pos_embed",
    target: "clip.vision.model.bb.pos_embd",
    group: Group::Vision,
}];

// ---------------------------------------------------------------------------
// Ovis2 vision-encoder table (v.* / mm.* namespace)
// ---------------------------------------------------------------------------

const ENCODER_EXACT: &[ExactRule] = &[
    ExactRule {
        source: "multimodal_projector.mm_input_projection_weight",
        target: "mm.input_projection.weight",
        group: Group::Vision,
    },
    ExactRule {
        source: "multimodal_projector.mm_soft_emb_norm.weight",
        target: "mm.soft_emb_norm.weight",
        group: Group::Vision,
    },
];

const ENCODER_PREFIXES: &[PrefixRule] = &[
    PrefixRule { prefix: "vision_model.encoder.layers.", replacement: "v.blk.", group: Group::Vision },
    PrefixRule { prefix: "vision_model.", replacement: "v.", group: Group::Vision },
    PrefixRule { prefix: "multimodal_projector.", replacement: "mm.", group: Group::Vision },
    // already canonical
    PrefixRule { prefix: "v.", replacement: "v.", group: Group::Vision },
    PrefixRule { prefix: "mm.", replacement: "mm.", group: Group::Vision },
];

const ENCODER_SUBSTITUTIONS: &[Substitution] = &[
    Substitution { pattern: ".embeddings.patch_embedding.", replacement: ".patch_embd." },
    Substitution { pattern: ".embeddings.position_embedding.", replacement: ".position_embd." },
    Substitution { pattern: "post_layernorm.", replacement: "post_ln." },
    Substitution { pattern: ".self_attn.k_proj.", replacement: ".attn_k." },
    Substitution { pattern: ".self_attn.v_proj.", replacement: ".attn_v." },
    Substitution { pattern: ".self_attn.q_proj.", replacement: ".attn_q." },
    Substitution { pattern: ".self_attn.out_proj.", replacement: ".attn_out." },
    Substitution { pattern: ".self_attn.qkv.", replacement: ".attn_qkv." },
    Substitution { pattern: ".layer_norm1.", replacement: ".ln1." },
    Substitution { pattern: ".layer_norm2.", replacement: ".ln2." },
    Substitution { pattern: ".mlp.fc1.", replacement: ".ffn_down." },
    Substitution { pattern: ".mlp.fc2.", replacement: ".ffn_up." },
];

impl RuleTable {
    /// Rules for the language model and the `clip.vision.*` vision namespace.
    pub fn ovis2() -> Self {
        Self {
            name: "ovis2",
            discard_suffixes: OVIS2_DISCARD,
            exact: OVIS2_EXACT,
            prefixes: OVIS2_PREFIXES,
            default_group: Group::Text,
            substitutions: OVIS2_SUBSTITUTIONS,
            compound: OVIS2_COMPOUND,
            fixups: OVIS2_FIXUPS,
        }
    }

    /// Rules for the standalone vision encoder (`v.*`) and projector (`mm.*`).
    pub fn ovis2_encoder() -> Self {
        Self {
            name: "ovis2-encoder",
            discard_suffixes: OVIS2_DISCARD,
            exact: ENCODER_EXACT,
            prefixes: ENCODER_PREFIXES,
            default_group: Group::Text,
            substitutions: ENCODER_SUBSTITUTIONS,
            compound: &[],
            fixups: &[],
        }
    }

    /// Run `name` through every stage.
    pub fn apply(&self, name: &str) -> Applied {
        if self.discard_suffixes.iter().any(|s| name.ends_with(s)) {
            return Applied::Discard;
        }
        if let Some(rule) = self.exact.iter().find(|r| r.source == name) {
            return Applied::Exact { name: rule.target.to_string(), group: rule.group };
        }

        let (mut out, group) = match self.prefixes.iter().find(|r| name.starts_with(r.prefix)) {
            Some(rule) => {
                (format!("{}{}", rule.replacement, &name[rule.prefix.len()..]), rule.group)
            }
            None => (name.to_string(), self.default_group),
        };

        for sub in self.substitutions {
            if out.contains(sub.pattern) {
                out = out.replace(sub.pattern, sub.replacement);
            }
        }
        for sub in self.compound {
            out = replace_segments(&out, sub.pattern, sub.replacement);
        }
        if let Some(rule) = self.fixups.iter().find(|r| r.source == out) {
            out = rule.target.to_string();
        }

        Applied::Rewritten { name: out, group }
    }

    /// Check that the table cannot feed itself.
    ///
    /// Returns one message per violated property: a substitution whose
    /// replacement contains its own pattern, or a `samples` name that is not
    /// a fixed point of [`RuleTable::apply`].
    pub fn self_check(&self, samples: &[&str]) -> Vec<String> {
        let mut problems = Vec::new();
        for sub in self.substitutions.iter().chain(self.compound) {
            if sub.pattern.is_empty() {
                problems.push(format!("{}: empty substitution pattern", self.name));
            } else if sub.replacement.contains(sub.pattern) {
                problems.push(format!(
                    "{}: `{}` -> `{}` re-creates its own pattern",
                    self.name, sub.pattern, sub.replacement
                ));
            }
        }
        for rule in self.exact.iter().chain(self.fixups) {
            if rule.source == rule.target {
                problems.push(format!("{}: exact rule `{}` is a no-op", self.name, rule.source));
            }
        }
        for sample in samples {
            match self.apply(sample).name() {
                Some(out) if out == *sample => {}
                other => problems.push(format!(
                    "{}: canonical `{sample}` is not a fixed point (got {other:?})",
                    self.name
                )),
            }
        }
        problems
    }
}

/// Replace `pattern` only where it starts a dot-segment: at the beginning of
/// `name` or right after a `.`.
pub fn replace_segments(name: &str, pattern: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    let mut at_boundary = true;
    while !rest.is_empty() {
        if at_boundary && rest.starts_with(pattern) {
            out.push_str(replacement);
            rest = &rest[pattern.len()..];
            at_boundary = replacement.ends_with('.');
            continue;
        }
        let Some(c) = rest.chars().next() else { break };
        out.push(c);
        rest = &rest[c.len_utf8()..];
        at_boundary = c == '.';
    }
    out
}
