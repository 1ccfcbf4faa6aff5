//! Destination-name collision and length guard.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::ReservedPolicy;
use crate::error::{ConvertError, Result};
use crate::names;
use ovis_gguf::MAX_TENSOR_NAME_LEN;

/// What the guard decided for one candidate name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Write the tensor under this (possibly rehashed) name.
    Accept(String),
    /// A reserved name already has its producer; skip this one.
    Drop,
}

/// Rename a name too long for the container.
///
/// The result is `tensor.<8 hex of SHA-256(name)>.<last segment>`, cut to
/// 63 bytes on a character boundary. Deterministic across runs.
pub fn rehash_long_name(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let hex = format!("{digest:x}");
    let last = name.rsplit('.').next().unwrap_or(name);
    let renamed = format!("tensor.{}.{last}", &hex[..8]);
    truncate_on_char_boundary(&renamed, MAX_TENSOR_NAME_LEN).to_string()
}

fn truncate_on_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Tracks every destination name accepted in a run.
#[derive(Debug)]
pub struct NameGuard {
    policy: ReservedPolicy,
    /// Destination name → source tensor that produced it.
    seen: HashMap<String, String>,
}

impl NameGuard {
    pub fn new(policy: ReservedPolicy) -> Self {
        Self { policy, seen: HashMap::new() }
    }

    pub fn policy(&self) -> ReservedPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.seen.contains_key(name)
    }

    /// Validate `name`, produced from source tensor `source`, and record it.
    ///
    /// Names of 63 bytes or more are rehashed first; the collision check runs
    /// on the final name.
    pub fn validate(&mut self, name: &str, source: &str) -> Result<Outcome> {
        let final_name = if name.len() >= MAX_TENSOR_NAME_LEN {
            let renamed = rehash_long_name(name);
            warn!(from = name, to = %renamed, "tensor name too long; renamed");
            renamed
        } else {
            name.to_string()
        };

        if let Some(first) = self.seen.get(&final_name) {
            if names::is_reserved(&final_name) && self.policy == ReservedPolicy::FirstWriterWins {
                info!(name = %final_name, source, first = %first, "reserved name already produced; dropping");
                return Ok(Outcome::Drop);
            }
            return Err(ConvertError::DuplicateDestination {
                name: final_name,
                first: first.clone(),
                second: source.to_string(),
            });
        }

        self.seen.insert(final_name.clone(), source.to_string());
        Ok(Outcome::Accept(final_name))
    }
}
