//! Cache keys.
//!
//! A key names one on-disk module: `{kind}--{slug}--{rev12}--{hash16}`. The
//! slug and revision prefix keep directory listings readable; the hash over
//! kind, identity and resolved revision is what makes the key unique.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::integrity::ContentHash;
use crate::reference::ReferenceKind;

const SLUG_MAX: usize = 48;

/// A deterministic, filesystem-safe cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for `identity` at `resolved` (a commit, content hash, or
    /// builtin name). `name` only feeds the readable slug.
    pub fn derive(kind: ReferenceKind, name: &str, identity: &str, resolved: &str) -> Self {
        let hash = ContentHash::of_fields([kind.as_str(), identity, resolved]);
        let slug = sanitize(&name.replace('/', "--"), SLUG_MAX);
        let rev = sanitize(resolved, 12);
        CacheKey(format!("{kind}--{slug}--{rev}--{}", hash.prefix(16)))
    }

    /// Accept a key read back from disk, rejecting anything that is not a
    /// single safe path component.
    pub fn from_existing(raw: &str) -> Option<Self> {
        let safe = !raw.is_empty()
            && raw != "."
            && raw != ".."
            && raw.chars().all(is_safe_char);
        safe.then(|| CacheKey(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn sanitize(raw: &str, max: usize) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if is_safe_char(c) { c } else { '_' })
        .take(max)
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}
