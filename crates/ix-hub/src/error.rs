//! Hub error types.
//!
//! Every failure mode is a distinct variant so callers can tell "not found"
//! from "network unreachable" from "ambiguous implementation". Variants that
//! concern a component carry the reference (with its requested revision) and,
//! once it is known, the cache key, so an operator can locate and delete the
//! affected cache entry.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::component::Role;

/// Errors that can occur while resolving, caching, or loading a component.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Input is not a builtin name, an existing directory, or a remote locator.
    #[error("invalid component reference '{reference}': {detail}")]
    InvalidReference { reference: String, detail: String },

    /// The symbolic revision matched no tag, branch, or commit.
    #[error("revision '{revision}' not found for {reference}: {detail}")]
    RevisionNotFound {
        reference: String,
        revision: String,
        detail: String,
    },

    /// The remote repository does not exist (or is not visible).
    #[error("repository not found: {reference}: {detail}")]
    RepositoryNotFound { reference: String, detail: String },

    /// The remote rejected the supplied credentials, or required some.
    #[error("authentication failed for {reference}: {detail}")]
    Authentication { reference: String, detail: String },

    /// Transient I/O failure talking to the remote, including timeouts.
    #[error("network error while accessing {reference}: {detail}")]
    Network { reference: String, detail: String },

    /// Remote access was needed while offline mode is enabled.
    #[error("offline mode: {reference} is not in the local cache and remote access is disabled")]
    Offline { reference: String },

    /// The per-key lock could not be acquired within the configured wait.
    #[error(
        "timed out after {:.1}s waiting for the lock on cache key {cache_key} ({reference}); another process may be fetching it",
        waited.as_secs_f64()
    )]
    LockTimeout {
        reference: String,
        cache_key: String,
        waited: Duration,
    },

    /// No declared implementation satisfies the role's capability contract.
    #[error(
        "no {role} implementation found in {reference} (cache key {cache_key}); declared: [{}]",
        available.join(", ")
    )]
    NoImplementationFound {
        reference: String,
        cache_key: String,
        role: Role,
        available: Vec<String>,
    },

    /// Several implementations qualify and the declared configuration does not pick one.
    #[error(
        "multiple {role} implementations found in {reference} (cache key {cache_key}): [{}]; name one with `implementation` in config.yaml",
        candidates.join(", ")
    )]
    AmbiguousImplementation {
        reference: String,
        cache_key: String,
        role: Role,
        candidates: Vec<String>,
    },

    /// The module declares a different role than the caller asked for.
    #[error("{reference} (cache key {cache_key}) declares role {declared}, expected {expected}")]
    RoleMismatch {
        reference: String,
        cache_key: String,
        expected: Role,
        declared: Role,
    },

    /// A published cache entry failed to parse or load.
    #[error(
        "corrupt cache entry {cache_key} for {reference} at {}: {detail}; delete it to force a clean re-fetch",
        path.display()
    )]
    CorruptCacheEntry {
        reference: String,
        cache_key: String,
        path: PathBuf,
        detail: String,
    },

    /// A module loaded in place (not from the cache) is malformed.
    #[error("invalid module {reference} at {}: {detail}", path.display())]
    InvalidModule {
        reference: String,
        path: PathBuf,
        detail: String,
    },

    /// Checking out the resolved revision failed for a non-network reason.
    #[error("fetch failed for {reference} (cache key {cache_key}): {detail}")]
    Fetch {
        reference: String,
        cache_key: String,
        detail: String,
    },

    /// The selected implementation names a factory nobody registered.
    #[error("{reference}: implementation '{implementation}' requires unknown factory '{factory}'")]
    UnknownFactory {
        reference: String,
        implementation: String,
        factory: String,
    },

    /// The factory failed to build an instance.
    #[error("{reference}: failed to construct '{implementation}': {detail}")]
    Construction {
        reference: String,
        implementation: String,
        detail: String,
    },

    /// Cache I/O error.
    #[error("cache error at {}: {detail}", path.display())]
    Cache { path: PathBuf, detail: String },

    /// Invalid hub configuration.
    #[error("invalid configuration: {detail}")]
    Config { detail: String },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HubError {
    /// Whether retrying the same call may succeed without any other change.
    ///
    /// Only lock timeouts and network failures leave no partial state behind
    /// and depend on conditions outside the caller's input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HubError::Network { .. } | HubError::LockTimeout { .. }
        )
    }

    /// Fill in the reference on errors raised below the point where it is known.
    pub(crate) fn with_reference(mut self, reference: impl fmt::Display) -> Self {
        match &mut self {
            HubError::LockTimeout { reference: r, .. }
            | HubError::CorruptCacheEntry { reference: r, .. }
            | HubError::Fetch { reference: r, .. }
                if r.is_empty() =>
            {
                *r = reference.to_string();
            }
            _ => {}
        }
        self
    }
}

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;
