//! Revision resolution.
//!
//! Turns a symbolic revision (tag, branch, full ref, or commit) into a
//! concrete commit id. The git implementation reads the remote's advertised
//! refs with `git ls-remote`; for local repositories `git rev-parse` is
//! consulted for commits that no ref points at.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HubError, Result};
use crate::git::Git;
use crate::reference::{ComponentReference, ReferenceKind};

/// Shortest commit prefix accepted.
const MIN_PREFIX: usize = 4;

/// How a requested revision was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevisionKind {
    Tag,
    Branch,
    Commit,
    DefaultBranch,
}

impl RevisionKind {
    /// Branches move; tags and commits are treated as fixed.
    pub fn is_mutable(&self) -> bool {
        matches!(self, RevisionKind::Branch | RevisionKind::DefaultBranch)
    }
}

impl fmt::Display for RevisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RevisionKind::Tag => "tag",
            RevisionKind::Branch => "branch",
            RevisionKind::Commit => "commit",
            RevisionKind::DefaultBranch => "default-branch",
        })
    }
}

/// A symbolic revision pinned to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRevision {
    /// What the caller asked for; `None` means the default branch.
    pub requested: Option<String>,
    pub commit: String,
    pub kind: RevisionKind,
    /// The ref to fetch, when the revision came from one.
    pub ref_name: Option<String>,
}

/// Resolves symbolic revisions for remote (or local git) sources.
pub trait RevisionResolver: Send + Sync {
    fn resolve(
        &self,
        source: &ComponentReference,
        revision: Option<&str>,
    ) -> Result<ResolvedRevision>;
}

/// One line of `git ls-remote --symref` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedRef {
    pub commit: String,
    pub name: String,
}

/// The parsed ref advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefListing {
    pub refs: Vec<AdvertisedRef>,
    /// Target of the symbolic `HEAD`, e.g. `refs/heads/main`.
    pub head_target: Option<String>,
}

impl RefListing {
    pub fn parse(output: &str) -> Self {
        let mut listing = RefListing::default();
        for line in output.lines() {
            let Some((left, name)) = line.split_once('\t') else {
                continue;
            };
            if let Some(target) = left.strip_prefix("ref: ") {
                if name == "HEAD" {
                    listing.head_target = Some(target.trim().to_string());
                }
                continue;
            }
            listing.refs.push(AdvertisedRef {
                commit: left.trim().to_ascii_lowercase(),
                name: name.trim().to_string(),
            });
        }
        listing
    }

    /// The commit `name` points at, preferring the peeled value of annotated tags.
    fn lookup(&self, name: &str) -> Option<&str> {
        let peeled = format!("{name}^{{}}");
        self.refs
            .iter()
            .find(|r| r.name == peeled)
            .or_else(|| self.refs.iter().find(|r| r.name == name))
            .map(|r| r.commit.as_str())
    }

    fn commits(&self) -> BTreeSet<&str> {
        self.refs.iter().map(|r| r.commit.as_str()).collect()
    }
}

/// Why a revision could not be picked from a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickError {
    NotFound,
    AmbiguousPrefix(Vec<String>),
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn is_full_commit(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64) && is_hex(s)
}

/// A revision that names a full commit id, which needs no ref lookup.
pub(crate) fn exact_commit(rev: &str) -> Option<ResolvedRevision> {
    let lower = rev.to_ascii_lowercase();
    is_full_commit(&lower).then(|| ResolvedRevision {
        requested: Some(rev.to_string()),
        commit: lower,
        kind: RevisionKind::Commit,
        ref_name: None,
    })
}

/// Match `revision` against advertised refs: tag, branch, full ref, commit,
/// then unique commit prefix.
pub fn pick_revision(
    listing: &RefListing,
    revision: Option<&str>,
) -> std::result::Result<ResolvedRevision, PickError> {
    let Some(rev) = revision else {
        let commit = listing.lookup("HEAD").ok_or(PickError::NotFound)?;
        return Ok(ResolvedRevision {
            requested: None,
            commit: commit.to_string(),
            kind: RevisionKind::DefaultBranch,
            ref_name: Some(
                listing
                    .head_target
                    .clone()
                    .unwrap_or_else(|| "HEAD".to_string()),
            ),
        });
    };

    let found = |kind: RevisionKind, ref_name: String, commit: &str| ResolvedRevision {
        requested: Some(rev.to_string()),
        commit: commit.to_string(),
        kind,
        ref_name: Some(ref_name),
    };

    let tag = format!("refs/tags/{rev}");
    if let Some(commit) = listing.lookup(&tag) {
        return Ok(found(RevisionKind::Tag, tag, commit));
    }
    let branch = format!("refs/heads/{rev}");
    if let Some(commit) = listing.lookup(&branch) {
        return Ok(found(RevisionKind::Branch, branch, commit));
    }
    if rev.starts_with("refs/") {
        if let Some(commit) = listing.lookup(rev) {
            let kind = if rev.starts_with("refs/tags/") {
                RevisionKind::Tag
            } else {
                RevisionKind::Branch
            };
            return Ok(found(kind, rev.to_string(), commit));
        }
    }

    if let Some(resolved) = exact_commit(rev) {
        return Ok(resolved);
    }
    let commit_only = |commit: String| ResolvedRevision {
        requested: Some(rev.to_string()),
        commit,
        kind: RevisionKind::Commit,
        ref_name: None,
    };
    let lower = rev.to_ascii_lowercase();
    if lower.len() >= MIN_PREFIX && is_hex(&lower) {
        let matches: Vec<&str> = listing
            .commits()
            .into_iter()
            .filter(|c| c.starts_with(&lower))
            .collect();
        return match matches.as_slice() {
            [only] => Ok(commit_only(only.to_string())),
            [] => Err(PickError::NotFound),
            many => Err(PickError::AmbiguousPrefix(
                many.iter().map(|c| c.to_string()).collect(),
            )),
        };
    }
    Err(PickError::NotFound)
}

/// Resolves revisions with the system git binary.
#[derive(Debug, Clone)]
pub struct GitResolver {
    git: Git,
}

impl GitResolver {
    pub fn new(timeout: Duration) -> Self {
        GitResolver {
            git: Git::new(timeout),
        }
    }

    pub fn with_git(git: Git) -> Self {
        GitResolver { git }
    }

    /// `git rev-parse` inside a local repository.
    fn rev_parse_local(&self, source: &ComponentReference, rev: &str) -> Option<String> {
        let path = source.local_path()?;
        let spec = format!("{rev}^{{commit}}");
        self.git
            .run(Some(path), &["rev-parse", "--verify", "--quiet", &spec])
            .ok()
            .map(|out| out.trim().to_string())
            .filter(|c| is_full_commit(c))
    }
}

impl RevisionResolver for GitResolver {
    fn resolve(
        &self,
        source: &ComponentReference,
        revision: Option<&str>,
    ) -> Result<ResolvedRevision> {
        let locator = source.fetch_locator();
        let output = self
            .git
            .run(None, &["ls-remote", "--symref", &locator])
            .map_err(|failure| {
                failure.into_hub_error(source, |detail| HubError::RepositoryNotFound {
                    reference: source.to_string(),
                    detail,
                })
            })?;
        let listing = RefListing::parse(&output);

        let not_found = |detail: String| HubError::RevisionNotFound {
            reference: source.to_string(),
            revision: revision.unwrap_or("HEAD").to_string(),
            detail,
        };

        match pick_revision(&listing, revision) {
            Ok(resolved) => {
                debug!(
                    reference = %source,
                    commit = %resolved.commit,
                    kind = %resolved.kind,
                    "resolved revision"
                );
                Ok(resolved)
            }
            Err(PickError::AmbiguousPrefix(candidates)) => Err(not_found(format!(
                "commit prefix is ambiguous: {}",
                candidates.join(", ")
            ))),
            Err(PickError::NotFound) => {
                if source.kind() == ReferenceKind::Local {
                    if let Some(rev) = revision {
                        if let Some(commit) = self.rev_parse_local(source, rev) {
                            return Ok(ResolvedRevision {
                                requested: Some(rev.to_string()),
                                commit,
                                kind: RevisionKind::Commit,
                                ref_name: None,
                            });
                        }
                    }
                }
                Err(not_found("no tag, branch, or commit matches".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const C1: &str = "1111111111111111111111111111111111111111";
    const C2: &str = "2222222222222222222222222222222222222222";
    const C3: &str = "abc1230000000000000000000000000000000000";
    const C4: &str = "abc1240000000000000000000000000000000000";

    fn listing() -> RefListing {
        RefListing::parse(&format!(
            "ref: refs/heads/main\tHEAD\n\
             {C1}\tHEAD\n\
             {C1}\trefs/heads/main\n\
             {C2}\trefs/heads/v1.0.0\n\
             {C4}\trefs/tags/v1.0.0\n\
             {C3}\trefs/tags/v1.0.0^{{}}\n\
             {C2}\trefs/tags/light\n\
             {C4}\trefs/pull/7/head\n"
        ))
    }

    #[test]
    fn default_branch_uses_head() {
        let r = pick_revision(&listing(), None).unwrap();
        assert_eq!(r.commit, C1);
        assert_eq!(r.kind, RevisionKind::DefaultBranch);
        assert_eq!(r.ref_name.as_deref(), Some("refs/heads/main"));
        assert!(r.kind.is_mutable());
    }

    #[test]
    fn tags_win_over_branches_and_are_peeled() {
        let r = pick_revision(&listing(), Some("v1.0.0")).unwrap();
        assert_eq!(r.kind, RevisionKind::Tag);
        assert_eq!(r.commit, C3);
        assert_eq!(r.ref_name.as_deref(), Some("refs/tags/v1.0.0"));
        assert!(!r.kind.is_mutable());

        let r = pick_revision(&listing(), Some("light")).unwrap();
        assert_eq!(r.commit, C2);
    }

    #[test]
    fn branches_and_full_refs() {
        let r = pick_revision(&listing(), Some("main")).unwrap();
        assert_eq!(r.kind, RevisionKind::Branch);
        assert_eq!(r.commit, C1);

        let r = pick_revision(&listing(), Some("refs/pull/7/head")).unwrap();
        assert_eq!(r.kind, RevisionKind::Branch);
        assert_eq!(r.commit, C4);
    }

    #[test]
    fn commits_and_prefixes() {
        let full = "9999999999999999999999999999999999999999";
        let r = pick_revision(&listing(), Some(full)).unwrap();
        assert_eq!(r.kind, RevisionKind::Commit);
        assert_eq!(r.ref_name, None);

        let r = pick_revision(&listing(), Some("ABC123")).unwrap();
        assert_eq!(r.commit, C3);

        assert!(matches!(
            pick_revision(&listing(), Some("abc12")),
            Err(PickError::AmbiguousPrefix(c)) if c.len() == 2
        ));
        let listing = listing();
        let missing = Err(PickError::NotFound);
        assert_eq!(pick_revision(&listing, Some("abc")), missing);
        assert_eq!(pick_revision(&listing, Some("v9")), missing);
    }

    #[test]
    fn empty_listing_has_no_default_branch() {
        let empty = RefListing::default();
        assert_eq!(pick_revision(&empty, None), Err(PickError::NotFound));
    }
}
