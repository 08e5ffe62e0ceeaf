//! Fetching a resolved revision into a staging directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{HubError, Result};
use crate::git::Git;
use crate::reference::ComponentReference;
use crate::revision::ResolvedRevision;

/// Materializes a module tree for a resolved revision.
///
/// Implementations write into `dest`, an empty directory owned by the caller,
/// and return the module root (usually `dest` itself). On error the caller
/// discards `dest`.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        source: &ComponentReference,
        resolved: &ResolvedRevision,
        dest: &Path,
    ) -> Result<PathBuf>;
}

/// Shallow single-revision checkout with the system git binary.
///
/// The resulting tree has no `.git` directory, so it is self-contained and
/// can be moved freely.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    git: Git,
}

impl GitFetcher {
    pub fn new(timeout: Duration) -> Self {
        GitFetcher {
            git: Git::new(timeout),
        }
    }

    pub fn with_git(git: Git) -> Self {
        GitFetcher { git }
    }

    fn fetch_head(&self, dest: &Path) -> Option<String> {
        let args = ["rev-parse", "--verify", "--quiet", "FETCH_HEAD^{commit}"];
        self.git
            .run(Some(dest), &args)
            .ok()
            .map(|out| out.trim().to_ascii_lowercase())
    }
}

impl Fetcher for GitFetcher {
    fn fetch(
        &self,
        source: &ComponentReference,
        resolved: &ResolvedRevision,
        dest: &Path,
    ) -> Result<PathBuf> {
        let fetch_error = |detail: String| HubError::Fetch {
            reference: source.to_string(),
            cache_key: String::new(),
            detail,
        };
        let locator = source.fetch_locator();
        let run = |args: &[&str]| {
            self.git
                .run(Some(dest), args)
                .map_err(|failure| failure.into_hub_error(source, fetch_error))
        };

        run(&["init", "--quiet"])?;

        let target = resolved
            .ref_name
            .as_deref()
            .unwrap_or(resolved.commit.as_str());
        let shallow = ["fetch", "--quiet", "--no-tags", "--depth", "1", &locator, target];
        let mut fetched = run(&shallow).map(|_| self.fetch_head(dest));
        let matches_resolved =
            |head: &Result<Option<String>>| matches!(head, Ok(Some(c)) if *c == resolved.commit);

        // The ref may have moved since it was resolved; ask for the commit itself.
        if !matches_resolved(&fetched) && target != resolved.commit {
            debug!(
                reference = %source,
                commit = %resolved.commit,
                "ref moved since resolution, fetching commit directly"
            );
            fetched = run(&[
                "fetch",
                "--quiet",
                "--no-tags",
                "--depth",
                "1",
                &locator,
                &resolved.commit,
            ])
            .map(|_| self.fetch_head(dest));
        }
        match fetched {
            Ok(Some(ref c)) if *c == resolved.commit => {}
            Ok(other) => {
                return Err(fetch_error(format!(
                    "fetched commit {} does not match resolved commit {}",
                    other.as_deref().unwrap_or("(none)"),
                    resolved.commit
                )))
            }
            Err(e) => return Err(e),
        }

        run(&[
            "-c",
            "advice.detachedHead=false",
            "checkout",
            "--quiet",
            "--detach",
            &resolved.commit,
        ])?;

        let git_dir = dest.join(".git");
        std::fs::remove_dir_all(&git_dir).map_err(|e| HubError::Cache {
            path: git_dir,
            detail: format!("removing git metadata: {e}"),
        })?;

        info!(reference = %source, commit = %resolved.commit, "fetched revision");
        Ok(dest.to_path_buf())
    }
}
