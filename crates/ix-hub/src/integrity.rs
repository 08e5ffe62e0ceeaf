//! Content hashing.
//!
//! SHA-256 digests identify constructor arguments and local module trees.
//! A tree hash covers every regular file's relative path and bytes, visited
//! in sorted order, so two identical checkouts hash equal wherever they live.

use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// A content hash (SHA-256 hex digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute the SHA-256 hash of the given data.
    pub fn compute(data: &[u8]) -> Self {
        ContentHash(hex::encode(Sha256::digest(data)))
    }

    /// Hash a sequence of fields, each terminated by a NUL byte.
    pub fn of_fields<'a>(fields: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        ContentHash(hex::encode(hasher.finalize()))
    }

    /// Hash a directory tree, skipping any `.git` directory.
    pub fn of_tree(root: &Path) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        let walker = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            hasher.update(relative.as_bytes());
            hasher.update([0u8]);
            let mut file = File::open(entry.path())?;
            io::copy(&mut file, &mut hasher)?;
            hasher.update([0u8]);
        }
        Ok(ContentHash(hex::encode(hasher.finalize())))
    }

    /// Get the hex string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first `len` hex characters.
    pub fn prefix(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_format() {
        let hash = ContentHash::compute(b"");
        // SHA-256 of empty is well-known
        assert_eq!(
            hash.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(hash.prefix(8), "e3b0c442");
    }

    #[test]
    fn fields_are_separated() {
        let a = ContentHash::of_fields(["ab", "c"]);
        let b = ContentHash::of_fields(["a", "bc"]);
        assert_ne!(a, b);
        assert_eq!(a, ContentHash::of_fields(["ab", "c"]));
    }

    #[test]
    fn tree_hash_ignores_location_and_git_dir() {
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        for dir in [one.path(), two.path()] {
            std::fs::create_dir_all(dir.join("templates")).unwrap();
            std::fs::write(dir.join("config.yaml"), "type: x\n").unwrap();
            std::fs::write(dir.join("templates/main.j2"), "hello").unwrap();
        }
        std::fs::create_dir_all(two.path().join(".git")).unwrap();
        std::fs::write(two.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();

        let h1 = ContentHash::of_tree(one.path()).unwrap();
        let h2 = ContentHash::of_tree(two.path()).unwrap();
        assert_eq!(h1, h2);

        std::fs::write(two.path().join("templates/main.j2"), "changed").unwrap();
        assert_ne!(h1, ContentHash::of_tree(two.path()).unwrap());
    }
}
