//! Cross-process module cache.
//!
//! Layout:
//! ```text
//! <cache_root>/
//!   objects/<key>-<uuid>/   published module trees, never modified
//!   entries/<key>.json      pointer record naming the current object
//!   staging/<key>-<uuid>/   fetches in progress, invisible to readers
//!   locks/<key>.lock        advisory lock files
//!   refs/<hash>.json        symbolic revision pinned to a commit
//! ```
//!
//! Publishing renames a finished staging directory into `objects/` and then
//! swaps the pointer with a temp-file rename, so a reader either sees the old
//! entry or the new one. Readers never take locks.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache_key::CacheKey;
use crate::error::{HubError, Result};
use crate::integrity::ContentHash;
use crate::lock::LockManager;
use crate::reference::ReferenceKind;
use crate::revision::{ResolvedRevision, RevisionKind};

/// Pointer record stored in `entries/<key>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub key: CacheKey,
    /// Directory name under `objects/`.
    pub object: String,
    pub kind: ReferenceKind,
    pub identity: String,
    pub name: String,
    /// Revision as requested, if any.
    pub revision: Option<String>,
    /// Commit id the object was checked out at.
    pub commit: String,
    pub revision_kind: Option<RevisionKind>,
    /// Seconds since the Unix epoch.
    pub fetched_at: u64,
}

/// A published entry: its record and the object directory it points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub record: EntryRecord,
    pub path: PathBuf,
}

/// A symbolic revision pinned for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PinRecord {
    identity: String,
    requested: Option<String>,
    resolved: ResolvedRevision,
    pinned_at: u64,
}

/// A fetch in progress. The directory is removed on drop unless published.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    key: CacheKey,
    published: bool,
}

impl StagingDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to discard staging directory"
                );
            }
        } else {
            debug!(path = %self.path.display(), "discarded staging directory");
        }
    }
}

/// What a [`CacheStore::prune`] pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub objects_removed: usize,
    pub staging_removed: usize,
}

/// The filesystem cache under one root.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Create a store rooted at the given directory. Nothing is created until
    /// the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join("entries")
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    fn refs_dir(&self) -> PathBuf {
        self.root.join("refs")
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir().join(format!("{key}.json"))
    }

    fn pin_path(&self, identity: &str, requested: Option<&str>) -> PathBuf {
        let hash = ContentHash::of_fields([identity, requested.unwrap_or("HEAD")]);
        self.refs_dir().join(format!("{}.json", hash.prefix(32)))
    }

    /// A fresh staging directory for `key`.
    pub fn create_staging(&self, key: &CacheKey) -> Result<StagingDir> {
        let path = self
            .staging_dir()
            .join(format!("{key}-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&path).map_err(|e| cache_error(&path, "creating staging dir", e))?;
        Ok(StagingDir {
            path,
            key: key.clone(),
            published: false,
        })
    }

    /// The published entry for `key`, if any.
    ///
    /// A pointer that does not parse, or whose object is gone, is reported as
    /// corrupt rather than treated as a miss.
    pub fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let entry_path = self.entry_path(key);
        let text = match fs::read_to_string(&entry_path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(cache_error(&entry_path, "reading entry", e)),
        };
        let record: EntryRecord =
            serde_json::from_str(&text).map_err(|e| HubError::CorruptCacheEntry {
                reference: String::new(),
                cache_key: key.to_string(),
                path: entry_path.clone(),
                detail: format!("unreadable pointer record: {e}"),
            })?;
        if record.key != *key || !is_object_name(&record.object) {
            return Err(HubError::CorruptCacheEntry {
                reference: record.name.clone(),
                cache_key: key.to_string(),
                path: entry_path,
                detail: "pointer record does not match its key".into(),
            });
        }
        let path = self.objects_dir().join(&record.object);
        if !path.is_dir() {
            return Err(HubError::CorruptCacheEntry {
                reference: record.name.clone(),
                cache_key: key.to_string(),
                path,
                detail: "object directory is missing".into(),
            });
        }
        Ok(Some(CacheEntry { record, path }))
    }

    /// Move a finished staging tree into `objects/` and point the entry at it.
    ///
    /// `record.object` is overwritten with the new object's name. Any object
    /// the entry pointed to before stays on disk until pruned.
    pub fn publish(&self, mut staging: StagingDir, mut record: EntryRecord) -> Result<CacheEntry> {
        let objects = self.objects_dir();
        fs::create_dir_all(&objects).map_err(|e| cache_error(&objects, "creating objects dir", e))?;

        let object_name = staging
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| HubError::Cache {
                path: staging.path.clone(),
                detail: "staging path has no file name".into(),
            })?;
        let object_path = objects.join(&object_name);
        fs::rename(&staging.path, &object_path)
            .map_err(|e| cache_error(&object_path, "publishing object", e))?;
        staging.published = true;

        record.key = staging.key.clone();
        record.object = object_name;
        let entry_path = self.entry_path(&record.key);
        write_json_atomic(&entry_path, &record)?;
        info!(key = %record.key, commit = %record.commit, "published cache entry");

        Ok(CacheEntry {
            record,
            path: object_path,
        })
    }

    /// Every readable entry, sorted by key. Corrupt pointers are skipped with a warning.
    pub fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for key in self.entry_keys()? {
            match self.lookup(&key) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "skipping corrupt cache entry"),
            }
        }
        Ok(entries)
    }

    fn entry_keys(&self) -> Result<Vec<CacheKey>> {
        let mut keys: Vec<CacheKey> = read_dir_names(&self.entries_dir())?
            .iter()
            .filter_map(|name| name.strip_suffix(".json"))
            .filter_map(CacheKey::from_existing)
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Remove the entry for `key` and the object it points to.
    pub fn remove(&self, key: &CacheKey) -> Result<bool> {
        let entry_path = self.entry_path(key);
        let object = fs::read_to_string(&entry_path)
            .ok()
            .and_then(|text| serde_json::from_str::<EntryRecord>(&text).ok())
            .map(|record| record.object)
            .filter(|object| is_object_name(object));
        let removed = match fs::remove_file(&entry_path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(cache_error(&entry_path, "removing entry", e)),
        };
        if let Some(object) = object {
            remove_dir_if_present(&self.objects_dir().join(object))?;
        }
        if removed {
            info!(key = %key, "removed cache entry");
        }
        Ok(removed)
    }

    /// Remove entries (and pins) for `identity`, optionally only those for
    /// `revision` (matched against the requested revision or a commit prefix).
    pub fn remove_matching(&self, identity: &str, revision: Option<&str>) -> Result<Vec<CacheKey>> {
        let matches_revision = |requested: Option<&str>, commit: &str| match revision {
            None => true,
            Some(rev) => requested == Some(rev) || (rev.len() >= 4 && commit.starts_with(rev)),
        };

        let mut removed = Vec::new();
        for entry in self.list()? {
            let r = &entry.record;
            if r.identity == identity && matches_revision(r.revision.as_deref(), &r.commit) {
                self.remove(&r.key)?;
                removed.push(r.key.clone());
            }
        }

        for (path, pin) in self.pins()? {
            if pin.identity == identity
                && matches_revision(pin.requested.as_deref(), &pin.resolved.commit)
            {
                remove_file_if_present(&path)?;
            }
        }
        Ok(removed)
    }

    /// Remove every entry, object, pin and staging directory. Lock files stay.
    pub fn clear(&self) -> Result<usize> {
        let count = self.entry_keys()?.len();
        for dir in [
            self.entries_dir(),
            self.objects_dir(),
            self.refs_dir(),
            self.staging_dir(),
        ] {
            remove_dir_if_present(&dir)?;
        }
        info!(root = %self.root.display(), entries = count, "cleared cache");
        Ok(count)
    }

    /// Delete objects no pointer references.
    ///
    /// Each candidate's key is locked before the check so an object that is
    /// being published concurrently is never removed. Staging directories
    /// are only removed when their key's lock is free, which means the
    /// writer that created them is gone.
    pub fn prune(&self, locks: &LockManager) -> Result<PruneReport> {
        let mut report = PruneReport::default();

        for name in read_dir_names(&self.objects_dir())? {
            let Some(key) = object_key(&name) else {
                continue;
            };
            let _lock = locks.acquire(&key)?;
            let referenced = match self.lookup(&key) {
                Ok(Some(entry)) => entry.record.object == name,
                Ok(None) => false,
                // Leave corrupt entries for the operator to inspect.
                Err(_) => true,
            };
            if !referenced {
                remove_dir_if_present(&self.objects_dir().join(&name))?;
                report.objects_removed += 1;
                debug!(object = %name, "pruned unreferenced object");
            }
        }

        for name in read_dir_names(&self.staging_dir())? {
            let Some(key) = object_key(&name) else {
                continue;
            };
            let _lock = locks.acquire(&key)?;
            remove_dir_if_present(&self.staging_dir().join(&name))?;
            report.staging_removed += 1;
        }

        info!(
            objects = report.objects_removed,
            staging = report.staging_removed,
            "pruned cache"
        );
        Ok(report)
    }

    /// Remember that `requested` resolved to `resolved` for `identity`.
    pub fn pin_revision(&self, identity: &str, resolved: &ResolvedRevision) -> Result<()> {
        let record = PinRecord {
            identity: identity.to_string(),
            requested: resolved.requested.clone(),
            resolved: resolved.clone(),
            pinned_at: now_secs(),
        };
        let path = self.pin_path(identity, resolved.requested.as_deref());
        write_json_atomic(&path, &record)
    }

    /// The last pinned resolution of `requested` for `identity`.
    pub fn pinned_revision(
        &self,
        identity: &str,
        requested: Option<&str>,
    ) -> Result<Option<ResolvedRevision>> {
        let path = self.pin_path(identity, requested);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(cache_error(&path, "reading pin", e)),
        };
        match serde_json::from_str::<PinRecord>(&text) {
            Ok(pin) if pin.identity == identity && pin.requested.as_deref() == requested => {
                Ok(Some(pin.resolved))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable revision pin");
                Ok(None)
            }
        }
    }

    fn pins(&self) -> Result<Vec<(PathBuf, PinRecord)>> {
        let dir = self.refs_dir();
        let mut pins = Vec::new();
        for name in read_dir_names(&dir)? {
            if !name.ends_with(".json") {
                continue;
            }
            let path = dir.join(&name);
            let parsed = fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str::<PinRecord>(&text).ok());
            if let Some(pin) = parsed {
                pins.push((path, pin));
            }
        }
        Ok(pins)
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `<key>-<32 hex>` names an object or staging directory.
fn object_key(name: &str) -> Option<CacheKey> {
    let (key, id) = name.rsplit_once('-')?;
    if id.len() != 32 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    CacheKey::from_existing(key)
}

fn is_object_name(name: &str) -> bool {
    object_key(name).is_some()
}

fn cache_error(path: &Path, action: &str, e: std::io::Error) -> HubError {
    HubError::Cache {
        path: path.to_path_buf(),
        detail: format!("{action}: {e}"),
    }
}

fn read_dir_names(dir: &Path) -> Result<Vec<String>> {
    let iter = match fs::read_dir(dir) {
        Ok(iter) => iter,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(cache_error(dir, "listing", e)),
    };
    let mut names = Vec::new();
    for entry in iter {
        let entry = entry.map_err(|e| cache_error(dir, "reading entry", e))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(cache_error(path, "removing", e)),
    }
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(cache_error(path, "removing", e)),
    }
}

/// Write via a sibling temp file and rename, replacing `path` atomically.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().ok_or_else(|| HubError::Cache {
        path: path.to_path_buf(),
        detail: "path has no parent".into(),
    })?;
    fs::create_dir_all(dir).map_err(|e| cache_error(dir, "creating dir", e))?;

    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4().simple()));
    let written = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(&bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(cache_error(&tmp, "writing", e));
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        cache_error(path, "replacing", e)
    })
}
