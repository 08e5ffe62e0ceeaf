//! Per-key locking.
//!
//! Writers to one cache key are serialized twice over: an in-process keyed
//! mutex admits one thread per key, and an advisory file lock under
//! `<cache_root>/locks/` admits one process per key. Acquisition is bounded
//! by a timeout. Lock files are left in place after release; removing one
//! while another process holds it would let two writers lock different
//! inodes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::hash::Hash;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs4::fs_std::FileExt;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use tracing::debug;

use crate::cache_key::CacheKey;
use crate::error::{HubError, Result};

type Slot = Arc<Mutex<()>>;
type Slots<K> = Arc<Mutex<HashMap<K, Slot>>>;

/// Drop the slot for `key` once nobody holds or waits on it.
fn release_slot<K: Eq + Hash>(slots: &Slots<K>, key: &K) {
    let mut slots = slots.lock();
    let unused = slots.get(key).map(Arc::strong_count) == Some(1);
    if unused {
        slots.remove(key);
    }
}

/// Guard returned by [`KeyedMutex`]; releases on drop.
pub struct KeyGuard<K: Eq + Hash> {
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
    slots: Slots<K>,
    key: K,
}

impl<K: Eq + Hash> Drop for KeyGuard<K> {
    fn drop(&mut self) {
        // The guard keeps the slot alive; release it before checking the count.
        drop(self.guard.take());
        release_slot(&self.slots, &self.key);
    }
}

/// One mutex per key, created on first use and removed once unused.
pub struct KeyedMutex<K> {
    slots: Slots<K>,
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        KeyedMutex {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn slot(&self, key: &K) -> Slot {
        self.slots
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn guard(&self, key: &K, guard: ArcMutexGuard<RawMutex, ()>) -> KeyGuard<K> {
        KeyGuard {
            guard: Some(guard),
            slots: self.slots.clone(),
            key: key.clone(),
        }
    }

    /// Block until `key` is free.
    pub fn lock(&self, key: &K) -> KeyGuard<K> {
        let guard = self.slot(key).lock_arc();
        self.guard(key, guard)
    }

    /// Wait at most `timeout` for `key`.
    pub fn try_lock_for(&self, key: &K, timeout: Duration) -> Option<KeyGuard<K>> {
        let slot = self.slot(key);
        match slot.try_lock_arc_for(timeout) {
            Some(guard) => Some(self.guard(key, guard)),
            None => {
                drop(slot);
                release_slot(&self.slots, key);
                None
            }
        }
    }

    /// Number of keys currently held or waited on.
    pub fn active_keys(&self) -> usize {
        self.slots.lock().len()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive hold on a cache key, released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyLock {
    file: File,
    path: PathBuf,
    key: CacheKey,
    _local: KeyGuard<CacheKey>,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(key = %self.key, error = %e, "unlocking lock file failed");
        }
        debug!(key = %self.key, "released lock");
    }
}

impl std::fmt::Debug for KeyLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLock")
            .field("key", &self.key)
            .field("path", &self.path)
            .finish()
    }
}

/// Hands out [`KeyLock`]s for one cache root.
pub struct LockManager {
    dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    local: KeyedMutex<CacheKey>,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        LockManager {
            dir: dir.into(),
            timeout,
            poll_interval: Duration::from_millis(50),
            local: KeyedMutex::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.lock"))
    }

    /// Acquire the in-process and cross-process locks for `key`.
    ///
    /// Fails with [`HubError::LockTimeout`] once the configured wait has
    /// elapsed. The reference in that error is left empty for the caller to
    /// fill in.
    pub fn acquire(&self, key: &CacheKey) -> Result<KeyLock> {
        let started = Instant::now();
        let timed_out = |waited: Duration| HubError::LockTimeout {
            reference: String::new(),
            cache_key: key.to_string(),
            waited,
        };

        debug!(key = %key, "waiting for lock");
        let local = self
            .local
            .try_lock_for(key, self.timeout)
            .ok_or_else(|| timed_out(started.elapsed()))?;

        std::fs::create_dir_all(&self.dir).map_err(|e| HubError::Cache {
            path: self.dir.clone(),
            detail: format!("creating lock dir: {e}"),
        })?;
        let path = self.lock_path(key);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| HubError::Cache {
                path: path.clone(),
                detail: format!("opening lock file: {e}"),
            })?;

        loop {
            match file.try_lock_exclusive() {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    return Err(HubError::Cache {
                        path,
                        detail: format!("locking: {e}"),
                    })
                }
            }
            let waited = started.elapsed();
            if waited >= self.timeout {
                return Err(timed_out(waited));
            }
            std::thread::sleep(self.poll_interval.min(self.timeout - waited));
        }

        debug!(key = %key, waited_ms = started.elapsed().as_millis() as u64, "acquired lock");
        Ok(KeyLock {
            file,
            path,
            key: key.clone(),
            _local: local,
        })
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("dir", &self.dir)
            .field("timeout", &self.timeout)
            .finish()
    }
}
