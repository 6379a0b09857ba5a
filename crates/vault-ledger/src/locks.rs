//! Striped mutexes, optionally backed by lock files.
//!
//! A fixed array of mutexes indexed by key hash. Two keys may share a
//! stripe, which only costs some parallelism; a key never maps to two
//! stripes, which is what callers rely on for mutual exclusion.
//!
//! An in-process mutex says nothing to another process opening the same
//! ledger. A table built with [`LockTable::with_lock_files`] also takes an
//! exclusive `flock` on `<dir>/<prefix>-<stripe>.lock` while a stripe is
//! held, so every process (and every table) over one ledger directory
//! excludes the others. The mutex is taken first, so at most one thread of
//! this table ever waits on a given lock file. The file is opened per
//! acquisition and closed with the guard.

use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fs2::FileExt;
use tracing::warn;

use crate::Result;

pub const DEFAULT_STRIPES: usize = 256;

struct LockFiles {
    dir: PathBuf,
    prefix: &'static str,
}

pub struct LockTable {
    stripes: Box<[Mutex<()>]>,
    files: Option<LockFiles>,
}

/// Held stripe. Dropping it releases the file lock, then the mutex.
pub struct StripeGuard<'a> {
    file: Option<File>,
    _mutex: MutexGuard<'a, ()>,
}

impl Drop for StripeGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            if let Err(e) = FileExt::unlock(file) {
                warn!(error = %e, "failed to release stripe lock file");
            }
        }
    }
}

impl LockTable {
    /// In-process only.
    pub fn new(stripes: usize) -> Self {
        Self::build(stripes, None)
    }

    /// Stripes that also lock `<dir>/<prefix>-<n>.lock`. `dir` must exist
    /// by the first `lock`.
    pub fn with_lock_files(dir: impl Into<PathBuf>, prefix: &'static str) -> Self {
        Self::build(
            DEFAULT_STRIPES,
            Some(LockFiles {
                dir: dir.into(),
                prefix,
            }),
        )
    }

    fn build(stripes: usize, files: Option<LockFiles>) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
            files,
        }
    }

    fn index<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Block until the stripe for `key` is free here and in every other
    /// holder of the same lock files.
    ///
    /// A panic while holding a stripe leaves nothing half-written on the
    /// in-memory side, so poisoning is ignored. A dead process releases its
    /// file locks with its descriptors.
    pub fn lock<K: Hash + ?Sized>(&self, key: &K) -> Result<StripeGuard<'_>> {
        let index = self.index(key);
        let mutex = self.stripes[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let file = match &self.files {
            None => None,
            Some(files) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(files.dir.join(format!("{}-{:03}.lock", files.prefix, index)))?;
                FileExt::lock_exclusive(&file)?;
                Some(file)
            }
        };

        Ok(StripeGuard {
            file,
            _mutex: mutex,
        })
    }
}
