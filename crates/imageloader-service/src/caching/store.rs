use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tempfile::{NamedTempFile, PersistError};

use crate::config::Config;
use crate::types::CacheValidity;

use super::CacheKey;

/// The `cleanup` process could potentially remove the directories we are operating in, so
/// directory creation and persisting are retried this many times.
const MAX_RETRIES: usize = 2;

/// The on-disk cache of downloaded resources.
///
/// Each [`CacheKey`] maps to one file in the cache directory, named after the key. The file's
/// `mtime` is the only freshness signal, there is no other on-disk metadata.
///
/// New entries are written to a temp file in a sibling directory first and are then atomically
/// renamed into place, so readers either see the previous complete entry or the new complete
/// entry.
#[derive(Debug, Clone)]
pub struct CacheStore {
    /// Directory to use for storing cache items. Will be created if it does not exist.
    ///
    /// Leaving this as None will disable this cache.
    cache_dir: Option<PathBuf>,

    /// Directory to use for temporary files.
    ///
    /// Just like for `cache_dir` when this cache is disabled this will be `None`.
    tmp_dir: Option<PathBuf>,
}

/// The outcome of [`CacheStore::cleanup`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    /// Entries that are still in use.
    pub retained: usize,
    /// Entries that were removed.
    pub removed: usize,
    /// Bytes freed by removing entries.
    pub removed_bytes: u64,
}

impl CacheStore {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Self::new(config.cache_dir("images"), config.cache_dir("tmp"))
    }

    pub fn new(cache_dir: Option<PathBuf>, tmp_dir: Option<PathBuf>) -> io::Result<Self> {
        if let Some(ref dir) = cache_dir {
            fs::create_dir_all(dir)?;
        }

        Ok(Self { cache_dir, tmp_dir })
    }

    /// A store that never caches anything.
    pub fn disabled() -> Self {
        Self {
            cache_dir: None,
            tmp_dir: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_dir.is_some()
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Returns the location of the entry for `key`.
    ///
    /// This does not touch the file system. Returns `None` if the disk cache is disabled.
    pub fn path_for(&self, key: &CacheKey) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(key.cache_path()))
    }

    /// Checks whether the entry at `location` exists and is younger than `validity`.
    ///
    /// This only reads the entry's `mtime`. A missing file is not valid. An `mtime` in the future
    /// counts as an age of zero.
    pub fn is_valid(&self, location: &Path, validity: CacheValidity) -> bool {
        match entry_age(location) {
            Ok(Some(age)) => {
                let valid = validity.is_valid(age);
                tracing::trace!(
                    "Cache entry `{}` is {:?} old, valid: {}",
                    location.display(),
                    age,
                    valid
                );
                valid
            }
            Ok(None) => false,
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %location.display(),
                    "Failed to read cache entry metadata",
                );
                false
            }
        }
    }

    /// Reads the entry at `location`.
    ///
    /// Returns `None` if there is no such entry, which can happen when cleanup runs in between.
    pub fn open(&self, location: &Path) -> io::Result<Option<Bytes>> {
        catch_not_found(|| fs::read(location).map(Bytes::from))
    }

    /// Create a new temporary file to use in the cache.
    ///
    /// The file is created next to the cache directory so that persisting it is a rename.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        let Some(ref path) = self.tmp_dir else {
            return NamedTempFile::new();
        };

        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(path) {
                tracing::error!(path = %path.display(), "Failed to create cache directory: {:?}", e);
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(path = %path.display(), "Failed to create cache file: {:?}", e);
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Atomically publishes a fully written temp file at `location`.
    ///
    /// Any previous entry is replaced wholesale. On failure the temp file is handed back, so the
    /// data is not lost.
    pub fn persist(&self, temp_file: NamedTempFile, location: &Path) -> Result<(), PersistError> {
        match persist_tempfile(temp_file, location) {
            Ok(()) => {
                metric!(counter("caches.file.write") += 1, "status" => "ok");
                tracing::trace!("Persisted cache entry at path {:?}", location.display());
                Ok(())
            }
            Err(err) => {
                metric!(counter("caches.file.write") += 1, "status" => "error");
                Err(err)
            }
        }
    }

    /// Writes `bytes` as the new entry for `key` and returns its location.
    pub fn write(&self, key: &CacheKey, bytes: &[u8]) -> io::Result<PathBuf> {
        let location = self.path_for(key).ok_or_else(disabled_error)?;

        let mut temp_file = self.tempfile()?;
        temp_file.write_all(bytes)?;
        temp_file.flush()?;
        self.persist(temp_file, &location).map_err(|e| e.error)?;

        metric!(time_raw("caches.file.size") = bytes.len() as u64);
        Ok(location)
    }

    /// Removes the entry at `location`.
    ///
    /// This is best-effort, a missing file is fine and other errors are only logged.
    pub fn delete(&self, location: &Path) {
        match fs::remove_file(location) {
            Ok(()) => {
                tracing::debug!("Removed cache entry `{}`", location.display());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %location.display(),
                    "Failed to remove cache entry",
                );
            }
        }
    }

    /// Removes all leftover temp files, like the ones of a previously crashed process.
    pub fn clear_tmp(&self) -> io::Result<()> {
        let Some(ref tmp) = self.tmp_dir else {
            return Ok(());
        };
        if tmp.exists() {
            fs::remove_dir_all(tmp)?;
        }
        fs::create_dir_all(tmp)
    }

    /// Removes all entries that were not written within `max_unused_for`.
    ///
    /// Files in the cache directory that are not cache entries are left alone.
    pub fn cleanup(&self, max_unused_for: Duration) -> io::Result<CleanupStats> {
        let mut stats = CleanupStats::default();
        let Some(ref dir) = self.cache_dir else {
            return Ok(stats);
        };
        tracing::info!("Cleaning up disk cache at `{}`", dir.display());

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let is_entry = entry
                .file_name()
                .to_str()
                .and_then(CacheKey::from_cache_path)
                .is_some();
            if !is_entry {
                continue;
            }

            let path = entry.path();
            let Some(metadata) = catch_not_found(|| path.metadata())? else {
                continue;
            };
            let age = metadata.modified()?.elapsed().unwrap_or_default();
            if age > max_unused_for {
                tracing::debug!("Removing stale cache entry `{}`", path.display());
                if catch_not_found(|| fs::remove_file(&path))?.is_some() {
                    stats.removed += 1;
                    stats.removed_bytes += metadata.len();
                }
            } else {
                stats.retained += 1;
            }
        }

        metric!(gauge("caches.file.count") = stats.retained as u64);
        Ok(stats)
    }
}

fn disabled_error() -> io::Error {
    io::Error::other("the disk cache is disabled")
}

/// Returns the time since the entry was last written, or `None` if it does not exist.
fn entry_age(path: &Path) -> io::Result<Option<Duration>> {
    catch_not_found(|| {
        let mtime = path.metadata()?.modified()?;
        Ok(SystemTime::now()
            .duration_since(mtime)
            .unwrap_or_default())
    })
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> Result<(), PersistError> {
    let Some(parent) = cache_path.parent() else {
        return Err(PersistError {
            error: io::Error::other("no parent directory to persist item"),
            file: temp_file,
        });
    };

    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(path = %parent.display(), "Failed to create cache directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(PersistError {
                    error: e,
                    file: temp_file,
                });
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                tracing::error!(path = %cache_path.display(), "Failed to create cache file: {:?}", e.error);
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                temp_file = e.file;
            }
        }
    }
}

fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
