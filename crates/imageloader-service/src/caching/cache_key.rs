use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// A deterministic identifier derived from a resource locator.
///
/// The key is the hex-formatted SHA-256 of the locator. It is used both as the filename in the
/// disk cache and as the identity for [`KeyLocks`](super::KeyLocks), so the same locator always
/// maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    hash: Arc<str>,
}

impl CacheKey {
    /// Creates the [`CacheKey`] for the given locator.
    pub fn from_locator(locator: &str) -> Self {
        let hash = Sha256::digest(locator.as_bytes());
        Self {
            hash: hex::encode(hash).into(),
        }
    }

    /// Returns the relative path of this key inside a cache directory.
    ///
    /// This is a plain filename without any directory components.
    pub fn cache_path(&self) -> &str {
        &self.hash
    }

    /// Parses a key back from a cache filename.
    ///
    /// Returns `None` for anything that is not a 64 character lowercase hex string.
    pub fn from_cache_path(path: &str) -> Option<Self> {
        let is_hash = path.len() == 64
            && path
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        is_hash.then(|| Self { hash: path.into() })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hash)
    }
}
