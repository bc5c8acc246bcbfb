//! The cache layers of the image loader.
//!
//! # Layers
//!
//! A load consults these in order:
//!
//! - The [`MemoryCache`] holds decoded images, keyed by [`MemoryKey`].
//! - The [`CacheStore`] holds the raw bytes of network downloads on disk, one file per
//!   [`CacheKey`]. An entry is valid while its `mtime` is younger than the request's
//!   validity period.
//!
//! # Deduplication
//!
//! Concurrent loads of the same key are serialized by [`KeyLocks`]. The first load fetches and
//! writes the disk entry (or the memory entry), every following load then finds it there instead
//! of fetching again.
//!
//! # Cleanup
//!
//! [`CacheStore::cleanup`] removes entries that have not been written for a configured time.
//! Entries that fail to decode are purged by the [`Fetcher`](crate::fetch::Fetcher).

mod cache_key;
mod key_lock;
mod memory;
mod store;

pub use cache_key::CacheKey;
pub use key_lock::{KeyLockGuard, KeyLocks};
pub use memory::{MemoryCache, MemoryKey};
pub use store::{CacheStore, CleanupStats};
