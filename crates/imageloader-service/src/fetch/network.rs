use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use crate::caching::{CacheKey, CacheStore};
use crate::config::DiskCacheConfig;
use crate::download::{Downloaded, Downloader};
use crate::error::LoadError;
use crate::types::{CacheValidity, Request, Source};

use super::{FetchOrigin, FetchResult};

/// Resolves HTTP resources through the disk cache.
///
/// With the disk cache enabled for a request, a valid entry is served without any network call.
/// Otherwise the resource is downloaded straight into the entry's location, replacing whatever
/// was there before.
#[derive(Clone)]
pub struct NetworkFetcher {
    downloader: Arc<dyn Downloader>,
    store: CacheStore,
    default_validity: CacheValidity,
    purge_fresh_on_decode_failure: bool,
}

impl fmt::Debug for NetworkFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkFetcher")
            .field("store", &self.store)
            .field("default_validity", &self.default_validity)
            .field(
                "purge_fresh_on_decode_failure",
                &self.purge_fresh_on_decode_failure,
            )
            .finish()
    }
}

impl NetworkFetcher {
    pub fn new(downloader: Arc<dyn Downloader>, store: CacheStore, config: &DiskCacheConfig) -> Self {
        Self {
            downloader,
            store,
            default_validity: config.default_validity,
            purge_fresh_on_decode_failure: config.purge_fresh_on_decode_failure,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// The validity of cached data for `request`.
    pub fn validity(&self, request: &Request) -> CacheValidity {
        request
            .options()
            .disk_cache_validity
            .unwrap_or(self.default_validity)
    }

    /// Whether the disk cache entry of `request` is still valid.
    ///
    /// Requests that bypass the disk cache have no entry and count as fresh.
    pub fn is_fresh(&self, request: &Request) -> bool {
        if !request.options().enable_disk_cache {
            return true;
        }
        match self.store.path_for(request.key()) {
            Some(location) => self.store.is_valid(&location, self.validity(request)),
            None => true,
        }
    }

    pub async fn resolve(&self, request: &Request) -> Result<FetchResult, LoadError> {
        let Source::Http(url) = request.source() else {
            return Err(LoadError::SourceUnavailable(format!(
                "`{}` is not a network resource",
                request.locator()
            )));
        };

        let location = if request.options().enable_disk_cache {
            self.store.path_for(request.key())
        } else {
            None
        };

        let Some(location) = location else {
            tracing::debug!("Downloading `{}` without disk cache", request.name());
            metric!(counter("loads.network") += 1, "cached" => "false");
            return match self.downloader.download(url, None).await? {
                Downloaded::Bytes(bytes) => Ok(FetchResult::bytes(bytes, FetchOrigin::Transient)),
                Downloaded::File(path) => Ok(FetchResult::file(path, FetchOrigin::Transient)),
                Downloaded::Spooled(temp) => Ok(FetchResult::spooled(temp)),
            };
        };

        let validity = self.validity(request);

        if self.store.is_valid(&location, validity) {
            tracing::debug!(
                "Serving `{}` from disk cache at `{}`",
                request.name(),
                location.display()
            );
            metric!(counter("loads.disk.hit") += 1);
            return Ok(FetchResult::file(location, FetchOrigin::CacheHit));
        }

        tracing::debug!(
            "No valid cache entry for `{}` (validity {}), downloading",
            request.name(),
            validity
        );
        metric!(counter("loads.network") += 1, "cached" => "true");

        match self.downloader.download(url, Some(&location)).await? {
            Downloaded::File(path) => Ok(FetchResult::file(path, FetchOrigin::Fetched)),
            Downloaded::Bytes(bytes) => Ok(self.write_through(request.key(), bytes).await),
            Downloaded::Spooled(temp) => Ok(FetchResult::spooled(temp)),
        }
    }

    /// Persists an in-memory download into the cache.
    ///
    /// A failed write is logged and the bytes are served regardless.
    async fn write_through(&self, key: &CacheKey, bytes: Bytes) -> FetchResult {
        let store = self.store.clone();
        let owned_key = key.clone();
        let data = bytes.clone();
        let written = tokio::task::spawn_blocking(move || store.write(&owned_key, &data)).await;

        let error = match written {
            Ok(Ok(location)) => return FetchResult::file(location, FetchOrigin::Fetched),
            Ok(Err(e)) => LoadError::CacheWriteFailure(e.to_string()),
            Err(e) => LoadError::CacheWriteFailure(e.to_string()),
        };
        tracing::error!(
            error = &error as &dyn std::error::Error,
            key = %key,
            "Failed to write download into the disk cache",
        );
        FetchResult::bytes(bytes, FetchOrigin::Transient)
    }

    /// Purges the cache entry behind `result` if it failed to decode.
    ///
    /// Entries served from the cache are assumed corrupt and always purged, so the next request
    /// downloads them again. Fresh downloads are only purged if configured.
    pub fn on_failed(&self, result: &FetchResult) {
        let purge = match result.origin() {
            FetchOrigin::CacheHit => true,
            FetchOrigin::Fetched => self.purge_fresh_on_decode_failure,
            FetchOrigin::Transient | FetchOrigin::Local => false,
        };

        if let (true, Some(path)) = (purge, result.path()) {
            self.purge(path, result.origin());
        }
    }

    fn purge(&self, path: &Path, origin: FetchOrigin) {
        tracing::debug!("Purging cache entry `{}` ({:?})", path.display(), origin);
        self.store.delete(path);
        metric!(counter("caches.file.purged") += 1);
    }
}
