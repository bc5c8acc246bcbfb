//! Resolving requests into raw data.
//!
//! A [`Fetcher`] is selected per request from its [`Source`]: local files and `content://`
//! resources go through the [`LocalFetcher`], HTTP resources through the [`NetworkFetcher`],
//! which also owns the disk cache policy.

use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::TempPath;

use crate::error::LoadError;
use crate::types::{LoadedFrom, Request, Source};

mod local;
mod network;

pub use local::{ContentOpener, FilesystemOpener, LocalFetcher};
pub use network::NetworkFetcher;

/// The raw data of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedData {
    /// Data held in memory.
    Bytes(Bytes),
    /// Data in a file.
    File(PathBuf),
}

/// Where fetched data came from, which decides what happens when it fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOrigin {
    /// A valid entry that was already in the disk cache.
    CacheHit,
    /// A fresh download that was written to the disk cache.
    Fetched,
    /// A fresh download that was not written to the disk cache.
    Transient,
    /// A local file or `content://` resource.
    Local,
}

/// The successful outcome of [`Fetcher::resolve`].
#[derive(Debug)]
pub struct FetchResult {
    data: FetchedData,
    origin: FetchOrigin,
    /// Keeps a spooled download alive until the result is dropped.
    _temp: Option<TempPath>,
}

impl FetchResult {
    pub(crate) fn bytes(data: Bytes, origin: FetchOrigin) -> Self {
        Self {
            data: FetchedData::Bytes(data),
            origin,
            _temp: None,
        }
    }

    pub(crate) fn file(path: PathBuf, origin: FetchOrigin) -> Self {
        Self {
            data: FetchedData::File(path),
            origin,
            _temp: None,
        }
    }

    pub(crate) fn spooled(temp: TempPath) -> Self {
        Self {
            data: FetchedData::File(temp.to_path_buf()),
            origin: FetchOrigin::Transient,
            _temp: Some(temp),
        }
    }

    pub fn data(&self) -> &FetchedData {
        &self.data
    }

    pub fn origin(&self) -> FetchOrigin {
        self.origin
    }

    /// The file backing this result, if any.
    pub fn path(&self) -> Option<&Path> {
        match &self.data {
            FetchedData::Bytes(_) => None,
            FetchedData::File(path) => Some(path),
        }
    }

    /// Returns the data, reading it from disk if necessary.
    ///
    /// This does blocking I/O.
    pub fn read(&self) -> io::Result<Bytes> {
        match &self.data {
            FetchedData::Bytes(bytes) => Ok(bytes.clone()),
            FetchedData::File(path) => std::fs::read(path).map(Bytes::from),
        }
    }

    pub fn loaded_from(&self) -> LoadedFrom {
        match self.origin {
            FetchOrigin::CacheHit => LoadedFrom::Disk,
            FetchOrigin::Fetched | FetchOrigin::Transient => LoadedFrom::Network,
            FetchOrigin::Local => LoadedFrom::Local,
        }
    }
}

/// The fetcher responsible for one request.
#[derive(Debug, Clone, Copy)]
pub enum Fetcher<'a> {
    Local(&'a LocalFetcher),
    Network(&'a NetworkFetcher),
}

impl<'a> Fetcher<'a> {
    /// Picks the fetcher for `source`.
    pub fn select(source: &Source, local: &'a LocalFetcher, network: &'a NetworkFetcher) -> Self {
        if source.is_remote() {
            Self::Network(network)
        } else {
            Self::Local(local)
        }
    }

    /// Produces the raw data for `request`.
    pub async fn resolve(&self, request: &Request) -> Result<FetchResult, LoadError> {
        match self {
            Self::Local(fetcher) => fetcher.resolve(request).await,
            Self::Network(fetcher) => fetcher.resolve(request).await,
        }
    }

    /// Whether data cached for `request` may still be served.
    ///
    /// Local resources have no cache entry of their own.
    pub fn is_fresh(&self, request: &Request) -> bool {
        match self {
            Self::Local(_) => true,
            Self::Network(fetcher) => fetcher.is_fresh(request),
        }
    }

    /// Reacts to `result` failing to decode.
    pub fn on_failed(&self, result: &FetchResult) {
        match self {
            // local resources are never touched
            Self::Local(_) => {}
            Self::Network(fetcher) => fetcher.on_failed(result),
        }
    }
}
