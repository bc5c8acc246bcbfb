use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use url::Url;

use crate::error::LoadError;
use crate::types::{Request, Source};

use super::{FetchOrigin, FetchResult};

/// Opens `content://` resources.
///
/// This is the hook through which the embedding application exposes resources that have no
/// file system path of their own.
pub trait ContentOpener: Send + Sync + 'static {
    /// Opens a reader over the resource behind `locator`.
    fn open(&self, locator: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// A [`ContentOpener`] that serves `content://{authority}/{path}` from
/// `{root}/{authority}/{path}`.
#[derive(Debug, Clone)]
pub struct FilesystemOpener {
    root: PathBuf,
}

impl FilesystemOpener {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps a locator onto a path below the root.
    ///
    /// Returns `None` for anything that would escape the root.
    fn resolve_path(&self, locator: &str) -> Option<PathBuf> {
        let url = Url::parse(locator).ok()?;
        if url.scheme() != "content" {
            return None;
        }

        let authority = url.host_str()?;
        if !is_plain_name(authority) {
            return None;
        }

        let mut path = self.root.join(authority);
        for segment in url.path_segments()? {
            match segment {
                "" | "." => continue,
                segment if !is_plain_name(segment) => return None,
                segment => path.push(segment),
            }
        }
        Some(path)
    }
}

/// Whether `name` is a single, regular path component.
fn is_plain_name(name: &str) -> bool {
    !matches!(name, "" | "." | "..") && !name.contains(['/', '\\'])
}

impl ContentOpener for FilesystemOpener {
    fn open(&self, locator: &str) -> io::Result<Box<dyn Read + Send>> {
        let path = self.resolve_path(locator).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "invalid content locator")
        })?;
        tracing::trace!("Opening `{}` from `{}`", locator, path.display());
        Ok(Box::new(std::fs::File::open(path)?))
    }
}

/// Resolves local files and `content://` resources.
///
/// There is no caching layer involved, the data is already local. Failures have no side effects.
#[derive(Clone, Default)]
pub struct LocalFetcher {
    opener: Option<Arc<dyn ContentOpener>>,
}

impl fmt::Debug for LocalFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFetcher")
            .field("opener", &self.opener.is_some())
            .finish()
    }
}

impl LocalFetcher {
    /// Creates a fetcher. Without an `opener`, `content://` resources are unavailable.
    pub fn new(opener: Option<Arc<dyn ContentOpener>>) -> Self {
        Self { opener }
    }

    pub async fn resolve(&self, request: &Request) -> Result<FetchResult, LoadError> {
        match request.source() {
            Source::File(path) => self.resolve_file(path).await,
            Source::Content(locator) => self.resolve_content(locator).await,
            Source::Http(url) => Err(LoadError::SourceUnavailable(format!(
                "`{url}` is not a local resource"
            ))),
        }
    }

    async fn resolve_file(&self, path: &Path) -> Result<FetchResult, LoadError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| unavailable(&path.display(), &e))?;
        if !metadata.is_file() {
            return Err(LoadError::SourceUnavailable(format!(
                "`{}` is not a file",
                path.display()
            )));
        }

        tracing::debug!("Serving local file `{}`", path.display());
        Ok(FetchResult::file(path.to_owned(), FetchOrigin::Local))
    }

    async fn resolve_content(&self, locator: &str) -> Result<FetchResult, LoadError> {
        let Some(opener) = self.opener.clone() else {
            return Err(LoadError::SourceUnavailable(format!(
                "no content opener for `{locator}`"
            )));
        };

        let owned = locator.to_owned();
        let read = tokio::task::spawn_blocking(move || {
            let mut reader = opener.open(&owned)?;
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok::<_, io::Error>(buf)
        })
        .await
        .map_err(LoadError::from_std_error)?;

        let buf = read.map_err(|e| unavailable(&locator, &e))?;
        tracing::debug!("Read {} bytes from `{}`", buf.len(), locator);
        Ok(FetchResult::bytes(Bytes::from(buf), FetchOrigin::Local))
    }
}

fn unavailable(what: &dyn fmt::Display, error: &io::Error) -> LoadError {
    tracing::debug!(
        error = error as &dyn std::error::Error,
        "Failed to open local resource `{}`",
        what
    );
    LoadError::SourceUnavailable(format!("{what}: {error}"))
}
