use std::error::Error;
use std::time::Duration;

use thiserror::Error;

/// The reason a load ended in the `Failed` state.
///
/// Every failure happening while fetching, caching or decoding is converted into one of these
/// variants at the fetcher / coordinator boundary. Consumers receive it as part of their
/// delivery and may show a fallback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// A local file or `content://` resource could not be opened or read.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// The resource does not exist at the remote location.
    #[error("not found")]
    NotFound,
    /// The remote location refused access to the resource.
    ///
    /// The attached string contains the response status.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The download did not finish in time.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The download failed for any other reason, like connection loss, DNS resolution, or a 5xx
    /// server response.
    #[error("network failure: {0}")]
    NetworkFailure(String),
    /// The decoder rejected the fetched data.
    #[error("decode failure: {0}")]
    DecodeFailure(String),
    /// Persisting fetched data into the disk cache failed, and the data was not recoverable
    /// otherwise.
    #[error("cache write failure: {0}")]
    CacheWriteFailure(String),
    /// The request was cancelled before it reached decoding.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected local error, such as a failing spawn or an I/O error on a temp file.
    #[error("internal error")]
    InternalError,
}

impl LoadError {
    /// Whether this error was produced by the network downloader.
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            Self::NotFound | Self::PermissionDenied(_) | Self::Timeout(_) | Self::NetworkFailure(_)
        )
    }

    /// A short tag used for metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::NotFound => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Timeout(_) => "timeout",
            Self::NetworkFailure(_) => "network_failure",
            Self::DecodeFailure(_) => "decode_failure",
            Self::CacheWriteFailure(_) => "cache_write_failure",
            Self::Cancelled => "cancelled",
            Self::InternalError => "internal_error",
        }
    }

    /// Logs an unexpected error and turns it into [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: Error + 'static>(e: E) -> Self {
        let dynerr: &dyn Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Builds a [`NetworkFailure`](Self::NetworkFailure) from the innermost cause of `error`.
    pub(crate) fn network_failure(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        Self::NetworkFailure(error_string)
    }
}

impl From<std::io::Error> for LoadError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<reqwest::Error> for LoadError {
    fn from(error: reqwest::Error) -> Self {
        Self::network_failure(&error)
    }
}
