//! The network downloader.
//!
//! The [`Downloader`] trait is the seam between the [`NetworkFetcher`](crate::fetch::NetworkFetcher)
//! and the actual transfer. [`HttpDownloader`] is the `reqwest` based implementation.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use tempfile::TempPath;
use url::Url;

use crate::error::LoadError;
use crate::utils::futures::m;

mod http;

pub use http::HttpDownloader;

/// The outcome of a successful download.
#[derive(Debug)]
pub enum Downloaded {
    /// The payload was small enough to be kept in memory.
    Bytes(Bytes),
    /// The payload was written to the requested target and published there.
    File(PathBuf),
    /// No target was requested and the payload was too large to keep in memory.
    ///
    /// The file is removed once the [`TempPath`] is dropped.
    Spooled(TempPath),
}

/// Retrieves remote resources.
///
/// Exactly one outcome is produced per call: a [`Downloaded`] or a [`LoadError`].
pub trait Downloader: Send + Sync + 'static {
    /// Downloads `url`.
    ///
    /// With a `target`, the payload is published at that location once it has been transferred
    /// completely. Implementations may still return [`Downloaded::Bytes`] if publishing failed
    /// and the data is otherwise available.
    fn download<'a>(
        &'a self,
        url: &'a Url,
        target: Option<&'a Path>,
    ) -> BoxFuture<'a, Result<Downloaded, LoadError>>;
}

/// Runs a download up to `1 + max_retries` times with `delay` in between.
///
/// `NotFound` and `PermissionDenied` are never retried.
pub async fn retry<G, F, T>(max_retries: usize, delay: Duration, task_gen: G) -> Result<T, LoadError>
where
    G: Fn() -> F,
    F: Future<Output = Result<T, LoadError>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        let result = task_gen().await;

        // its highly unlikely we get a different result when retrying these
        let should_not_retry = matches!(
            result,
            Ok(_) | Err(LoadError::NotFound | LoadError::PermissionDenied(_))
        );

        if should_not_retry || tries > max_retries {
            break result;
        }

        metric!(counter("download.retry") += 1);
        tokio::time::sleep(delay).await;
    }
}

/// Converts an unsuccessful response status to a [`LoadError`].
fn error_from_status(source: &Url, status: StatusCode) -> LoadError {
    debug_assert!(!status.is_success());

    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{source}`: {status}");

        LoadError::PermissionDenied(status.to_string())
    } else if status == StatusCode::FOUND {
        tracing::debug!("Potential login page detected when downloading from `{source}`: {status}");

        LoadError::PermissionDenied("Potential login page detected".to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{source}`: {status}");

        LoadError::NotFound
    } else {
        tracing::debug!("Unexpected status code from `{source}`: {status}");

        LoadError::NetworkFailure(status.to_string())
    }
}

/// State of the [`MeasureDownloadGuard`].
#[derive(Clone, Copy, Debug)]
enum MeasureState {
    /// The future is not ready.
    Pending,
    /// The future has terminated with a status.
    Done(&'static str),
}

/// A guard to measure the amount of time it takes to download a resource.
///
/// Emits `download.duration` tagged with the outcome, and `download.size` if any bytes were
/// transferred. A guard dropped before [`done`](Self::done) reports a `canceled` download.
struct MeasureDownloadGuard {
    state: MeasureState,
    creation_time: Instant,
    bytes_transferred: AtomicU64,
}

impl MeasureDownloadGuard {
    fn new() -> Self {
        Self {
            state: MeasureState::Pending,
            creation_time: Instant::now(),
            bytes_transferred: AtomicU64::new(0),
        }
    }

    fn add_bytes_transferred(&self, additional_bytes: u64) {
        self.bytes_transferred
            .fetch_add(additional_bytes, Ordering::Relaxed);
    }

    /// Marks the download as terminated.
    fn done<T, E>(mut self, reason: &Result<T, E>) {
        self.state = MeasureState::Done(m::result(reason));
    }
}

impl Drop for MeasureDownloadGuard {
    fn drop(&mut self) {
        let status = match self.state {
            MeasureState::Pending => "canceled",
            MeasureState::Done(status) => status,
        };

        metric!(
            timer("download.duration") = self.creation_time.elapsed(),
            "status" => status,
        );

        let bytes_transferred = *self.bytes_transferred.get_mut();
        if bytes_transferred > 0 {
            metric!(
                time_raw("download.size") = bytes_transferred,
                "status" => status,
            );
        }
    }
}
