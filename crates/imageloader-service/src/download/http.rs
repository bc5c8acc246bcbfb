//! Support to download from HTTP sources.

use std::path::Path;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use futures::future::BoxFuture;
use reqwest::Client;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::caching::CacheStore;
use crate::config::DownloadConfig;
use crate::error::LoadError;
use crate::utils::http::{DownloadTimeouts, create_client};

use super::{Downloaded, Downloader, MeasureDownloadGuard, error_from_status, retry};

/// Downloader implementation for HTTP(S) resources.
///
/// Temp files, both for a requested target and for spooling, are created through the
/// [`CacheStore`], so publishing into the cache is a rename.
#[derive(Debug)]
pub struct HttpDownloader {
    client: Client,
    timeouts: DownloadTimeouts,
    max_retries: usize,
    retry_delay: Duration,
    max_in_memory_size: u64,
    store: CacheStore,
}

impl HttpDownloader {
    pub fn new(client: Client, config: &DownloadConfig, store: CacheStore) -> Self {
        Self {
            client,
            timeouts: DownloadTimeouts::from_config(config),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            max_in_memory_size: config.max_in_memory_size,
            store,
        }
    }

    /// Creates a downloader with a client built from `config`.
    pub fn from_config(config: &DownloadConfig, store: CacheStore) -> reqwest::Result<Self> {
        let client = create_client(config)?;
        Ok(Self::new(client, config, store))
    }

    async fn download_with_retry(
        &self,
        url: &Url,
        target: Option<&Path>,
    ) -> Result<Downloaded, LoadError> {
        let measure = MeasureDownloadGuard::new();

        let attempts = retry(self.max_retries, self.retry_delay, || {
            self.download_once(url, target, &measure)
        });
        let result = tokio::time::timeout(self.timeouts.max_download, attempts)
            .await
            .unwrap_or(Err(LoadError::Timeout(self.timeouts.max_download)));

        if let Err(err) = &result {
            tracing::debug!(
                error = err as &dyn std::error::Error,
                url = %url,
                "failed to download resource"
            );
        }

        measure.done(&result);
        result
    }

    async fn download_once(
        &self,
        url: &Url,
        target: Option<&Path>,
        measure: &MeasureDownloadGuard,
    ) -> Result<Downloaded, LoadError> {
        tracing::debug!("Fetching resource from `{}`", url);

        let request = self.client.get(url.clone()).send();
        let response = tokio::time::timeout(self.timeouts.head, request)
            .await
            .map_err(|_| LoadError::Timeout(self.timeouts.head))??;

        let status = response.status();
        if !status.is_success() {
            return Err(error_from_status(url, status));
        }
        tracing::trace!("Success hitting `{url}`");

        let mut stream = response.bytes_stream();

        if let Some(target) = target {
            let temp_file = self
                .store
                .tempfile()
                .map_err(|e| LoadError::CacheWriteFailure(e.to_string()))?;
            let mut file = tokio::fs::File::from_std(temp_file.as_file().try_clone()?);

            while let Some(chunk) = stream.next().await.transpose()? {
                measure.add_bytes_transferred(chunk.len() as u64);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            drop(file);

            return match self.store.persist(temp_file, target) {
                Ok(()) => Ok(Downloaded::File(target.to_owned())),
                Err(err) => {
                    // The download itself is complete, so it can still be served.
                    let error = LoadError::CacheWriteFailure(err.error.to_string());
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        path = %target.display(),
                        "Failed to publish download into the cache",
                    );
                    Ok(Downloaded::Spooled(err.file.into_temp_path()))
                }
            };
        }

        let mut buffer = BytesMut::new();
        let mut spool: Option<(NamedTempFile, tokio::fs::File)> = None;

        while let Some(chunk) = stream.next().await.transpose()? {
            measure.add_bytes_transferred(chunk.len() as u64);

            if let Some((_, file)) = &mut spool {
                file.write_all(&chunk).await?;
            } else if (buffer.len() + chunk.len()) as u64 > self.max_in_memory_size {
                tracing::trace!("Spooling download of `{url}` to disk");
                let temp_file = self.store.tempfile()?;
                let mut file = tokio::fs::File::from_std(temp_file.as_file().try_clone()?);
                file.write_all(&buffer).await?;
                file.write_all(&chunk).await?;
                buffer = BytesMut::new();
                spool = Some((temp_file, file));
            } else {
                buffer.extend_from_slice(&chunk);
            }
        }

        match spool {
            Some((temp_file, mut file)) => {
                file.flush().await?;
                drop(file);
                Ok(Downloaded::Spooled(temp_file.into_temp_path()))
            }
            None => Ok(Downloaded::Bytes(buffer.freeze())),
        }
    }
}

impl Downloader for HttpDownloader {
    fn download<'a>(
        &'a self,
        url: &'a Url,
        target: Option<&'a Path>,
    ) -> BoxFuture<'a, Result<Downloaded, LoadError>> {
        Box::pin(self.download_with_retry(url, target))
    }
}
