use std::time::Duration;

use reqwest::redirect;

use crate::config::DownloadConfig;

/// Various timeouts for the downloader.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DownloadTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for receiving the first headers.
    pub head: Duration,
    /// Global timeout for one download, including all retries.
    pub max_download: Duration,
}

impl DownloadTimeouts {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            head: config.head_timeout,
            max_download: config.max_download_timeout,
        }
    }
}

impl Default for DownloadTimeouts {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `config.user_agent` is sent with every request.
/// * The connect timeout and the overall download timeout are applied to the client, the head
///   timeout is applied per request by the downloader.
/// * Follows up to 10 redirects.
pub fn create_client(config: &DownloadConfig) -> reqwest::Result<reqwest::Client> {
    let timeouts = DownloadTimeouts::from_config(config);

    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(config.user_agent.as_str())
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_download)
        .pool_idle_timeout(Duration::from_secs(30))
        .redirect(redirect::Policy::limited(10))
        .build()
}
