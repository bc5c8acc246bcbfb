use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::types::CacheValidity;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "imageloader".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the disk cache.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DiskCacheConfig {
    /// Validity period for requests that do not specify their own.
    pub default_validity: CacheValidity,

    /// Maximum age of an entry before [`cleanup`](crate::caching::CacheStore::cleanup)
    /// removes it, regardless of any request's validity period.
    #[serde(with = "humantime_serde")]
    pub max_unused_for: Option<Duration>,

    /// Also purge a freshly downloaded entry when it fails to decode.
    ///
    /// Entries that were served from the cache and fail to decode are always purged.
    pub purge_fresh_on_decode_failure: bool,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            default_validity: CacheValidity::default(),
            max_unused_for: Some(Duration::from_secs(3600 * 24 * 30)),
            purge_fresh_on_decode_failure: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Capacity (in bytes) of the decoded image cache.
    ///
    /// The size limit is a best-effort approximation based on the decoder's weight.
    ///
    /// Defaults to `64 MiB`.
    pub capacity: u64,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configure the on-disk cache of downloaded resources.
    pub disk: DiskCacheConfig,
    /// Configure the in-memory cache of decoded images.
    pub memory: MemoryCacheConfig,
}

/// Settings for the network downloader.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for receiving the response headers, per attempt.
    #[serde(with = "humantime_serde")]
    pub head_timeout: Duration,

    /// Upper limit for one download including all retries.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,

    /// How often a failed download is retried.
    pub max_retries: usize,

    /// Delay between two attempts.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Downloads without a cache target larger than this are spooled to a temp file instead of
    /// being kept in memory.
    pub max_in_memory_size: u64,

    /// The `User-Agent` header sent with every request.
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            head_timeout: Duration::from_secs(10),
            max_download_timeout: Duration::from_secs(60),
            max_retries: 2,
            retry_delay: Duration::from_millis(20),
            max_in_memory_size: 2 * 1024 * 1024,
            user_agent: concat!("imageloader/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

/// Configuration of the image loader.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use when caching. Default is not to cache on disk.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune the cache layers.
    pub caches: CacheConfigs,

    /// Network downloader settings.
    pub download: DownloadConfig,

    /// The number of loads that run in parallel.
    pub max_concurrent_loads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            download: DownloadConfig::default(),
            max_concurrent_loads: 8,
        }
    }
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no disk caching should happen
    /// and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }

    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
