use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, de};
use url::Url;

use crate::caching::CacheKey;
use crate::error::LoadError;

/// Where a resource lives, parsed from its locator.
///
/// The source kind selects the [`Fetcher`](crate::fetch::Fetcher) variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A resource retrieved over HTTP(S).
    Http(Url),
    /// A `content://` resource, opened through a [`ContentOpener`](crate::fetch::ContentOpener).
    Content(String),
    /// A file on the local file system.
    File(PathBuf),
}

impl Source {
    /// Parses a locator: a URL, a `content://` URI, or a local path.
    pub fn parse(locator: &str) -> Result<Self, LoadError> {
        let url = match Url::parse(locator) {
            Ok(url) => url,
            // relative paths and the like
            Err(_) => return Ok(Self::File(PathBuf::from(locator))),
        };

        match url.scheme() {
            "http" | "https" => Ok(Self::Http(url)),
            "content" => Ok(Self::Content(locator.to_owned())),
            "file" => url.to_file_path().map(Self::File).map_err(|_| {
                LoadError::SourceUnavailable(format!("invalid file locator `{locator}`"))
            }),
            // Windows drive letters parse as a single-letter scheme.
            _ => Ok(Self::File(PathBuf::from(locator))),
        }
    }

    /// Whether the source needs a network round trip.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Http(_))
    }
}

/// How long a cache entry stays valid after it was written.
///
/// Applies to disk cache entries by their mtime and to in-memory images by the time they were
/// decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheValidity {
    /// The entry never goes stale.
    Forever,
    /// The entry is valid while `now - mtime <= period`.
    ///
    /// The boundary is inclusive: an entry exactly `period` old is still valid.
    /// A zero period is taken literally, so entries are practically always stale.
    For(Duration),
}

impl CacheValidity {
    /// Whether an entry of the given age is still valid.
    pub fn is_valid(&self, age: Duration) -> bool {
        match self {
            Self::Forever => true,
            Self::For(period) => age <= *period,
        }
    }
}

impl Default for CacheValidity {
    fn default() -> Self {
        Self::For(Duration::from_secs(7 * 24 * 3600))
    }
}

impl fmt::Display for CacheValidity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forever => f.write_str("forever"),
            Self::For(period) => write!(f, "{}", humantime::format_duration(*period)),
        }
    }
}

impl FromStr for CacheValidity {
    type Err = humantime::DurationError;

    /// Parses `forever` or a humantime duration such as `60s`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "forever" => Ok(Self::Forever),
            period => humantime::parse_duration(period).map(Self::For),
        }
    }
}

impl<'de> Deserialize<'de> for CacheValidity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Hints passed through to the decoder untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DecodeOptions {
    /// The largest size the decoded image is expected to be displayed at.
    pub max_size: Option<(u32, u32)>,
    /// An explicit sub-sampling factor.
    pub sample_size: Option<u32>,
    /// Whether the image may be decoded without an alpha channel.
    pub opaque: bool,
}

/// Per-request load options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Persist network fetches in the disk cache, and serve from it.
    pub enable_disk_cache: bool,
    /// Keep decoded images in the in-memory cache, and serve from it.
    pub enable_memory_cache: bool,
    /// How long cache entries are valid, `None` uses the configured default.
    pub disk_cache_validity: Option<CacheValidity>,
    /// Options for the decoder.
    pub decode: DecodeOptions,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            enable_disk_cache: true,
            enable_memory_cache: true,
            disk_cache_validity: None,
            decode: DecodeOptions::default(),
        }
    }
}

/// A request to load one resource.
///
/// Requests are immutable once created and shared by reference for the duration of a load.
#[derive(Debug, Clone)]
pub struct Request {
    name: String,
    locator: String,
    source: Source,
    key: CacheKey,
    options: LoadOptions,
}

impl Request {
    /// Creates a request with default options, named after its locator.
    pub fn new(locator: impl Into<String>) -> Result<Self, LoadError> {
        let locator = locator.into();
        let source = Source::parse(&locator)?;
        let key = CacheKey::from_locator(&locator);
        Ok(Self {
            name: locator.clone(),
            locator,
            source,
            key,
            options: LoadOptions::default(),
        })
    }

    /// Sets the human-readable name used in logs.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replaces the load options.
    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    /// The key used for both the disk cache and load deduplication.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }
}

/// Which layer produced a delivered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadedFrom {
    /// The in-memory cache of decoded images.
    Memory,
    /// A valid disk cache entry.
    Disk,
    /// A fresh network download.
    Network,
    /// A local file or content resource.
    Local,
}

impl LoadedFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for LoadedFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
