use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use imageloader_service::config::Config;
use imageloader_service::fetch::FetchResult;
use imageloader_service::{
    CacheValidity, DecodeOptions, Decoder, LoadCoordinator, LoadError, LoadOptions, RawDecoder,
    Request,
};
use url::Url;

/// Creates a coordinator with the raw decoder.
pub fn coordinator<F>(cache_dir: Option<&Path>, f: F) -> LoadCoordinator<RawDecoder>
where
    F: FnOnce(&mut Config),
{
    LoadCoordinator::new(&config(cache_dir, f), RawDecoder).unwrap()
}

pub fn config<F>(cache_dir: Option<&Path>, f: F) -> Config
where
    F: FnOnce(&mut Config),
{
    let mut config = Config {
        cache_dir: cache_dir.map(Path::to_owned),
        ..Default::default()
    };
    config.download.retry_delay = Duration::ZERO;
    f(&mut config);
    config
}

/// A request for `url` that only uses the disk cache, with the given validity.
pub fn disk_request(url: &Url, validity: Duration) -> Arc<Request> {
    let request = Request::new(url.as_str()).unwrap().with_options(LoadOptions {
        enable_memory_cache: false,
        disk_cache_validity: Some(CacheValidity::For(validity)),
        ..Default::default()
    });
    Arc::new(request)
}

/// Moves the mtime of `path` into the past.
pub fn set_age(path: &Path, age: Duration) {
    let mtime = filetime::FileTime::from_system_time(SystemTime::now() - age);
    filetime::set_file_mtime(path, mtime).unwrap();
}

/// A decoder passing the raw data through, which can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct FlakyDecoder {
    failures: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl FlakyDecoder {
    /// Makes the next `n` decodes fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Decoder for FlakyDecoder {
    type Image = Bytes;

    fn decode(&self, data: &FetchResult, options: &DecodeOptions) -> Result<Bytes, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(LoadError::DecodeFailure("corrupt image header".into()));
        }
        RawDecoder.decode(data, options)
    }

    fn weight(&self, image: &Bytes) -> u32 {
        image.len() as u32
    }
}
