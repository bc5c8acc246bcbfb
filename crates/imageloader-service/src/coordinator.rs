//! Orchestration of a single load.
//!
//! Every load moves through these states:
//!
//! ```text
//! Queued -> LockAcquired -> Resolving -> Decoding -> Delivered -> LockReleased
//!                                                 \-> Failed    -/
//! ```
//!
//! A load waits for the [`KeyLocks`] entry of its key and then for a worker slot while `Queued`.
//! Holding the key lock, it consults the memory cache, resolves the raw data through the
//! [`Fetcher`] selected for its source and decodes it. The outcome is dispatched before the lock
//! is released, so a second load of the same key only starts once the first one has been fully
//! handled and finds the result in one of the caches.
//!
//! Cancellation is honored until decoding starts. A cancelled load ends as `Failed` with
//! [`LoadError::Cancelled`] and is not dispatched. `LockReleased` is always the final state.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use sentry::{Hub, SentryFutureExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::caching::{CacheStore, KeyLockGuard, KeyLocks, MemoryCache, MemoryKey};
use crate::config::Config;
use crate::decode::Decoder;
use crate::dispatch::{Delivery, ImmediateDispatcher, Loaded, ResultDispatcher};
use crate::download::{Downloader, HttpDownloader};
use crate::error::LoadError;
use crate::fetch::{ContentOpener, Fetcher, LocalFetcher, NetworkFetcher};
use crate::types::{LoadedFrom, Request};
use crate::utils::futures::{m, measure};

/// The state of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadState {
    /// Waiting for the key lock and for a worker.
    Queued,
    /// The key lock and a worker are held.
    LockAcquired,
    /// A fetcher is producing the raw data.
    Resolving,
    /// The decoder is running. The load can no longer be cancelled.
    Decoding,
    /// The image was produced and dispatched.
    Delivered,
    /// The load failed or was cancelled.
    Failed,
    /// The key lock was released, the load is done.
    LockReleased,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::LockAcquired => "lock_acquired",
            Self::Resolving => "resolving",
            Self::Decoding => "decoding",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::LockReleased => "lock_released",
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn transition(state: &watch::Sender<LoadState>, next: LoadState) {
    tracing::trace!("Load is {}", next);
    state.send_replace(next);
}

/// A handle to a load started with [`LoadCoordinator::submit`].
///
/// Dropping the handle does not cancel the load.
#[derive(Debug)]
pub struct LoadHandle<I> {
    cancel: CancellationToken,
    state: watch::Receiver<LoadState>,
    task: JoinHandle<Result<Loaded<I>, LoadError>>,
}

impl<I> LoadHandle<I> {
    /// Requests cancellation of the load.
    ///
    /// This has no effect once decoding has started.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The current state of the load.
    pub fn state(&self) -> LoadState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<LoadState> {
        self.state.clone()
    }

    /// Waits for the load to finish and returns its outcome.
    pub async fn wait(self) -> Result<Loaded<I>, LoadError> {
        self.task.await.map_err(LoadError::from_std_error)?
    }
}

struct Inner<D: Decoder> {
    locks: KeyLocks,
    local: LocalFetcher,
    network: NetworkFetcher,
    memory: MemoryCache<D::Image>,
    decoder: Arc<D>,
    dispatcher: Arc<dyn ResultDispatcher<D::Image>>,
    workers: Arc<Semaphore>,
}

/// Runs loads: deduplicates them per key, consults the caches, fetches, decodes and dispatches.
pub struct LoadCoordinator<D: Decoder> {
    inner: Arc<Inner<D>>,
}

impl<D: Decoder> Clone for LoadCoordinator<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Decoder> fmt::Debug for LoadCoordinator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadCoordinator")
            .field("locks", &self.inner.locks.len())
            .field("local", &self.inner.local)
            .field("network", &self.inner.network)
            .field("memory", &self.inner.memory)
            .field("workers", &self.inner.workers.available_permits())
            .finish()
    }
}

impl<D: Decoder> LoadCoordinator<D> {
    /// Creates a coordinator with the default collaborators.
    pub fn new(config: &Config, decoder: D) -> Result<Self> {
        Self::builder(config, decoder).build()
    }

    pub fn builder(config: &Config, decoder: D) -> LoadCoordinatorBuilder<'_, D> {
        LoadCoordinatorBuilder {
            config,
            decoder,
            downloader: None,
            opener: None,
            dispatcher: None,
            locks: None,
        }
    }

    /// The disk cache used by network loads.
    pub fn store(&self) -> &CacheStore {
        self.inner.network.store()
    }

    /// The lock registry deduplicating loads.
    pub fn key_locks(&self) -> &KeyLocks {
        &self.inner.locks
    }

    /// Runs a load on the current task and returns its outcome.
    ///
    /// The outcome is not dispatched.
    pub async fn load(&self, request: Arc<Request>) -> Result<Loaded<D::Image>, LoadError> {
        let (state, _) = watch::channel(LoadState::Queued);
        self.execute(&request, &CancellationToken::new(), &state, |_| {})
            .await
    }

    /// Spawns a load and dispatches its outcome to `consumer`.
    ///
    /// The consumer is called exactly once, unless the load is cancelled. This must be called
    /// from within a tokio runtime.
    pub fn submit<F>(&self, request: Arc<Request>, consumer: F) -> LoadHandle<D::Image>
    where
        F: FnOnce(Delivery<D::Image>) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (state, receiver) = watch::channel(LoadState::Queued);

        let coordinator = self.clone();
        let token = cancel.clone();
        let future = async move {
            let dispatcher = Arc::clone(&coordinator.inner.dispatcher);
            let deliver = |result: &Result<Loaded<D::Image>, LoadError>| {
                if matches!(result, Err(LoadError::Cancelled)) {
                    return;
                }
                let delivery = Delivery {
                    request: Arc::clone(&request),
                    result: result.clone(),
                };
                dispatcher.dispatch(Box::new(consumer), delivery);
            };
            coordinator.execute(&request, &token, &state, deliver).await
        };

        let task = tokio::spawn(future.bind_hub(Hub::new_from_top(Hub::current())));

        LoadHandle {
            cancel,
            state: receiver,
            task,
        }
    }

    async fn execute<F>(
        &self,
        request: &Request,
        cancel: &CancellationToken,
        state: &watch::Sender<LoadState>,
        deliver: F,
    ) -> Result<Loaded<D::Image>, LoadError>
    where
        F: FnOnce(&Result<Loaded<D::Image>, LoadError>),
    {
        let span = tracing::info_span!("load", name = %request.name(), key = %request.key());

        let future = async move {
            metric!(counter("loads.access") += 1);
            transition(state, LoadState::Queued);

            let held = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                held = self.acquire(request) => Some(held),
            };

            let (held, result) = match held {
                None => (None, Err(LoadError::Cancelled)),
                Some(Err(err)) => (None, Err(err)),
                Some(Ok(held)) => {
                    transition(state, LoadState::LockAcquired);
                    let result = self.resolve_and_decode(request, cancel, state).await;
                    (Some(held), result)
                }
            };

            let result = self.finish(state, result, deliver);
            drop(held);
            transition(state, LoadState::LockReleased);
            result
        };

        measure("loads.duration", m::load_result, future)
            .instrument(span)
            .await
    }

    /// Waits for the key lock of `request` and then for a free worker.
    ///
    /// The key lock is taken first, so loads queued behind the same key do not occupy workers.
    async fn acquire(
        &self,
        request: &Request,
    ) -> Result<(KeyLockGuard, OwnedSemaphorePermit), LoadError> {
        let guard = self.inner.locks.acquire(request.key()).await;
        let permit = Arc::clone(&self.inner.workers)
            .acquire_owned()
            .await
            .map_err(LoadError::from_std_error)?;
        Ok((guard, permit))
    }

    /// Records the terminal state of a load and hands the outcome to `deliver`.
    fn finish<F>(
        &self,
        state: &watch::Sender<LoadState>,
        result: Result<Loaded<D::Image>, LoadError>,
        deliver: F,
    ) -> Result<Loaded<D::Image>, LoadError>
    where
        F: FnOnce(&Result<Loaded<D::Image>, LoadError>),
    {
        match &result {
            Ok(loaded) => {
                tracing::debug!("Loaded from {}", loaded.from);
                transition(state, LoadState::Delivered);
            }
            Err(err) => {
                tracing::debug!(error = err as &dyn std::error::Error, "Load failed");
                let network = if err.is_network_failure() { "true" } else { "false" };
                metric!(
                    counter("loads.failed") += 1,
                    "reason" => err.metrics_tag(),
                    "network" => network,
                );
                transition(state, LoadState::Failed);
            }
        }
        deliver(&result);
        result
    }

    async fn resolve_and_decode(
        &self,
        request: &Request,
        cancel: &CancellationToken,
        state: &watch::Sender<LoadState>,
    ) -> Result<Loaded<D::Image>, LoadError> {
        let options = request.options();
        let memory_key = MemoryKey {
            key: request.key().clone(),
            decode: options.decode.clone(),
        };

        let fetcher = Fetcher::select(request.source(), &self.inner.local, &self.inner.network);
        let validity = self.inner.network.validity(request);

        if options.enable_memory_cache {
            match self.inner.memory.get(&memory_key, validity).await {
                Some(image) if fetcher.is_fresh(request) => {
                    metric!(counter("loads.memory.hit") += 1);
                    return Ok(Loaded {
                        image,
                        from: LoadedFrom::Memory,
                    });
                }
                Some(_) => {
                    // the disk entry it was decoded from went stale
                    tracing::debug!("Dropping in-memory image of `{}`", request.name());
                    self.inner.memory.invalidate(&memory_key).await;
                }
                None => {}
            }
        }

        transition(state, LoadState::Resolving);
        // a failed resolve leaves no cache entry behind, so there is nothing for `on_failed`
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LoadError::Cancelled),
            fetched = fetcher.resolve(request) => fetched?,
        };
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        transition(state, LoadState::Decoding);
        let decoder = Arc::clone(&self.inner.decoder);
        let decode_options = options.decode.clone();
        let (fetched, decoded) = tokio::task::spawn_blocking(move || {
            let decoded = decoder.decode(&fetched, &decode_options);
            (fetched, decoded)
        })
        .await
        .map_err(LoadError::from_std_error)?;

        match decoded {
            Ok(image) => {
                let image = Arc::new(image);
                if options.enable_memory_cache {
                    self.inner
                        .memory
                        .insert(memory_key, Arc::clone(&image), validity)
                        .await;
                }
                Ok(Loaded {
                    image,
                    from: fetched.loaded_from(),
                })
            }
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "Failed to decode data from {:?}",
                    fetched.origin()
                );
                fetcher.on_failed(&fetched);
                Err(err)
            }
        }
    }
}

/// Configures the collaborators of a [`LoadCoordinator`].
pub struct LoadCoordinatorBuilder<'a, D: Decoder> {
    config: &'a Config,
    decoder: D,
    downloader: Option<Arc<dyn Downloader>>,
    opener: Option<Arc<dyn ContentOpener>>,
    dispatcher: Option<Arc<dyn ResultDispatcher<D::Image>>>,
    locks: Option<KeyLocks>,
}

impl<D: Decoder> LoadCoordinatorBuilder<'_, D> {
    /// Replaces the default [`HttpDownloader`].
    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Enables `content://` resources.
    pub fn content_opener(mut self, opener: Arc<dyn ContentOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Replaces the default [`ImmediateDispatcher`].
    pub fn dispatcher(mut self, dispatcher: Arc<dyn ResultDispatcher<D::Image>>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Shares a lock registry with other coordinators.
    pub fn key_locks(mut self, locks: KeyLocks) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn build(self) -> Result<LoadCoordinator<D>> {
        let config = self.config;

        let store = CacheStore::from_config(config).context("failed to create cache directory")?;
        store
            .clear_tmp()
            .context("failed to clear temporary cache files")?;

        let downloader = match self.downloader {
            Some(downloader) => downloader,
            None => Arc::new(
                HttpDownloader::from_config(&config.download, store.clone())
                    .context("failed to create HTTP client")?,
            ),
        };

        let decoder = Arc::new(self.decoder);
        let memory = {
            let decoder = Arc::clone(&decoder);
            MemoryCache::new(&config.caches.memory, move |image| decoder.weight(image))
        };

        let inner = Inner {
            locks: self.locks.unwrap_or_default(),
            local: LocalFetcher::new(self.opener),
            network: NetworkFetcher::new(downloader, store, &config.caches.disk),
            memory,
            decoder,
            dispatcher: self
                .dispatcher
                .unwrap_or_else(|| Arc::new(ImmediateDispatcher)),
            workers: Arc::new(Semaphore::new(config.max_concurrent_loads.max(1))),
        };

        Ok(LoadCoordinator {
            inner: Arc::new(inner),
        })
    }
}
