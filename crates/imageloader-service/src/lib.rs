//! Request-keyed image loading.
//!
//! A load goes through a [`LoadCoordinator`](coordinator::LoadCoordinator), which serializes
//! concurrent loads of the same resource via [`KeyLocks`](caching::KeyLocks), consults the
//! in-memory and on-disk caches, fetches missing data through a
//! [`Fetcher`](fetch::Fetcher), hands the bytes to an external [`Decoder`](decode::Decoder)
//! and finally delivers the outcome through a [`ResultDispatcher`](dispatch::ResultDispatcher).

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod dispatch;
pub mod download;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod types;
pub mod utils;

pub use coordinator::{LoadCoordinator, LoadCoordinatorBuilder, LoadHandle, LoadState};
pub use decode::{Decoder, RawDecoder};
pub use dispatch::{Delivery, Loaded, ResultDispatcher};
pub use error::LoadError;
pub use types::{CacheValidity, DecodeOptions, LoadOptions, LoadedFrom, Request, Source};
