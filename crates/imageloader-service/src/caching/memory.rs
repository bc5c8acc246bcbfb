use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::MemoryCacheConfig;
use crate::types::{CacheValidity, DecodeOptions};

use super::CacheKey;

/// The key of a decoded image in the [`MemoryCache`].
///
/// The same resource decoded with different options yields different images, so the options are
/// part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryKey {
    pub key: CacheKey,
    pub decode: DecodeOptions,
}

/// A decoded image along with the time it was produced.
struct InMemoryItem<I> {
    image: Arc<I>,
    created: Instant,
    /// When moka evicts the item. `None` keeps it until capacity pushes it out.
    deadline: Option<Instant>,
}

impl<I> Clone for InMemoryItem<I> {
    fn clone(&self) -> Self {
        Self {
            image: Arc::clone(&self.image),
            created: self.created,
            deadline: self.deadline,
        }
    }
}

/// A struct implementing [`moka::Expiry`] that uses the [`InMemoryItem`] deadline as the explicit
/// expiration time.
struct ImageExpiration;

fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Duration {
    target_time
        .checked_duration_since(current_time)
        .unwrap_or_default()
}

impl<I> moka::Expiry<MemoryKey, InMemoryItem<I>> for ImageExpiration {
    fn expire_after_create(
        &self,
        _key: &MemoryKey,
        value: &InMemoryItem<I>,
        current_time: Instant,
    ) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| saturating_duration_since(current_time, deadline))
    }

    fn expire_after_update(
        &self,
        _key: &MemoryKey,
        value: &InMemoryItem<I>,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| saturating_duration_since(current_time, deadline))
    }
}

type InMemoryCache<I> = moka::future::Cache<MemoryKey, InMemoryItem<I>>;

/// An in-memory cache of decoded images.
///
/// The capacity is a best-effort limit on the summed weight of all items, as reported by the
/// weigher. A capacity of zero disables the cache.
///
/// Items are subject to the same [`CacheValidity`] as disk cache entries: an item older than the
/// validity of the request looking it up is a miss, and items expire once the validity they were
/// inserted with has passed.
pub struct MemoryCache<I> {
    cache: Option<InMemoryCache<I>>,
}

impl<I> std::fmt::Debug for MemoryCache<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field(
                "in-memory items",
                &self.cache.as_ref().map(|c| c.entry_count()),
            )
            .finish()
    }
}

impl<I> Clone for MemoryCache<I> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<I: Send + Sync + 'static> MemoryCache<I> {
    pub fn new<W>(config: &MemoryCacheConfig, weigher: W) -> Self
    where
        W: Fn(&I) -> u32 + Send + Sync + 'static,
    {
        if config.capacity == 0 {
            return Self { cache: None };
        }

        let cache = InMemoryCache::builder()
            .max_capacity(config.capacity)
            .name("images")
            .expire_after(ImageExpiration)
            // NOTE: we count the key and the timestamps to the weight as well
            .weigher(move |_k, v: &InMemoryItem<I>| {
                weigher(&v.image)
                    .saturating_add(std::mem::size_of::<(MemoryKey, Instant, Instant)>() as u32)
            })
            .build();

        Self { cache: Some(cache) }
    }

    /// Returns the image for `key` if it is younger than `validity`.
    pub async fn get(&self, key: &MemoryKey, validity: CacheValidity) -> Option<Arc<I>> {
        let item = self.cache.as_ref()?.get(key).await?;
        let age = item.created.elapsed();
        if !validity.is_valid(age) {
            tracing::trace!("In-memory image `{}` is {:?} old, stale", key.key, age);
            return None;
        }
        Some(item.image)
    }

    pub async fn insert(&self, key: MemoryKey, image: Arc<I>, validity: CacheValidity) {
        let Some(cache) = &self.cache else {
            return;
        };

        let created = Instant::now();
        let deadline = match validity {
            CacheValidity::Forever => None,
            CacheValidity::For(period) => Some(created.checked_add(period).unwrap_or(created)),
        };
        let item = InMemoryItem {
            image,
            created,
            deadline,
        };
        cache.insert(key, item).await;
    }

    pub async fn invalidate(&self, key: &MemoryKey) {
        if let Some(cache) = &self.cache {
            cache.invalidate(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(locator: &str, sample_size: Option<u32>) -> MemoryKey {
        MemoryKey {
            key: CacheKey::from_locator(locator),
            decode: DecodeOptions {
                sample_size,
                ..Default::default()
            },
        }
    }

    const MINUTE: CacheValidity = CacheValidity::For(Duration::from_secs(60));

    fn cache() -> MemoryCache<Vec<u8>> {
        MemoryCache::new(&MemoryCacheConfig::default(), |v: &Vec<u8>| v.len() as u32)
    }

    #[tokio::test]
    async fn test_decode_options_are_part_of_the_key() {
        let cache = cache();

        cache
            .insert(key("img1", None), Arc::new(vec![1, 2, 3]), MINUTE)
            .await;

        assert_eq!(
            cache.get(&key("img1", None), MINUTE).await.as_deref(),
            Some(&vec![1, 2, 3])
        );
        assert_eq!(cache.get(&key("img1", Some(2)), MINUTE).await, None);

        cache.invalidate(&key("img1", None)).await;
        assert_eq!(cache.get(&key("img1", None), MINUTE).await, None);
    }

    #[tokio::test]
    async fn test_items_go_stale() {
        let cache = cache();
        let short = CacheValidity::For(Duration::from_millis(50));

        cache.insert(key("img1", None), Arc::new(vec![1]), MINUTE).await;
        cache
            .insert(key("img2", None), Arc::new(vec![2]), CacheValidity::Forever)
            .await;
        cache.insert(key("img3", None), Arc::new(vec![3]), short).await;

        tokio::time::sleep(Duration::from_millis(100)).await;

        // a lookup with a shorter validity than the insert treats the item as stale
        assert_eq!(cache.get(&key("img1", None), short).await, None);
        assert!(cache.get(&key("img1", None), MINUTE).await.is_some());

        assert!(
            cache
                .get(&key("img2", None), CacheValidity::Forever)
                .await
                .is_some()
        );

        // expired by the validity it was inserted with
        assert_eq!(
            cache.get(&key("img3", None), CacheValidity::Forever).await,
            None
        );
    }

    #[tokio::test]
    async fn test_zero_capacity_disables() {
        let config = MemoryCacheConfig { capacity: 0 };
        let cache = MemoryCache::new(&config, |v: &Vec<u8>| v.len() as u32);

        cache
            .insert(key("img1", None), Arc::new(vec![1]), CacheValidity::Forever)
            .await;
        assert_eq!(
            cache.get(&key("img1", None), CacheValidity::Forever).await,
            None
        );
    }
}
