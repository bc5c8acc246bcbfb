use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use imageloader_service::{LoadOptions, LoadedFrom, Request};
use imageloader_test as test;

use crate::utils::{coordinator, disk_request};

#[tokio::test]
async fn test_concurrent_loads_fetch_once() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let coordinator = coordinator(Some(cache_dir.path()), |_| {});

    let request = disk_request(&server.url("delay/100ms/img2"), Duration::from_secs(60));

    let (first, second) = tokio::join!(
        coordinator.load(Arc::clone(&request)),
        coordinator.load(Arc::clone(&request)),
    );

    let mut sources = vec![first.unwrap().from, second.unwrap().from];
    sources.sort_by_key(|from| from.as_str());
    assert_eq!(sources, vec![LoadedFrom::Disk, LoadedFrom::Network]);
    assert_eq!(server.hits("delay/100ms/img2"), 1);
    assert!(coordinator.key_locks().is_empty());
}

#[tokio::test]
async fn test_submitted_loads_are_all_delivered() {
    test::setup();

    let server = test::HitCounter::new();
    let coordinator = coordinator(None, |_| {});

    // without a disk cache, the memory cache deduplicates
    let request = Arc::new(Request::new(server.url("delay/50ms/img3").as_str()).unwrap());
    let delivered = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let delivered = Arc::clone(&delivered);
            coordinator.submit(Arc::clone(&request), move |delivery| {
                assert_eq!(*delivery.result.unwrap().image, test::image_data("img3"));
                delivered.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    let mut from_network = 0;
    for handle in handles {
        if handle.wait().await.unwrap().from == LoadedFrom::Network {
            from_network += 1;
        }
    }

    assert_eq!(from_network, 1);
    assert_eq!(delivered.load(Ordering::SeqCst), 8);
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_without_caches_loads_are_serialized() {
    test::setup();

    let server = test::HitCounter::new();
    let coordinator = coordinator(None, |_| {});

    let request = Arc::new(
        Request::new(server.url("img/uncached").as_str())
            .unwrap()
            .with_options(LoadOptions {
                enable_disk_cache: false,
                enable_memory_cache: false,
                ..Default::default()
            }),
    );

    let (first, second) = tokio::join!(
        coordinator.load(Arc::clone(&request)),
        coordinator.load(Arc::clone(&request)),
    );

    // nothing to deduplicate against, both go to the network
    assert_eq!(first.unwrap().from, LoadedFrom::Network);
    assert_eq!(second.unwrap().from, LoadedFrom::Network);
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_distinct_keys_do_not_block() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let coordinator = coordinator(Some(cache_dir.path()), |_| {});

    let slow = disk_request(&server.url("delay/2s/slow"), Duration::from_secs(60));
    let fast = disk_request(&server.url("img/fast"), Duration::from_secs(60));

    let slow_handle = coordinator.submit(slow, |_| {});
    tokio::time::sleep(Duration::from_millis(50)).await;

    let loaded = tokio::time::timeout(Duration::from_secs(1), coordinator.load(fast))
        .await
        .expect("load of a different key was blocked")
        .unwrap();
    assert_eq!(*loaded.image, test::image_data("fast"));

    slow_handle.cancel();
}

#[tokio::test]
async fn test_worker_limit() {
    test::setup();

    let server = test::HitCounter::new();
    let coordinator = coordinator(None, |config| {
        config.max_concurrent_loads = 1;
    });

    let slow = Arc::new(Request::new(server.url("delay/300ms/a").as_str()).unwrap());
    let queued = Arc::new(Request::new(server.url("img/b").as_str()).unwrap());

    let slow_handle = coordinator.submit(slow, |_| {});
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the only worker is busy, so the second load waits for it
    let handle = coordinator.submit(queued, |_| {});
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.hits("img/b"), 0);

    slow_handle.wait().await.unwrap();
    handle.wait().await.unwrap();
    assert_eq!(server.hits("img/b"), 1);
}
