use std::fs;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use imageloader_service::{CacheValidity, LoadOptions, LoadedFrom, Request};
use imageloader_test as test;

use crate::utils::{coordinator, disk_request, set_age};

#[tokio::test]
async fn test_network_then_disk_cache() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let coordinator = coordinator(Some(cache_dir.path()), |_| {});

    let request = disk_request(&server.url("raw/010203"), Duration::from_secs(60));

    // no cache file yet, so this goes to the network
    let loaded = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(loaded.from, LoadedFrom::Network);
    assert_eq!(*loaded.image, Bytes::from_static(&[0x1, 0x2, 0x3]));
    assert_eq!(server.accesses(), 1);

    let location = coordinator.store().path_for(request.key()).unwrap();
    assert_eq!(fs::read(&location).unwrap(), vec![0x1, 0x2, 0x3]);

    // 10 seconds later the entry is still valid
    set_age(&location, Duration::from_secs(10));
    let loaded = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(loaded.from, LoadedFrom::Disk);
    assert_eq!(*loaded.image, Bytes::from_static(&[0x1, 0x2, 0x3]));
    assert_eq!(server.accesses(), 0);

    // once the validity period has passed, it is fetched again
    set_age(&location, Duration::from_secs(61));
    let loaded = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(loaded.from, LoadedFrom::Network);
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_zero_validity_always_refetches() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let coordinator = coordinator(Some(cache_dir.path()), |_| {});

    let request = disk_request(&server.url("img/zero"), Duration::ZERO);

    coordinator.load(Arc::clone(&request)).await.unwrap();
    let location = coordinator.store().path_for(request.key()).unwrap();
    set_age(&location, Duration::from_secs(1));

    let loaded = coordinator.load(request).await.unwrap();
    assert_eq!(loaded.from, LoadedFrom::Network);
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_memory_cache() {
    test::setup();

    let server = test::HitCounter::new();
    let coordinator = coordinator(None, |_| {});

    let request = Arc::new(Request::new(server.url("img/mem").as_str()).unwrap());

    let first = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(first.from, LoadedFrom::Network);

    let second = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(second.from, LoadedFrom::Memory);
    assert!(Arc::ptr_eq(&first.image, &second.image));
    assert_eq!(server.accesses(), 1);

    // different decode options are a different image
    let mut options = LoadOptions::default();
    options.decode.sample_size = Some(4);
    let sampled = Arc::new(
        Request::new(server.url("img/mem").as_str())
            .unwrap()
            .with_options(options),
    );
    let third = coordinator.load(sampled).await.unwrap();
    assert_eq!(third.from, LoadedFrom::Network);
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_memory_cache_follows_disk_validity() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let coordinator = coordinator(Some(cache_dir.path()), |config| {
        config.caches.disk.default_validity = CacheValidity::For(Duration::from_secs(60));
    });

    let request = Arc::new(Request::new(server.url("img/stale").as_str()).unwrap());
    let entry = coordinator.store().path_for(request.key()).unwrap();

    let first = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(first.from, LoadedFrom::Network);
    let second = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(second.from, LoadedFrom::Memory);
    assert_eq!(server.accesses(), 1);

    // the decoded image goes stale along with the disk entry it came from
    set_age(&entry, Duration::from_secs(120));

    let third = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(third.from, LoadedFrom::Network);
    assert_eq!(server.accesses(), 1);

    let fourth = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(fourth.from, LoadedFrom::Memory);
    assert!(Arc::ptr_eq(&third.image, &fourth.image));
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_memory_cache_expires() {
    test::setup();

    let server = test::HitCounter::new();
    let coordinator = coordinator(None, |config| {
        config.caches.disk.default_validity = CacheValidity::For(Duration::from_millis(100));
    });

    let request = Arc::new(Request::new(server.url("img/expiring").as_str()).unwrap());

    let first = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(first.from, LoadedFrom::Network);
    let second = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(second.from, LoadedFrom::Memory);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let third = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(third.from, LoadedFrom::Network);
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_disk_cache_disabled() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let coordinator = coordinator(Some(cache_dir.path()), |_| {});

    let request = Arc::new(
        Request::new(server.url("img/nodisk").as_str())
            .unwrap()
            .with_options(LoadOptions {
                enable_disk_cache: false,
                enable_memory_cache: false,
                ..Default::default()
            }),
    );

    for _ in 0..2 {
        let loaded = coordinator.load(Arc::clone(&request)).await.unwrap();
        assert_eq!(loaded.from, LoadedFrom::Network);
        assert_eq!(*loaded.image, test::image_data("nodisk"));
    }

    assert_eq!(server.accesses(), 2);
    assert_eq!(
        fs::read_dir(cache_dir.path().join("images")).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn test_large_download_without_disk_cache() {
    test::setup();

    let server = test::HitCounter::new();
    let coordinator = coordinator(None, |config| {
        config.download.max_in_memory_size = 1024;
    });

    let request = Arc::new(Request::new(server.url("large/8192").as_str()).unwrap());
    let loaded = coordinator.load(request).await.unwrap();

    assert_eq!(loaded.from, LoadedFrom::Network);
    assert_eq!(loaded.image.len(), 8192);
}

#[tokio::test]
async fn test_cleanup() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let coordinator = coordinator(Some(cache_dir.path()), |_| {});

    let old = disk_request(&server.url("img/old"), Duration::from_secs(3600));
    let new = disk_request(&server.url("img/new"), Duration::from_secs(3600));
    coordinator.load(Arc::clone(&old)).await.unwrap();
    coordinator.load(Arc::clone(&new)).await.unwrap();

    let old_location = coordinator.store().path_for(old.key()).unwrap();
    set_age(&old_location, Duration::from_secs(7200));

    let stats = coordinator
        .store()
        .cleanup(Duration::from_secs(3600))
        .unwrap();
    assert_eq!((stats.retained, stats.removed), (1, 1));
    assert!(!old_location.exists());
}
