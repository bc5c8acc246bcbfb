use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use imageloader_service::{LoadCoordinator, LoadError, LoadState, LoadedFrom, Request};
use imageloader_test as test;

use crate::utils::{FlakyDecoder, config, disk_request};

#[tokio::test]
async fn test_corrupt_cache_entry_is_purged() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let decoder = FlakyDecoder::default();
    let coordinator =
        LoadCoordinator::new(&config(Some(cache_dir.path()), |_| {}), decoder.clone()).unwrap();

    let request = disk_request(&server.url("raw/010203"), Duration::from_secs(60));
    let location = coordinator.store().path_for(request.key()).unwrap();

    coordinator.load(Arc::clone(&request)).await.unwrap();
    assert!(location.exists());
    assert_eq!(server.accesses(), 1);

    // the cached entry fails to decode and is purged
    decoder.fail_next(1);
    let result = coordinator.load(Arc::clone(&request)).await;
    assert!(matches!(result, Err(LoadError::DecodeFailure(_))));
    assert!(!location.exists());
    assert_eq!(server.accesses(), 0);

    // so the next load downloads it again
    let loaded = coordinator.load(Arc::clone(&request)).await.unwrap();
    assert_eq!(loaded.from, LoadedFrom::Network);
    assert!(location.exists());
    assert_eq!(server.accesses(), 1);
    assert_eq!(decoder.calls(), 3);
}

#[tokio::test]
async fn test_fresh_download_is_kept_on_decode_failure() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let decoder = FlakyDecoder::default();
    let coordinator =
        LoadCoordinator::new(&config(Some(cache_dir.path()), |_| {}), decoder.clone()).unwrap();

    let request = disk_request(&server.url("img/fresh"), Duration::from_secs(60));
    let location = coordinator.store().path_for(request.key()).unwrap();

    decoder.fail_next(1);
    let result = coordinator.load(Arc::clone(&request)).await;
    assert!(matches!(result, Err(LoadError::DecodeFailure(_))));
    assert!(location.exists());
}

#[tokio::test]
async fn test_fresh_download_is_purged_if_configured() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let decoder = FlakyDecoder::default();
    let config = config(Some(cache_dir.path()), |config| {
        config.caches.disk.purge_fresh_on_decode_failure = true;
    });
    let coordinator = LoadCoordinator::new(&config, decoder.clone()).unwrap();

    let request = disk_request(&server.url("img/fresh"), Duration::from_secs(60));
    let location = coordinator.store().path_for(request.key()).unwrap();

    decoder.fail_next(1);
    assert!(coordinator.load(Arc::clone(&request)).await.is_err());
    assert!(!location.exists());
}

#[tokio::test]
async fn test_network_errors_are_delivered() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let coordinator = crate::utils::coordinator(Some(cache_dir.path()), |_| {});

    let delivered = Arc::new(AtomicUsize::new(0));
    let request = disk_request(
        &server.url("respond_statuscode/404/img1"),
        Duration::from_secs(60),
    );

    let handle = {
        let delivered = Arc::clone(&delivered);
        coordinator.submit(Arc::clone(&request), move |delivery| {
            assert_eq!(delivery.result.unwrap_err(), LoadError::NotFound);
            delivered.fetch_add(1, Ordering::SeqCst);
        })
    };

    let state = handle.state_changes();
    assert_eq!(handle.wait().await.unwrap_err(), LoadError::NotFound);
    assert_eq!(*state.borrow(), LoadState::LockReleased);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);

    // failures leave nothing behind in the cache
    assert!(!coordinator.store().path_for(request.key()).unwrap().exists());
}

#[tokio::test]
async fn test_invalid_locator() {
    assert!(matches!(
        Request::new("file://example.com/img1"),
        Err(LoadError::SourceUnavailable(_))
    ));
}

#[tokio::test]
async fn test_cancel_while_resolving() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let coordinator = crate::utils::coordinator(Some(cache_dir.path()), |_| {});

    let delivered = Arc::new(AtomicUsize::new(0));
    let request = disk_request(&server.url("delay/5s/slow"), Duration::from_secs(60));

    let handle = {
        let delivered = Arc::clone(&delivered);
        coordinator.submit(Arc::clone(&request), move |_| {
            delivered.fetch_add(1, Ordering::SeqCst);
        })
    };

    let mut state = handle.state_changes();
    state
        .wait_for(|state| *state == LoadState::Resolving)
        .await
        .unwrap();

    handle.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), handle.wait())
        .await
        .unwrap();

    assert_eq!(result.unwrap_err(), LoadError::Cancelled);
    assert_eq!(*state.borrow(), LoadState::LockReleased);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert!(coordinator.key_locks().is_empty());
    assert!(!coordinator.store().path_for(request.key()).unwrap().exists());
}

#[tokio::test]
async fn test_cancel_while_queued() {
    test::setup();

    let cache_dir = test::tempdir();
    let server = test::HitCounter::new();
    let coordinator = crate::utils::coordinator(Some(cache_dir.path()), |_| {});

    let request = disk_request(&server.url("delay/300ms/queued"), Duration::from_secs(60));

    let first = coordinator.submit(Arc::clone(&request), |_| {});
    first
        .state_changes()
        .wait_for(|state| *state == LoadState::Resolving)
        .await
        .unwrap();

    // the second load waits for the key lock held by the first
    let delivered = Arc::new(AtomicUsize::new(0));
    let second = {
        let delivered = Arc::clone(&delivered);
        coordinator.submit(Arc::clone(&request), move |_| {
            delivered.fetch_add(1, Ordering::SeqCst);
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(second.state(), LoadState::Queued);

    second.cancel();
    assert_eq!(second.wait().await.unwrap_err(), LoadError::Cancelled);
    assert_eq!(delivered.load(Ordering::SeqCst), 0);

    // the first load is unaffected
    let loaded = first.wait().await.unwrap();
    assert_eq!(loaded.from, LoadedFrom::Network);
    assert_eq!(server.accesses(), 1);
    assert!(coordinator.key_locks().is_empty());
}
