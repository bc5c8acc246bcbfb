use std::fs;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use imageloader_service::dispatch::dispatch_queue;
use imageloader_service::fetch::FilesystemOpener;
use imageloader_service::{LoadCoordinator, LoadError, LoadedFrom, RawDecoder, Request};
use imageloader_test as test;

use crate::utils::{config, coordinator};

#[tokio::test]
async fn test_load_file() {
    test::setup();

    let cache_dir = test::tempdir();
    let files = test::tempdir();
    let path = files.path().join("photo.jpg");
    fs::write(&path, b"local image").unwrap();

    let coordinator = coordinator(Some(cache_dir.path()), |_| {});
    let request = Arc::new(Request::new(path.to_str().unwrap()).unwrap());

    let loaded = coordinator.load(request).await.unwrap();
    assert_eq!(loaded.from, LoadedFrom::Local);
    assert_eq!(&loaded.image[..], b"local image");

    // local data is never written to the disk cache
    assert_eq!(
        fs::read_dir(cache_dir.path().join("images")).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn test_load_content() {
    test::setup();

    let root = test::tempdir();
    let dir = root.path().join("media").join("external");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("42"), b"content image").unwrap();

    let coordinator = LoadCoordinator::builder(&config(None, |_| {}), RawDecoder)
        .content_opener(Arc::new(FilesystemOpener::new(root.path())))
        .build()
        .unwrap();

    let request = Arc::new(Request::new("content://media/external/42").unwrap());
    let loaded = coordinator.load(request).await.unwrap();

    assert_eq!(loaded.from, LoadedFrom::Local);
    assert_eq!(&loaded.image[..], b"content image");
}

#[tokio::test]
async fn test_content_without_opener() {
    test::setup();

    let coordinator = coordinator(None, |_| {});
    let request = Arc::new(Request::new("content://media/external/42").unwrap());

    assert!(matches!(
        coordinator.load(request).await,
        Err(LoadError::SourceUnavailable(_))
    ));
}

#[tokio::test]
async fn test_queued_delivery() {
    test::setup();

    let (dispatcher, mut queue) = dispatch_queue::<Bytes>();
    let coordinator = LoadCoordinator::builder(&config(None, |_| {}), RawDecoder)
        .dispatcher(Arc::new(dispatcher))
        .build()
        .unwrap();

    let files = test::tempdir();
    let missing = files.path().join("missing.jpg");
    let request = Arc::new(Request::new(missing.to_str().unwrap()).unwrap());

    let received = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let received = Arc::clone(&received);
        coordinator.submit(request, move |delivery| {
            received
                .lock()
                .unwrap()
                .push((std::thread::current().id(), delivery.result.is_err()));
        })
    };

    assert!(handle.wait().await.is_err());
    // nothing runs until the queue is drained
    assert!(received.lock().unwrap().is_empty());

    assert_eq!(queue.run_pending(), 1);
    let received = received.lock().unwrap();
    assert_eq!(*received, vec![(std::thread::current().id(), true)]);
}
