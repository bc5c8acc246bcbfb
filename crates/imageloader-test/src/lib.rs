//! Helpers for testing the image loader.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the cache directory is deleted while
//!    loads still write into it. To avoid this, assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - When using [`HitCounter`], make sure that the server is held until all requests to
//!    the server have been made. If the server is dropped, the ports remain open and all
//!    connections to it will time out.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract;
use axum::routing::get;
use axum::{Router, middleware};
use reqwest::{StatusCode, Url};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `imageloader_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("imageloader_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// The body served for `/img/{name}`.
pub fn image_data(name: &str) -> Vec<u8> {
    format!("image data for {name}").into_bytes()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Serves `router` on a random local port.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Hits = Arc<Mutex<BTreeMap<String, usize>>>;

/// A server counting the requests per path.
///
/// It serves these routes:
///
///  - `/img/{name}`: responds with [`image_data`] for `name`.
///  - `/raw/{hex}`: responds with the hex-decoded bytes.
///  - `/large/{size}`: responds with `size` bytes.
///  - `/delay/{time}/{name}`: waits for the humantime `time` and then serves `/img/{name}`.
///  - `/flaky/{n}/{name}`: fails the first `n` requests with a 503 and then serves `/img/{name}`.
///  - `/respond_statuscode/{num}/{tail}`: responds with the given status code.
pub struct HitCounter {
    server: Server,
    hits: Hits,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits: Hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri): extract::OriginalUri,
                  req: extract::Request,
                  next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_owned()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let flaky_hits = hits.clone();

        let router = Router::new()
            .route(
                "/img/*name",
                get(|extract::Path(name): extract::Path<String>| async move { image_data(&name) }),
            )
            .route(
                "/raw/:hex",
                get(|extract::Path(data): extract::Path<String>| async move {
                    match hex::decode(data) {
                        Ok(bytes) => Ok(bytes),
                        Err(_) => Err(StatusCode::BAD_REQUEST),
                    }
                }),
            )
            .route(
                "/large/:size",
                get(|extract::Path(size): extract::Path<usize>| async move { vec![0xab; size] }),
            )
            .route(
                "/delay/:time/*name",
                get(
                    |extract::Path((time, name)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        image_data(&name)
                    },
                ),
            )
            .route(
                "/flaky/:failures/*name",
                get(
                    move |extract::OriginalUri(uri): extract::OriginalUri,
                          extract::Path((failures, name)): extract::Path<(usize, String)>| {
                        let hits = flaky_hits.clone();
                        async move {
                            let seen = hits
                                .lock()
                                .unwrap()
                                .get(uri.path())
                                .copied()
                                .unwrap_or_default();
                            if seen <= failures {
                                Err(StatusCode::SERVICE_UNAVAILABLE)
                            } else {
                                Ok(image_data(&name))
                            }
                        }
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the total number of requests since the last call, and resets the counts.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the number of requests for the given path so far.
    pub fn hits(&self, path: &str) -> usize {
        let path = format!("/{}", path.trim_start_matches('/'));
        self.hits
            .lock()
            .unwrap()
            .get(&path)
            .copied()
            .unwrap_or_default()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}
