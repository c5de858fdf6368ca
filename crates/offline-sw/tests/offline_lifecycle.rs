//! End-to-end lifecycle tests: precache, purge old versions, serve offline.

use async_trait::async_trait;
use http::header::{CONTENT_TYPE, SET_COOKIE};
use http::{HeaderValue, StatusCode};
use offline_common::{init_logging, LogConfig};
use offline_net::{Fetcher, NetError, Request, RequestMode, Response};
use offline_sw::{
    CacheEntry, CacheStorage, Clients, FsCacheStorage, MemoryCacheStorage, OfflineWorker,
    ServiceWorkerError, ServiceWorkerState, SwResult, WorkerConfig, WorkerEvent,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use url::Url;

/// Serves a fixed set of resources; 404 for anything else.
struct SiteFetcher {
    resources: HashMap<String, (&'static str, Vec<u8>)>,
    calls: AtomicUsize,
}

impl SiteFetcher {
    fn period_tracker() -> Self {
        let site: [(&str, &'static str, &[u8]); 6] = [
            ("http://localhost/", "text/html", b"<html>shell</html>"),
            ("http://localhost/cycle.html", "text/html", b"<html>cycle</html>"),
            ("http://localhost/style.css", "text/css", b"body { margin: 0 }"),
            (
                "http://localhost/app.js",
                "text/javascript",
                b"console.log('tracker')",
            ),
            (
                "http://localhost/android-chrome-512x512.png",
                "image/png",
                b"\x89PNG\r\n\x1a\n",
            ),
            (
                "http://localhost/site.webmanifest",
                "application/manifest+json",
                b"{\"name\":\"Tracker\"}",
            ),
        ];
        let resources = site
            .into_iter()
            .map(|(url, content_type, body)| (url.to_string(), (content_type, body.to_vec())))
            .collect();

        Self {
            resources,
            calls: AtomicUsize::new(0),
        }
    }

    fn without(mut self, url: &str) -> Self {
        self.resources.remove(url);
        self
    }
}

#[async_trait]
impl Fetcher for SiteFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.resources.get(request.url.as_str()) {
            Some((content_type, body)) => {
                let mut response = Response::new(StatusCode::OK, body.clone());
                response
                    .headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static(*content_type));
                response
                    .headers
                    .append(SET_COOKIE, HeaderValue::from_static("session=offline"));
                response
                    .headers
                    .append(SET_COOKIE, HeaderValue::from_static("theme=dark"));
                response.url = Some(request.url);
                Ok(response)
            }
            None => Ok(Response::new(StatusCode::NOT_FOUND, "")),
        }
    }
}

/// Memory storage whose deletes of one name always fail.
struct StickyStorage {
    inner: MemoryCacheStorage,
    sticky: String,
}

#[async_trait]
impl CacheStorage for StickyStorage {
    async fn open(&self, name: &str) -> SwResult<()> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> SwResult<bool> {
        self.inner.has(name).await
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> SwResult<()> {
        self.inner.put_all(name, entries).await
    }

    async fn match_in(&self, name: &str, url: &str) -> SwResult<Option<CacheEntry>> {
        self.inner.match_in(name, url).await
    }

    async fn match_any(&self, url: &str) -> SwResult<Option<CacheEntry>> {
        self.inner.match_any(url).await
    }

    async fn keys(&self) -> SwResult<Vec<String>> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> SwResult<bool> {
        if name == self.sticky {
            return Err(ServiceWorkerError::CacheError(format!("{name} is locked")));
        }
        self.inner.delete(name).await
    }
}

fn setup_logging() {
    // Several tests race to install the subscriber; losing is fine.
    let _ = init_logging(LogConfig::default().with_filter("offline_sw=debug"));
}

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn new_worker(
    config: WorkerConfig,
    caches: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<RwLock<Clients>>,
) -> OfflineWorker {
    let (worker, _rx) = OfflineWorker::new(config, caches, fetcher, clients).unwrap();
    worker
}

async fn active_worker(caches: Arc<dyn CacheStorage>) -> OfflineWorker {
    let worker = new_worker(
        WorkerConfig::default(),
        caches,
        Arc::new(SiteFetcher::period_tracker()),
        Arc::new(RwLock::new(Clients::new())),
    );
    worker.install().await.unwrap();
    worker.activate().await.unwrap();
    worker
}

#[tokio::test]
async fn install_stores_every_static_resource() {
    setup_logging();
    let caches = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(SiteFetcher::period_tracker());
    let worker = new_worker(
        WorkerConfig::default(),
        caches.clone(),
        fetcher.clone(),
        Arc::new(RwLock::new(Clients::new())),
    );

    worker.install().await.unwrap();

    assert_eq!(worker.state().await, ServiceWorkerState::Installed);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 6);
    assert_eq!(caches.entry_count("period-tracker-v1").await, Some(6));
    for resource in worker.config().resource_urls().unwrap() {
        let entry = caches
            .match_in("period-tracker-v1", resource.as_str())
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{resource} not cached"));
        let response = entry.to_response().unwrap();
        assert!(response.ok(), "{resource} cached with {}", response.status);
    }
}

#[tokio::test]
async fn install_failure_leaves_no_entries() {
    setup_logging();
    let caches = Arc::new(MemoryCacheStorage::new());
    let fetcher = SiteFetcher::period_tracker().without("http://localhost/app.js");
    let worker = new_worker(
        WorkerConfig::default(),
        caches.clone(),
        Arc::new(fetcher),
        Arc::new(RwLock::new(Clients::new())),
    );

    match worker.install().await {
        Err(ServiceWorkerError::InstallFailed { url, reason }) => {
            assert_eq!(url, "http://localhost/app.js");
            assert!(reason.contains("404"));
        }
        other => panic!("expected install failure, got {other:?}"),
    }
    assert_eq!(worker.state().await, ServiceWorkerState::Redundant);
    // The cache was opened before population and stays behind, empty.
    assert_eq!(caches.entry_count("period-tracker-v1").await, Some(0));
}

#[tokio::test]
async fn activate_deletes_other_versions() {
    setup_logging();
    let caches = Arc::new(MemoryCacheStorage::new());
    for stale in ["period-tracker-v0", "unrelated-cache"] {
        caches.open(stale).await.unwrap();
    }

    let worker = new_worker(
        WorkerConfig::default(),
        caches.clone(),
        Arc::new(SiteFetcher::period_tracker()),
        Arc::new(RwLock::new(Clients::new())),
    );
    worker.install().await.unwrap();
    let summary = worker.activate().await.unwrap();

    let mut deleted = summary.deleted.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["period-tracker-v0", "unrelated-cache"]);
    assert_eq!(caches.keys().await.unwrap(), vec!["period-tracker-v1"]);
}

#[tokio::test]
async fn activate_claims_clients_in_scope() {
    setup_logging();
    let clients = Arc::new(RwLock::new(Clients::new()));
    let page = clients
        .write()
        .await
        .open_window(url("http://localhost/cycle.html"));
    let foreign = clients
        .write()
        .await
        .open_window(url("https://elsewhere.example/"));

    let (worker, mut rx) = OfflineWorker::new(
        WorkerConfig::default(),
        Arc::new(MemoryCacheStorage::new()),
        Arc::new(SiteFetcher::period_tracker()),
        clients.clone(),
    )
    .unwrap();
    worker.install().await.unwrap();
    let summary = worker.activate().await.unwrap();

    assert_eq!(summary.claimed, vec![page.id.clone()]);
    let clients = clients.read().await;
    assert_eq!(clients.get(&page.id).unwrap().controller, Some(worker.id()));
    assert!(clients.get(&foreign.id).unwrap().controller.is_none());

    let mut controller_changes = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let WorkerEvent::ControllerChange { client_id, .. } = event {
            controller_changes.push(client_id);
        }
    }
    assert_eq!(controller_changes, vec![page.id]);
}

#[tokio::test]
async fn reactivating_same_version_deletes_nothing_and_claims() {
    setup_logging();
    let caches: Arc<dyn CacheStorage> = Arc::new(MemoryCacheStorage::new());
    let clients = Arc::new(RwLock::new(Clients::new()));
    clients
        .write()
        .await
        .open_window(url("http://localhost/"));

    let first = new_worker(
        WorkerConfig::default(),
        caches.clone(),
        Arc::new(SiteFetcher::period_tracker()),
        clients.clone(),
    );
    first.install().await.unwrap();
    first.activate().await.unwrap();

    let second = new_worker(
        WorkerConfig::default(),
        caches.clone(),
        Arc::new(SiteFetcher::period_tracker()),
        clients.clone(),
    );
    second.install().await.unwrap();
    let summary = second.activate().await.unwrap();

    assert!(summary.deleted.is_empty());
    assert_eq!(summary.claimed.len(), 1);
    assert_eq!(caches.keys().await.unwrap(), vec!["period-tracker-v1"]);
}

#[tokio::test]
async fn failed_deletion_fails_activation_after_others_finish() {
    setup_logging();
    let storage = Arc::new(StickyStorage {
        inner: MemoryCacheStorage::new(),
        sticky: "period-tracker-v0".to_string(),
    });
    storage.open("period-tracker-v0").await.unwrap();
    storage.open("period-tracker-beta").await.unwrap();

    let clients = Arc::new(RwLock::new(Clients::new()));
    let page = clients
        .write()
        .await
        .open_window(url("http://localhost/"));

    let worker = new_worker(
        WorkerConfig::default(),
        storage.clone(),
        Arc::new(SiteFetcher::period_tracker()),
        clients.clone(),
    );
    worker.install().await.unwrap();

    assert!(matches!(
        worker.activate().await,
        Err(ServiceWorkerError::CacheError(_))
    ));
    assert_eq!(worker.state().await, ServiceWorkerState::Redundant);
    // The independent deletion still ran; the claim did not.
    assert!(!storage.has("period-tracker-beta").await.unwrap());
    assert!(storage.has("period-tracker-v0").await.unwrap());
    assert!(clients.read().await.get(&page.id).unwrap().controller.is_none());
}

#[tokio::test]
async fn navigation_always_serves_root_document() {
    setup_logging();
    let worker = active_worker(Arc::new(MemoryCacheStorage::new())).await;

    let root = worker
        .handle_fetch(&Request::navigate(url("http://localhost/")))
        .await
        .unwrap()
        .unwrap();
    for target in [
        "http://localhost/cycle.html",
        "http://localhost/never/cached",
        "http://localhost/?month=3",
    ] {
        let response = worker
            .handle_fetch(&Request::navigate(url(target)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, root, "navigation to {target}");
    }
    assert_eq!(&root.body[..], b"<html>shell</html>");
}

#[tokio::test]
async fn navigation_without_root_is_empty() {
    setup_logging();
    let config = WorkerConfig {
        static_resources: vec!["/cycle.html".to_string()],
        ..Default::default()
    };
    let worker = new_worker(
        config,
        Arc::new(MemoryCacheStorage::new()),
        Arc::new(SiteFetcher::period_tracker()),
        Arc::new(RwLock::new(Clients::new())),
    );
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let response = worker
        .handle_fetch(&Request::navigate(url("http://localhost/cycle.html")))
        .await
        .unwrap();
    assert!(response.is_none());
}

#[tokio::test]
async fn subresource_hit_is_byte_for_byte() {
    setup_logging();
    let worker = active_worker(Arc::new(MemoryCacheStorage::new())).await;

    let request =
        Request::get(url("http://localhost/android-chrome-512x512.png")).mode(RequestMode::NoCors);
    let served = SiteFetcher::period_tracker()
        .fetch(request.clone())
        .await
        .unwrap();
    let response = worker.handle_fetch(&request).await.unwrap().unwrap();

    assert_eq!(response, served);
    assert_eq!(&response.body[..], b"\x89PNG\r\n\x1a\n");
    let cookies: Vec<_> = response.headers.get_all(SET_COOKIE).iter().collect();
    assert_eq!(cookies, vec!["session=offline", "theme=dark"]);
}

#[tokio::test]
async fn subresource_lookup_ignores_fragment() {
    setup_logging();
    let worker = active_worker(Arc::new(MemoryCacheStorage::new())).await;

    let plain = worker
        .handle_fetch(&Request::get(url("http://localhost/app.js")))
        .await
        .unwrap()
        .unwrap();
    let with_fragment = worker
        .handle_fetch(&Request::get(url("http://localhost/app.js#x")))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(with_fragment.status, StatusCode::OK);
    assert_eq!(with_fragment, plain);
    assert_eq!(with_fragment.text().unwrap(), "console.log('tracker')");
}

#[tokio::test]
async fn subresource_miss_is_empty_not_found() {
    setup_logging();
    let worker = active_worker(Arc::new(MemoryCacheStorage::new())).await;

    for target in [
        "http://localhost/missing.js",
        // Exact URL only: a query string is a different key.
        "http://localhost/style.css?v=2",
    ] {
        let response = worker
            .handle_fetch(&Request::get(url(target)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND, "{target}");
        assert!(response.body.is_empty());
    }
}

#[tokio::test]
async fn subresources_ignore_old_version_caches() {
    setup_logging();
    let caches = Arc::new(MemoryCacheStorage::new());
    caches.open("period-tracker-v0").await.unwrap();
    let mut stale = Response::new(StatusCode::OK, "old");
    stale.url = Some(url("http://localhost/legacy.js"));
    caches
        .put_all(
            "period-tracker-v0",
            vec![CacheEntry::from_response(
                "http://localhost/legacy.js",
                "GET",
                &stale,
            )],
        )
        .await
        .unwrap();

    let worker = new_worker(
        WorkerConfig::default(),
        caches.clone(),
        Arc::new(SiteFetcher::period_tracker()),
        Arc::new(RwLock::new(Clients::new())),
    );
    worker.install().await.unwrap();
    worker.activate().await.unwrap();

    let response = worker
        .handle_fetch(&Request::get(url("http://localhost/legacy.js")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fetches_resolve_independently() {
    setup_logging();
    let worker = Arc::new(active_worker(Arc::new(MemoryCacheStorage::new())).await);

    let targets = [
        ("http://localhost/style.css", StatusCode::OK),
        ("http://localhost/app.js", StatusCode::OK),
        ("http://localhost/nope.css", StatusCode::NOT_FOUND),
        ("http://localhost/site.webmanifest", StatusCode::OK),
    ];

    let handles: Vec<_> = targets
        .iter()
        .map(|(target, _)| {
            let worker = Arc::clone(&worker);
            let request = Request::get(url(target));
            tokio::spawn(async move { worker.handle_fetch(&request).await })
        })
        .collect();

    for ((target, expected), handle) in targets.iter().zip(handles) {
        let response = handle.await.unwrap().unwrap().unwrap();
        assert_eq!(response.status, *expected, "{target}");
    }
}

#[tokio::test]
async fn version_bump_replaces_cache_on_disk() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();

    {
        let storage = Arc::new(FsCacheStorage::new(dir.path()).await.unwrap());
        active_worker(storage).await;
    }

    // Restart with a new release of the asset set.
    let storage = Arc::new(FsCacheStorage::new(dir.path()).await.unwrap());
    assert_eq!(storage.keys().await.unwrap(), vec!["period-tracker-v1"]);

    let config = WorkerConfig {
        version: "v2".to_string(),
        ..Default::default()
    };
    let worker = new_worker(
        config,
        storage.clone(),
        Arc::new(SiteFetcher::period_tracker()),
        Arc::new(RwLock::new(Clients::new())),
    );
    worker.install().await.unwrap();
    let summary = worker.activate().await.unwrap();

    assert_eq!(summary.deleted, vec!["period-tracker-v1"]);
    assert_eq!(storage.keys().await.unwrap(), vec!["period-tracker-v2"]);

    let response = worker
        .handle_fetch(&Request::get(url("http://localhost/app.js")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.text().unwrap(), "console.log('tracker')");
}

#[tokio::test]
async fn long_url_miss_on_disk_is_not_found() {
    setup_logging();
    let dir = tempfile::tempdir().unwrap();
    let worker = active_worker(Arc::new(FsCacheStorage::new(dir.path()).await.unwrap())).await;

    let target = format!("http://localhost/app.js?q={}", "a".repeat(300));
    let response = worker
        .handle_fetch(&Request::get(url(&target)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(response.body.is_empty());
}
