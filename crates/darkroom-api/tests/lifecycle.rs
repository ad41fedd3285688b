//! End-to-end lifecycle of the API server over a real socket

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use darkroom_api::{
    router, AppState, DarkroomStore, LifecycleState, Manager, ManagerConfig, VersionInfo,
    WatchCache,
};
use darkroom_common::crd::{Darkroom, DarkroomSpec, Source, WebFolderSource};
use darkroom_common::Error;

// =============================================================================
// Fakes
// =============================================================================

#[derive(Default)]
struct FakeCache {
    starts: AtomicUsize,
    synced: Notify,
}

#[async_trait]
impl WatchCache for FakeCache {
    async fn start(&self) -> Result<(), Error> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_sync(&self) -> Result<(), Error> {
        self.synced.notified().await;
        Ok(())
    }

    async fn stop(&self) {}
}

#[derive(Default)]
struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), Darkroom>>,
}

#[async_trait]
impl DarkroomStore for MemoryStore {
    async fn list(&self, namespace: &str) -> Result<Vec<Darkroom>, Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Darkroom, Error> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("darkrooms", namespace, name))
    }

    async fn create(&self, darkroom: &Darkroom) -> Result<Darkroom, Error> {
        let key = (darkroom.namespace().unwrap_or_default(), darkroom.name_any());
        self.objects.lock().unwrap().insert(key, darkroom.clone());
        Ok(darkroom.clone())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::not_found("darkrooms", namespace, name))
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn manager(cache: Arc<FakeCache>, store: Arc<MemoryStore>) -> Arc<Manager> {
    let state = AppState {
        store,
        version: VersionInfo::current(),
    };
    let config = ManagerConfig {
        addr: "127.0.0.1:0".parse().unwrap(),
        drain_timeout: Duration::from_secs(2),
    };
    Arc::new(Manager::new(cache, router(state, &[]), config))
}

async fn wait_for(rx: &mut watch::Receiver<LifecycleState>, want: LifecycleState) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .expect("timed out waiting for lifecycle state")
        .unwrap();
}

/// Minimal HTTP/1.1 exchange; returns the status line and body
async fn request(addr: std::net::SocketAddr, method: &str, path: &str, body: &str) -> (String, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let status = response.lines().next().unwrap_or_default().to_string();
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn serves_only_after_sync_and_stops_on_shutdown() {
    let cache = Arc::new(FakeCache::default());
    let manager = manager(cache.clone(), Arc::new(MemoryStore::default()));
    let mut state = manager.state();
    let shutdown = CancellationToken::new();

    let task = tokio::spawn({
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        async move { manager.start(shutdown).await }
    });

    wait_for(&mut state, LifecycleState::CacheStarting).await;
    assert!(manager.local_addr().is_none());

    cache.synced.notify_one();
    wait_for(&mut state, LifecycleState::ServerRunning).await;
    let addr = manager.local_addr().unwrap();

    let (status, body) = request(addr, "GET", "/healthz", "").await;
    assert!(status.contains("200"), "{status}");
    assert_eq!(body, "ok");

    shutdown.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(*manager.state().borrow(), LifecycleState::Stopped);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn create_list_get_delete_round_trip() {
    let cache = Arc::new(FakeCache::default());
    let store = Arc::new(MemoryStore::default());
    let manager = manager(cache.clone(), store.clone());
    let mut state = manager.state();
    let shutdown = CancellationToken::new();

    let task = tokio::spawn({
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        async move { manager.start(shutdown).await }
    });
    cache.synced.notify_one();
    wait_for(&mut state, LifecycleState::ServerRunning).await;
    let addr = manager.local_addr().unwrap();

    let body = serde_json::json!({
        "apiVersion": "deployments.gojek.io/v1alpha1",
        "kind": "Darkroom",
        "metadata": {"name": "gallery"},
        "spec": {
            "source": {"type": "WebFolder", "baseUrl": "https://images.example.com"},
            "domains": ["gallery.example.com"]
        }
    })
    .to_string();

    let (status, _) = request(addr, "POST", "/api/media/darkrooms", &body).await;
    assert!(status.contains("201"), "{status}");

    let stored = store.get("media", "gallery").await.unwrap();
    assert_eq!(stored.spec.version, "latest");

    let (status, body) = request(addr, "GET", "/api/media/darkrooms", "").await;
    assert!(status.contains("200"), "{status}");
    let list: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(list["items"][0]["name"], "gallery");

    let (status, _) = request(addr, "DELETE", "/api/media/darkrooms/gallery", "").await;
    assert!(status.contains("204"), "{status}");

    let (status, body) = request(addr, "GET", "/api/media/darkrooms/gallery", "").await;
    assert!(status.contains("404"), "{status}");
    let err: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(err["message"], "Unable to get instance gallery");

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn restart_after_graceful_stop_syncs_again() {
    let cache = Arc::new(FakeCache::default());
    let store = Arc::new(MemoryStore::default());
    store
        .create(&{
            let mut d = Darkroom::new(
                "existing",
                DarkroomSpec {
                    version: "latest".to_string(),
                    source: Source::WebFolder(WebFolderSource {
                        base_url: "https://example.com".to_string(),
                    }),
                    path_prefix: None,
                    domains: vec!["existing.example.com".to_string()],
                },
            );
            d.metadata.namespace = Some("default".to_string());
            d
        })
        .await
        .unwrap();
    let manager = manager(cache.clone(), store);

    for round in 1..=2 {
        let mut state = manager.state();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            async move { manager.start(shutdown).await }
        });
        wait_for(&mut state, LifecycleState::CacheStarting).await;
        cache.synced.notify_one();
        wait_for(&mut state, LifecycleState::ServerRunning).await;

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(cache.starts.load(Ordering::SeqCst), round);
    }
}
