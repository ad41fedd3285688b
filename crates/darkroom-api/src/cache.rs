//! Watch cache feeding the API server's reads

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use darkroom_common::crd::Darkroom;
use darkroom_common::Error;

/// A local cache kept in sync by a watch
#[async_trait]
pub trait WatchCache: Send + Sync {
    /// Begin watching
    async fn start(&self) -> Result<(), Error>;

    /// Resolve once the initial list has been observed
    async fn wait_for_sync(&self) -> Result<(), Error>;

    /// Stop watching
    async fn stop(&self);
}

/// Shared read handle that follows the cache across restarts
///
/// Every `start` fills a fresh store, so readers take a snapshot of the
/// current one per request instead of holding a `Store` directly.
#[derive(Clone)]
pub struct CacheReader(Arc<RwLock<Store<Darkroom>>>);

impl CacheReader {
    /// Wrap an existing store
    pub fn new(store: Store<Darkroom>) -> Self {
        Self(Arc::new(RwLock::new(store)))
    }

    /// The store currently fed by the watch
    pub async fn snapshot(&self) -> Store<Darkroom> {
        self.0.read().await.clone()
    }

    async fn replace(&self, store: Store<Darkroom>) {
        *self.0.write().await = store;
    }
}

/// Reflector-backed cache of Darkroom objects
pub struct ReflectorCache {
    api: Api<Darkroom>,
    reader: CacheReader,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReflectorCache {
    /// Cache Darkrooms in `namespace`, or in every namespace when `None`
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        let (store, _) = reflector::store();
        Self {
            api,
            reader: CacheReader::new(store),
            task: Mutex::new(None),
        }
    }

    /// Read handle onto the cached objects
    pub fn reader(&self) -> CacheReader {
        self.reader.clone()
    }
}

#[async_trait]
impl WatchCache for ReflectorCache {
    async fn start(&self) -> Result<(), Error> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("darkroom cache already started");
            return Ok(());
        }

        // A writer feeds exactly one reflector, so each run gets its own store.
        let (store, writer) = reflector::store();
        self.reader.replace(store).await;

        let stream = watcher(self.api.clone(), watcher::Config::default()).default_backoff();
        *task = Some(tokio::spawn(async move {
            reflector::reflector(writer, stream)
                .for_each(|event| async move {
                    if let Err(e) = event {
                        warn!(error = %e, "darkroom watch error");
                    }
                })
                .await;
        }));

        info!("darkroom cache started");
        Ok(())
    }

    async fn wait_for_sync(&self) -> Result<(), Error> {
        self.reader
            .snapshot()
            .await
            .wait_until_ready()
            .await
            .map_err(|e| Error::startup("cache", e.to_string()))
    }

    async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            info!("darkroom cache stopped");
        }
    }
}
