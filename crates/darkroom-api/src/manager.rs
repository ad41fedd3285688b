//! Cache-then-serve lifecycle for the API server
//!
//! ```text
//! NotStarted -> CacheStarting -> CacheSynced -> ServerRunning -> ShuttingDown -> Stopped
//! ```
//!
//! The port is never bound before the cache has synced. Cancelling during the
//! sync wait goes straight to `Stopped`. Once serving, whichever comes first
//! decides how `start` returns: the shutdown token drains in-flight requests
//! for at most `drain_timeout`, a server fault is returned as-is.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use darkroom_common::Error;

use crate::cache::WatchCache;
use crate::server::Server;
use crate::DEFAULT_PORT;

/// Default time in-flight requests get to finish on shutdown
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the manager is in its lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LifecycleState {
    /// `start` has not been called
    #[default]
    NotStarted,
    /// The watch cache is starting and has not synced yet
    CacheStarting,
    /// The initial list has been observed
    CacheSynced,
    /// The server is bound and accepting requests
    ServerRunning,
    /// Draining in-flight requests
    ShuttingDown,
    /// Terminal for this call to `start`
    Stopped,
}

/// Manager settings
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Address the server binds once the cache has synced
    pub addr: SocketAddr,
    /// Upper bound on graceful drain
    pub drain_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

type ServeFn = fn(Server, Router, CancellationToken) -> BoxFuture<'static, Result<(), Error>>;

fn serve_router(
    server: Server,
    router: Router,
    drain: CancellationToken,
) -> BoxFuture<'static, Result<(), Error>> {
    Box::pin(server.serve(router, drain))
}

/// Runs the watch cache and the HTTP server in order
pub struct Manager {
    cache: Arc<dyn WatchCache>,
    router: Router,
    config: ManagerConfig,
    serve: ServeFn,
    cache_synced: AtomicBool,
    state: watch::Sender<LifecycleState>,
    bound_addr: watch::Sender<Option<SocketAddr>>,
}

impl Manager {
    /// Create a manager that serves `router` once `cache` has synced
    pub fn new(cache: Arc<dyn WatchCache>, router: Router, config: ManagerConfig) -> Self {
        Self {
            cache,
            router,
            config,
            serve: serve_router,
            cache_synced: AtomicBool::new(false),
            state: watch::channel(LifecycleState::NotStarted).0,
            bound_addr: watch::channel(None).0,
        }
    }

    #[cfg(test)]
    fn with_serve(mut self, serve: ServeFn) -> Self {
        self.serve = serve;
        self
    }

    /// Subscribe to lifecycle transitions
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Address the server is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.borrow()
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        debug!(from = ?previous, to = ?next, "lifecycle transition");
    }

    /// Run until `shutdown` is cancelled or the server fails
    ///
    /// A second call after a fault reuses the already synced cache and goes
    /// straight to binding.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), Error> {
        if self.cache_synced.load(Ordering::Acquire) {
            debug!("cache already synced, skipping cache start");
        } else if !self.sync_cache(&shutdown).await? {
            return Ok(());
        }

        let server = match Server::bind(self.config.addr).await {
            Ok(server) => server,
            Err(e) => {
                self.transition(LifecycleState::Stopped);
                return Err(e);
            }
        };
        self.bound_addr.send_replace(Some(server.local_addr()));

        let drain = CancellationToken::new();
        let mut task = tokio::spawn((self.serve)(server, self.router.clone(), drain.clone()));
        self.transition(LifecycleState::ServerRunning);

        let faulted = tokio::select! {
            _ = shutdown.cancelled() => None,
            joined = &mut task => Some(joined),
        };

        if let Some(joined) = faulted {
            self.bound_addr.send_replace(None);
            self.transition(LifecycleState::Stopped);
            return match joined {
                Ok(result) => result,
                Err(e) => Err(Error::internal_with_context("server", e.to_string())),
            };
        }

        info!("shutdown requested, draining API server");
        self.transition(LifecycleState::ShuttingDown);
        drain.cancel();
        match tokio::time::timeout(self.config.drain_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => debug!("API server drained"),
            Ok(Ok(Err(e))) => warn!(error = %e, "API server exited with error during drain"),
            Ok(Err(e)) => warn!(error = %e, "API server task failed during drain"),
            Err(_) => {
                warn!(
                    timeout_secs = self.config.drain_timeout.as_secs(),
                    "drain timed out, aborting in-flight requests"
                );
                task.abort();
            }
        }

        self.cache.stop().await;
        self.cache_synced.store(false, Ordering::Release);
        self.bound_addr.send_replace(None);
        self.transition(LifecycleState::Stopped);
        info!("API server stopped");
        Ok(())
    }

    /// Returns `false` when `shutdown` fired before the cache synced
    async fn sync_cache(&self, shutdown: &CancellationToken) -> Result<bool, Error> {
        self.transition(LifecycleState::CacheStarting);
        if let Err(e) = self.cache.start().await {
            self.transition(LifecycleState::Stopped);
            return Err(e);
        }

        let synced = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = self.cache.wait_for_sync() => Some(result),
        };

        match synced {
            None => {
                info!("shutdown requested before cache sync");
                self.cache.stop().await;
                self.transition(LifecycleState::Stopped);
                Ok(false)
            }
            Some(Err(e)) => {
                self.cache.stop().await;
                self.transition(LifecycleState::Stopped);
                Err(e)
            }
            Some(Ok(())) => {
                self.cache_synced.store(true, Ordering::Release);
                self.transition(LifecycleState::CacheSynced);
                info!("darkroom cache synced");
                Ok(true)
            }
        }
    }
}
