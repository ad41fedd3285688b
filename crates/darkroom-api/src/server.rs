//! Plain HTTP listener for the API server

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use darkroom_common::Error;

/// A bound listener waiting to serve a router
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
}

impl Server {
    /// Bind `addr`
    ///
    /// Port conflicts and permission problems surface here, before any
    /// request is accepted.
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::startup("server", format!("failed to bind {addr}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::startup("server", e.to_string()))?;
        Ok(Self { listener, addr })
    }

    /// Address actually bound, which differs from the requested one for port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve `router` until `shutdown` is cancelled and in-flight requests finish
    pub async fn serve(self, router: Router, shutdown: CancellationToken) -> Result<(), Error> {
        info!(addr = %self.addr, "API server listening");
        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| Error::internal_with_context("server", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[tokio::test]
    async fn binding_a_taken_port_is_a_startup_error() {
        let first = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let err = Server::bind(first.local_addr()).await.err().unwrap();
        assert!(matches!(err, Error::Startup { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn serve_returns_after_shutdown() {
        let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let shutdown = CancellationToken::new();
        let router = Router::new().route("/healthz", get(|| async { "ok" }));

        let task = tokio::spawn(server.serve(router, shutdown.clone()));
        shutdown.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
