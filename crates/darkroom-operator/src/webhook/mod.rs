//! Admission webhook server
//!
//! The API server only calls webhooks over TLS. The serving certificate is
//! read from `tls.crt` and `tls.key` in the configured directory, which is
//! where cert-manager mounts it.

pub mod darkroom;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use darkroom::{mutate_handler, validate_handler, MUTATE_PATH, VALIDATE_PATH};

/// Default port the webhook server listens on
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

/// Default directory holding the serving certificate
pub const DEFAULT_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";

/// Time in-flight reviews get to finish on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the webhook router
pub fn webhook_router() -> Router {
    Router::new()
        .route(MUTATE_PATH, post(mutate_handler))
        .route(VALIDATE_PATH, post(validate_handler))
        .route("/healthz", get(|| async { "ok" }))
}

fn cert_paths(cert_dir: &Path) -> (PathBuf, PathBuf) {
    (cert_dir.join("tls.crt"), cert_dir.join("tls.key"))
}

/// Serve the webhooks over TLS until `shutdown` is cancelled
pub async fn serve_webhooks(
    addr: SocketAddr,
    cert_dir: &Path,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let (cert, key) = cert_paths(cert_dir);
    let tls_config = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .map_err(|e| anyhow::anyhow!("TLS config error ({}): {}", cert_dir.display(), e))?;

    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown.cancelled().await;
            handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
        }
    });

    info!(addr = %addr, "Starting admission webhook server");
    axum_server::bind_rustls(addr, tls_config)
        .handle(handle)
        .serve(webhook_router().into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("webhook server error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[test]
    fn certificate_files_live_in_cert_dir() {
        let (cert, key) = cert_paths(Path::new(DEFAULT_CERT_DIR));
        assert_eq!(cert, PathBuf::from("/tmp/k8s-webhook-server/serving-certs/tls.crt"));
        assert_eq!(key, PathBuf::from("/tmp/k8s-webhook-server/serving-certs/tls.key"));
    }

    #[tokio::test]
    async fn missing_certificate_fails_startup() {
        let err = serve_webhooks(
            "127.0.0.1:0".parse().unwrap(),
            Path::new("/nonexistent/darkroom-certs"),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("TLS config error"));
    }

    #[tokio::test]
    async fn validate_route_answers_reviews() {
        let body = serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "e911857d-c318-11e8-bbad-025000000001",
                "kind": {"group": "deployments.gojek.io", "version": "v1alpha1", "kind": "Darkroom"},
                "resource": {"group": "deployments.gojek.io", "version": "v1alpha1", "resource": "darkrooms"},
                "operation": "DELETE",
                "userInfo": {},
                "dryRun": false
            }
        });
        let request = Request::builder()
            .method("POST")
            .uri(VALIDATE_PATH)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = webhook_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let review: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(review["response"]["allowed"], true);
        assert_eq!(review["response"]["uid"], "e911857d-c318-11e8-bbad-025000000001");
    }
}
