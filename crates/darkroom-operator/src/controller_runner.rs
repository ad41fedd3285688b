//! Controller runner - builds the Darkroom controller future
//!
//! The controller watches Darkrooms and the ConfigMaps, Deployments and
//! Services they own, so drift in a child re-triggers its parent.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use darkroom_common::crd::Darkroom;
use darkroom_controller::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the Darkroom controller
///
/// The returned future completes once `shutdown` is cancelled and in-flight
/// reconciles have finished.
pub fn build_darkroom_controller(
    client: Client,
    shutdown: CancellationToken,
) -> impl Future<Output = ()> + Send {
    let ctx = Arc::new(Context::from_client(client.clone()));
    let darkrooms: Api<Darkroom> = Api::all(client.clone());
    let config = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);

    tracing::info!("- Darkroom controller");

    Controller::new(darkrooms, config())
        .owns(Api::<ConfigMap>::all(client.clone()), config())
        .owns(Api::<Deployment>::all(client.clone()), config())
        .owns(Api::<Service>::all(client), config())
        .graceful_shutdown_on(async move { shutdown.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Darkroom"))
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
