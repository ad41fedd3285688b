//! Darkroom controller implementation
//!
//! Reconciliation is level-triggered: the object handed over by the watch is
//! only used for its identity. Each cycle re-reads the Darkroom, compiles its
//! children, server-side applies them in a fixed order and reports status.
//! Deleting a Darkroom needs no work here; owner references let the garbage
//! collector remove the children.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use darkroom_common::crd::{Darkroom, DarkroomStatus, Source};
use darkroom_common::metrics::ReconcileTimer;
use darkroom_common::{Error, CONTROLLER_FIELD_MANAGER};

use crate::compiler::compile;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Kubernetes operations the reconciler needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DarkroomKubeClient: Send + Sync {
    /// Read a Darkroom, `None` if it no longer exists
    async fn get_darkroom(&self, namespace: &str, name: &str) -> Result<Option<Darkroom>, Error>;

    /// Server-side apply the ConfigMap
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;

    /// Server-side apply the Deployment
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Server-side apply the Service
    async fn apply_service(&self, service: &Service) -> Result<(), Error>;

    /// Replace the status subresource of `darkroom`
    ///
    /// The write carries the resourceVersion `darkroom` was read at.
    async fn update_status(&self, darkroom: &Darkroom, status: &DarkroomStatus)
        -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct DarkroomKubeClientImpl {
    client: Client,
}

impl DarkroomKubeClientImpl {
    /// Create a new DarkroomKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply<K>(&self, object: &K) -> Result<(), Error>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned
            + serde::Serialize,
        K::DynamicType: Default,
    {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        let name = object.name_any();
        let namespace = object.namespace().unwrap_or_default();
        let json = serde_json::to_value(object)
            .map_err(|e| Error::serialization_for_kind(&kind, e.to_string()))?;

        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        let params = PatchParams::apply(CONTROLLER_FIELD_MANAGER).force();
        debug!(name = %name, kind = %kind, "applying child");
        api.patch(&name, &params, &Patch::Apply(&json))
            .await
            .map_err(|e| Error::apply(&kind, &name, e))?;
        Ok(())
    }
}

#[async_trait]
impl DarkroomKubeClient for DarkroomKubeClientImpl {
    async fn get_darkroom(&self, namespace: &str, name: &str) -> Result<Option<Darkroom>, Error> {
        let api: Api<Darkroom> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(darkroom) => Ok(Some(darkroom)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        self.apply(config_map).await
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.apply(deployment).await
    }

    async fn apply_service(&self, service: &Service) -> Result<(), Error> {
        self.apply(service).await
    }

    async fn update_status(
        &self,
        darkroom: &Darkroom,
        status: &DarkroomStatus,
    ) -> Result<(), Error> {
        let name = darkroom.name_any();
        let namespace = darkroom.namespace().unwrap_or_default();
        let api: Api<Darkroom> = Api::namespaced(self.client.clone(), &namespace);

        let mut updated = darkroom.clone();
        updated.status = Some(status.clone());
        let body = serde_json::to_vec(&updated)
            .map_err(|e| Error::serialization_for_kind("Darkroom", e.to_string()))?;

        api.replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| Error::status_update(&name, e))?;
        Ok(())
    }
}

// =============================================================================
// Context
// =============================================================================

/// Per-identity exponential backoff for failed reconciles
#[derive(Default)]
pub struct Backoff {
    failures: DashMap<String, u32>,
}

impl Backoff {
    /// Delay before the next attempt, counting this failure
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.entry(key.to_string()).or_insert(0);
        let attempt = *failures;
        *failures = attempt.saturating_add(1);
        BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(BACKOFF_MAX)
    }

    /// Forget the failures of `key` after a successful cycle
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }
}

/// Shared context for the Darkroom controller
pub struct Context {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn DarkroomKubeClient>,
    /// Retry delays per Darkroom
    pub backoff: Backoff,
}

impl Context {
    /// Create a new Context with the given client
    pub fn new(kube: Arc<dyn DarkroomKubeClient>) -> Self {
        Self {
            kube,
            backoff: Backoff::default(),
        }
    }

    /// Create a new Context from a Kubernetes client
    pub fn from_client(client: Client) -> Self {
        Self::new(Arc::new(DarkroomKubeClientImpl::new(client)))
    }
}

fn identity(darkroom: &Darkroom) -> String {
    format!(
        "{}/{}",
        darkroom.namespace().unwrap_or_default(),
        darkroom.name_any()
    )
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a Darkroom
///
/// Returns `Action::await_change()` once the children are applied and status
/// reflects the spec; any error is handed to [`error_policy`] for a retry.
#[instrument(skip(darkroom, ctx), fields(darkroom = %darkroom.name_any()))]
pub async fn reconcile(darkroom: Arc<Darkroom>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(darkroom.name_any());
    let result = reconcile_current(&darkroom, &ctx).await;
    match &result {
        Ok(_) => {
            ctx.backoff.reset(&identity(&darkroom));
            timer.success();
        }
        Err(e) => timer.error(e.is_retryable()),
    }
    result
}

async fn reconcile_current(darkroom: &Darkroom, ctx: &Context) -> Result<Action, Error> {
    let name = darkroom.name_any();
    let namespace = darkroom
        .namespace()
        .ok_or_else(|| Error::internal_with_context("reconciler", "darkroom has no namespace"))?;

    let Some(current) = ctx.kube.get_darkroom(&namespace, &name).await? else {
        debug!("darkroom is gone, nothing to reconcile");
        return Ok(Action::await_change());
    };

    let children = compile(&current)?;

    if !matches!(current.spec.source, Source::WebFolder(_)) {
        // TODO: project bucket credentials through a Secret once the server's
        // env contract for S3 and GCS sources is settled.
        warn!(
            source = %current.spec.source.source_type(),
            "bucket credentials are not projected into the darkroom config"
        );
    }

    ctx.kube.apply_config_map(&children.config_map).await?;
    ctx.kube.apply_deployment(&children.deployment).await?;
    ctx.kube.apply_service(&children.service).await?;

    let desired = DarkroomStatus::deploying(&current.spec);
    if current.status.as_ref() == Some(&desired) {
        debug!("status already up to date");
    } else {
        ctx.kube.update_status(&current, &desired).await?;
        info!(state = %desired.deploy_state, domains = ?desired.domains, "status updated");
    }

    Ok(Action::await_change())
}

/// Error policy for the Darkroom controller
///
/// Every failure is retried. Retryable errors back off exponentially per
/// Darkroom, starting at one second and capped at five minutes; anything else
/// (a forbidden read while RBAC propagates, an undecodable object) retries at
/// the cap so the Darkroom is never left waiting on an unrelated event.
pub fn error_policy(darkroom: Arc<Darkroom>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        darkroom = %darkroom.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.backoff.next_delay(&identity(&darkroom)))
    } else {
        Action::requeue(BACKOFF_MAX)
    }
}
