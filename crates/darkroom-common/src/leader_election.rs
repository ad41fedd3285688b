//! Leader election using Kubernetes Leases
//!
//! Only one controller replica reconciles at a time. Replicas compete for a
//! `coordination.k8s.io/v1` Lease; the holder renews it periodically and the
//! others take it over once it expires.
//!
//! Writes carry the resourceVersion that was read, so two replicas racing
//! for the same lease cannot both win: the loser gets a 409 and waits.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::Error;

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// What to do with the lease as last read from the API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We hold it; bump the renew time
    Renew,
    /// Someone else held it but let it expire
    TakeOver {
        /// Transition count to record after taking over
        transitions: i32,
    },
    /// Someone else holds a live lease
    Wait,
}

/// Decide how to treat the current lease
pub fn lease_action(existing: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(spec) = existing else {
        return LeaseAction::Create;
    };
    if spec.holder_identity.as_deref() == Some(identity) {
        return LeaseAction::Renew;
    }

    let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(renewed), Some(secs)) => now > renewed.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    };
    if expired {
        LeaseAction::TakeOver {
            transitions: spec.lease_transitions.unwrap_or(0) + 1,
        }
    } else {
        LeaseAction::Wait
    }
}

/// Lease spec to write for `action`
///
/// Renewing only moves the renew time; the acquire time and transition count
/// change only when the lease changes hands.
pub fn next_lease_spec(
    existing: Option<&LeaseSpec>,
    action: &LeaseAction,
    identity: &str,
    now: DateTime<Utc>,
) -> LeaseSpec {
    let (acquire_time, transitions) = match (action, existing) {
        (LeaseAction::Renew, Some(spec)) => (
            spec.acquire_time.clone().unwrap_or(MicroTime(now)),
            spec.lease_transitions.unwrap_or(0),
        ),
        (LeaseAction::TakeOver { transitions }, _) => (MicroTime(now), *transitions),
        _ => (MicroTime(now), 0),
    };
    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
        acquire_time: Some(acquire_time),
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(transitions),
        ..Default::default()
    }
}

/// Leader elector backed by a single Lease
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    /// Create an elector for `lease_name` in `namespace`, competing as `identity`
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the lease in the background until it is
    /// dropped or renewal fails.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return self.guard();
                }
                Ok(false) => debug!(identity = %self.identity, "Lease held by another replica"),
                Err(e) => warn!(
                    identity = %self.identity,
                    error = %e,
                    "Failed to acquire lease, retrying..."
                ),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        let action = lease_action(
            existing.as_ref().and_then(|l| l.spec.as_ref()),
            &self.identity,
            now,
        );

        let existing_spec = existing.as_ref().and_then(|l| l.spec.clone());
        let resource_version = existing.and_then(|l| l.metadata.resource_version);

        match action {
            LeaseAction::Wait => Ok(false),
            LeaseAction::Create => {
                let spec = next_lease_spec(None, &action, &self.identity, now);
                let lease = self.lease(None, spec);
                Self::conflict_is_loss(api.create(&PostParams::default(), &lease).await)
            }
            LeaseAction::Renew | LeaseAction::TakeOver { .. } => {
                let rv = resource_version.ok_or_else(|| {
                    Error::internal_with_context("leader-election", "lease missing resourceVersion")
                })?;
                let spec = next_lease_spec(existing_spec.as_ref(), &action, &self.identity, now);
                let lease = self.lease(Some(rv), spec);
                let result = api
                    .replace(&self.lease_name, &PostParams::default(), &lease)
                    .await;
                if let (LeaseAction::TakeOver { transitions }, Ok(_)) = (&action, &result) {
                    info!(identity = %self.identity, transitions, "Took over expired lease");
                }
                Self::conflict_is_loss(result)
            }
        }
    }

    fn lease(&self, resource_version: Option<String>, spec: LeaseSpec) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(spec),
        }
    }

    // A 409 means another replica wrote the lease between our read and write.
    fn conflict_is_loss(result: Result<Lease, kube::Error>) -> Result<bool, Error> {
        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    async fn release_lease(&self) -> Result<(), Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let mut lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }

        spec.holder_identity = None;
        spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        api.replace(&self.lease_name, &PostParams::default(), &lease)
            .await?;

        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Stop renewing and hand the lease back so another replica can take over
    /// without waiting for expiry
    pub async fn release(self) {
        self.renewal_task.abort();
        if let Err(e) = self.elector.release_lease().await {
            warn!(error = %e, "Failed to release lease");
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held_by(holder: &str, renewed: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(holder.to_string()),
            lease_duration_seconds: Some(15),
            renew_time: Some(MicroTime(renewed)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    #[test]
    fn missing_lease_is_created() {
        assert_eq!(lease_action(None, "pod-a", Utc::now()), LeaseAction::Create);
    }

    #[test]
    fn own_lease_is_renewed() {
        let now = Utc::now();
        let spec = held_by("pod-a", now, 3);
        assert_eq!(lease_action(Some(&spec), "pod-a", now), LeaseAction::Renew);
    }

    #[test]
    fn live_lease_of_another_replica_is_respected() {
        let now = Utc::now();
        let spec = held_by("pod-b", now - chrono::Duration::seconds(5), 0);
        assert_eq!(lease_action(Some(&spec), "pod-a", now), LeaseAction::Wait);
    }

    #[test]
    fn expired_lease_is_taken_over_with_next_transition() {
        let now = Utc::now();
        let spec = held_by("pod-b", now - chrono::Duration::seconds(60), 2);
        assert_eq!(
            lease_action(Some(&spec), "pod-a", now),
            LeaseAction::TakeOver { transitions: 3 }
        );
    }

    #[test]
    fn released_lease_without_renew_time_is_free() {
        let spec = LeaseSpec::default();
        assert_eq!(
            lease_action(Some(&spec), "pod-a", Utc::now()),
            LeaseAction::TakeOver { transitions: 1 }
        );
    }

    #[test]
    fn renewal_keeps_acquire_time_and_transitions() {
        let acquired = Utc::now() - chrono::Duration::seconds(600);
        let now = Utc::now();
        let mut spec = held_by("pod-a", now - chrono::Duration::seconds(5), 4);
        spec.acquire_time = Some(MicroTime(acquired));

        let next = next_lease_spec(Some(&spec), &LeaseAction::Renew, "pod-a", now);
        assert_eq!(next.acquire_time, Some(MicroTime(acquired)));
        assert_eq!(next.lease_transitions, Some(4));
        assert_eq!(next.renew_time, Some(MicroTime(now)));
    }

    #[test]
    fn takeover_resets_acquire_time_and_bumps_transitions() {
        let now = Utc::now();
        let mut spec = held_by("pod-b", now - chrono::Duration::seconds(60), 2);
        spec.acquire_time = Some(MicroTime(now - chrono::Duration::seconds(600)));

        let action = lease_action(Some(&spec), "pod-a", now);
        let next = next_lease_spec(Some(&spec), &action, "pod-a", now);
        assert_eq!(next.holder_identity.as_deref(), Some("pod-a"));
        assert_eq!(next.acquire_time, Some(MicroTime(now)));
        assert_eq!(next.lease_transitions, Some(3));
    }

    #[test]
    fn created_lease_starts_at_zero_transitions() {
        let now = Utc::now();
        let next = next_lease_spec(None, &LeaseAction::Create, "pod-a", now);
        assert_eq!(next.acquire_time, Some(MicroTime(now)));
        assert_eq!(next.lease_transitions, Some(0));
    }
}
