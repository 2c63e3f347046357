//! The top-level reconcile of traffic objects.
//!
//! [`TrafficController`] is the [`Process`] implementation driven by the work queue: it loads the
//! object behind a [`TrafficKey`], guards it with the cascade cleanup finalizer, runs the
//! [`Pipeline`] and persists whatever the stages changed.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    api::networking::v1::{Ingress, IngressStatus},
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    domain::controller::OnVerified,
    logging::controller::ReconcilerError,
    net::watcher::OnChange,
    reconciler::{Pipeline, PipelineError, ReconcileStatus},
    store::{self, ObjectKey, Store},
    traffic::{
        self, Traffic, TrafficKey,
        meta::{
            ANNOTATION_TRAFFIC_KEY, ANNOTATION_TRAFFIC_KIND, CASCADE_CLEANUP_FINALIZER,
            TrafficMetaExt,
        },
        route::{Route, RouteStatus},
    },
    workqueue::{Process, WorkQueue},
};

pub const CONTROLLER_NAME: &str = "traffic";

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("invalid work queue key"))]
    InvalidKey { source: traffic::Error },

    #[snafu(display("failed to get {key}"))]
    GetTraffic { source: store::Error, key: String },

    #[snafu(display("failed to update {key}"))]
    UpdateTraffic { source: store::Error, key: String },

    #[snafu(display("failed to update the status of {key}"))]
    UpdateTrafficStatus { source: store::Error, key: String },

    #[snafu(display("failed to reconcile {key}"))]
    Reconcile { source: PipelineError, key: String },

    #[snafu(display("failed to list traffic objects of cluster {cluster:?}"))]
    ListTraffic {
        source: store::Error,
        cluster: String,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// Gives the controller separate access to the status of an object, which is written through its
/// own subresource.
pub trait WithStatus {
    type Status: Clone + PartialEq + Send + Sync;

    fn status(&self) -> Option<&Self::Status>;

    fn set_status(&mut self, status: Option<Self::Status>);
}

impl WithStatus for Ingress {
    type Status = IngressStatus;

    fn status(&self) -> Option<&IngressStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: Option<IngressStatus>) {
        self.status = status;
    }
}

impl WithStatus for Route {
    type Status = RouteStatus;

    fn status(&self) -> Option<&RouteStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: Option<RouteStatus>) {
        self.status = status;
    }
}

/// Recovers the traffic object owning a DNS Record, Secret or Certificate from its
/// traffic key and kind annotations.
pub fn owner_key(meta: &ObjectMeta) -> Option<TrafficKey> {
    let kind = meta.annotation(ANNOTATION_TRAFFIC_KIND)?.parse().ok()?;
    let key: ObjectKey = meta.annotation(ANNOTATION_TRAFFIC_KEY)?.parse().ok()?;
    Some(TrafficKey {
        kind,
        cluster: key.cluster,
        namespace: key.namespace?,
        name: key.name,
    })
}

/// A callback adding the key it is called with to `queue`.
pub fn enqueue_fn(queue: Arc<WorkQueue>) -> OnChange {
    Arc::new(move |key: &str| queue.add(key))
}

pub struct TrafficController<T> {
    store: Arc<dyn Store<T>>,
    pipeline: Pipeline,
    queue: Arc<WorkQueue>,
    dns_retry_interval: Duration,
}

impl<T> TrafficController<T>
where
    T: Traffic + WithStatus + Clone + PartialEq + Debug + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn Store<T>>,
        pipeline: Pipeline,
        queue: Arc<WorkQueue>,
        dns_retry_interval: Duration,
    ) -> Self {
        Self {
            store,
            pipeline,
            queue,
            dns_retry_interval,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Enqueues the traffic object owning `meta`, if any.
    pub fn enqueue_owner(&self, meta: &ObjectMeta) {
        if let Some(owner) = owner_key(meta) {
            self.queue.add(&owner.to_string());
        }
    }

    /// Re-enqueues every traffic object of `cluster` with custom hosts waiting for verification.
    pub async fn enqueue_pending_hosts(&self, cluster: &str) -> Result<usize, Error> {
        let objects = self
            .store
            .list(cluster)
            .await
            .context(ListTrafficSnafu { cluster })?;
        let mut enqueued = 0;
        for object in objects.iter().filter(|object| object.meta().has_pending_hosts()) {
            self.queue.add(&object.key().to_string());
            enqueued += 1;
        }
        tracing::debug!(cluster, enqueued, "enqueued traffic objects with pending hosts");
        Ok(enqueued)
    }

    /// A callback for [`DomainVerificationReconciler::on_verified`] re-enqueueing the pending
    /// objects of the verified domain's cluster.
    ///
    /// [`DomainVerificationReconciler::on_verified`]: crate::domain::controller::DomainVerificationReconciler::on_verified
    pub fn pending_hosts_trigger(self: &Arc<Self>) -> OnVerified {
        let this = Arc::clone(self);
        Arc::new(move |cluster: &str| {
            let this = Arc::clone(&this);
            let cluster = cluster.to_owned();
            tokio::spawn(async move {
                if let Err(err) = this.enqueue_pending_hosts(&cluster).await {
                    tracing::warn!(
                        cluster,
                        error = &err as &dyn std::error::Error,
                        "failed to enqueue traffic objects with pending hosts"
                    );
                }
            });
        })
    }

    /// Writes the changes of `desired` relative to `current`, the object first and then its status.
    async fn persist(&self, current: &T, desired: &T, key: &str) -> Result<(), Error> {
        let status_changed = current.status() != desired.status();
        let mut without_status = desired.clone();
        without_status.set_status(current.status().cloned());

        let mut written = current.clone();
        if without_status != *current {
            written = self
                .store
                .update(desired)
                .await
                .context(UpdateTrafficSnafu { key })?;
        }

        // The status of an object on its way out is not worth a write
        if status_changed && !desired.is_deleting() {
            written.set_status(desired.status().cloned());
            self.store
                .update_status(&written)
                .await
                .context(UpdateTrafficStatusSnafu { key })?;
        }
        Ok(())
    }

    async fn reconcile(&self, current: &T, key: &str) -> Result<(), Error> {
        let mut traffic = current.clone();
        if !traffic.is_shadow() && !traffic.is_deleting() {
            traffic.meta_mut().add_finalizer(CASCADE_CLEANUP_FINALIZER);
        }
        if traffic.is_deleting()
            && !traffic.is_shadow()
            && !traffic.meta().has_finalizer(CASCADE_CLEANUP_FINALIZER)
        {
            tracing::debug!("object is being deleted and already cleaned up");
            return Ok(());
        }

        let result = self.pipeline.run(&mut traffic).await;
        if traffic.is_deleting() && result.is_ok() {
            traffic.meta_mut().remove_finalizer(CASCADE_CLEANUP_FINALIZER);
        }

        match self.persist(current, &traffic, key).await {
            Err(Error::UpdateTraffic { source, .. } | Error::UpdateTrafficStatus { source, .. })
                if source.is_conflict() =>
            {
                tracing::debug!("object changed while reconciling, requeueing");
                self.queue.add(key);
                return Ok(());
            }
            other => other?,
        }

        match result.context(ReconcileSnafu { key })? {
            ReconcileStatus::Continue => {}
            ReconcileStatus::Stop => self.queue.add_after(key, self.dns_retry_interval),
        }
        Ok(())
    }
}

#[async_trait]
impl<T> Process for TrafficController<T>
where
    T: Traffic + WithStatus + Clone + PartialEq + Debug + Send + Sync + 'static,
{
    type Error = Error;

    #[tracing::instrument(skip_all, fields(traffic.key = key))]
    async fn process(&self, key: &str) -> Result<(), Error> {
        let traffic_key: TrafficKey = key.parse().context(InvalidKeySnafu)?;
        let Some(current) = self
            .store
            .get(&traffic_key.object_key())
            .await
            .context(GetTrafficSnafu { key })?
        else {
            tracing::debug!("traffic object was deleted");
            return Ok(());
        };
        self.reconcile(&current, key).await
    }
}
