//! Requests the certificate of the generated host and serves it once issued.
//!
//! DNS is not advanced while the certificate is pending, the stage returns
//! [`ReconcileStatus::Continue`] and records the provider's state on the object instead.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use snafu::{ResultExt, Snafu};

use crate::{
    reconciler::{self, ReconcileStatus, Reconciler},
    store::{self, ObjectKey, Store},
    tls::{self, CertificateProvider, CertificateRequest, certificate_name, tls_secret_name},
    traffic::{
        Traffic, TrafficKey,
        meta::{ANNOTATION_TRAFFIC_KEY, ANNOTATION_TRAFFIC_KIND, TrafficMetaExt},
        owner_reference,
    },
};

pub const CERTIFICATE_STATE_READY: &str = "ready";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("generated host is missing"))]
    GeneratedHostMissing,

    #[snafu(display("certificate provider failed for {name:?}"))]
    Provider { source: tls::Error, name: String },

    #[snafu(display("failed to copy TLS secret {key}"))]
    CopySecret {
        source: store::Error,
        key: ObjectKey,
    },

    #[snafu(display("failed to delete TLS secret {key}"))]
    DeleteSecret {
        source: store::Error,
        key: ObjectKey,
    },
}

/// The certificate request of the object identified by `owner`.
pub fn certificate_request(owner: &TrafficKey, host: &str) -> CertificateRequest {
    CertificateRequest {
        name: certificate_name(owner),
        labels: BTreeMap::new(),
        annotations: BTreeMap::from([
            (
                ANNOTATION_TRAFFIC_KEY.to_owned(),
                owner.object_key().to_string(),
            ),
            (ANNOTATION_TRAFFIC_KIND.to_owned(), owner.kind.to_string()),
        ]),
        host: host.to_owned(),
    }
}

pub struct CertificateReconciler {
    provider: Arc<dyn CertificateProvider>,
    secrets: Arc<dyn Store<Secret>>,
}

impl CertificateReconciler {
    pub fn new(provider: Arc<dyn CertificateProvider>, secrets: Arc<dyn Store<Secret>>) -> Self {
        Self { provider, secrets }
    }

    fn secret_key(traffic: &dyn Traffic) -> ObjectKey {
        traffic
            .key()
            .object_key()
            .with_name(tls_secret_name(&traffic.certificate_owner()))
    }

    async fn delete(
        &self,
        traffic: &dyn Traffic,
        request: &CertificateRequest,
    ) -> Result<ReconcileStatus, Error> {
        // The certificate of a shadow belongs to its primary
        if traffic.is_shadow() {
            return Ok(ReconcileStatus::Continue);
        }

        if let Err(err) = self.provider.delete(request).await
            && !err.is_not_found()
        {
            return Err(err).context(ProviderSnafu {
                name: &request.name,
            });
        }

        let key = Self::secret_key(traffic);
        store::delete_ignore_not_found(self.secrets.as_ref(), &key)
            .await
            .context(DeleteSecretSnafu { key })?;
        Ok(ReconcileStatus::Continue)
    }

    /// Copies the issued key pair next to the traffic object, owned by it.
    async fn copy_secret(&self, traffic: &dyn Traffic, issued: Secret) -> Result<Secret, Error> {
        let key = Self::secret_key(traffic);
        let mut metadata = ObjectMeta {
            name: Some(key.name.clone()),
            namespace: key.namespace.clone(),
            owner_references: owner_reference(traffic).map(|owner| vec![owner]),
            ..ObjectMeta::default()
        };
        store::set_cluster(&mut metadata, &key.cluster);
        metadata.set_annotation(
            ANNOTATION_TRAFFIC_KEY,
            traffic.certificate_owner().object_key().to_string(),
        );
        metadata.set_annotation(ANNOTATION_TRAFFIC_KIND, traffic.kind().to_string());

        let secret = Secret {
            metadata,
            data: issued.data,
            type_: issued.type_,
            ..Secret::default()
        };
        store::create_or_update(self.secrets.as_ref(), secret)
            .await
            .context(CopySecretSnafu { key })
    }

    async fn reconcile_certificate(
        &self,
        traffic: &mut dyn Traffic,
    ) -> Result<ReconcileStatus, Error> {
        let owner = traffic.certificate_owner();
        let host = traffic.meta().generated_host().map(str::to_owned);

        if traffic.is_deleting() {
            let request = certificate_request(&owner, host.as_deref().unwrap_or_default());
            return self.delete(traffic, &request).await;
        }

        let Some(host) = host else {
            return GeneratedHostMissingSnafu.fail();
        };
        let request = certificate_request(&owner, &host);

        if !traffic.is_shadow() {
            match self.provider.create(&request).await {
                Ok(()) => tracing::info!(certificate = %request.name, "requested certificate"),
                Err(err) if err.is_already_exists() => {}
                Err(err) => {
                    return Err(err).context(ProviderSnafu {
                        name: &request.name,
                    });
                }
            }
        }

        let issued = self
            .provider
            .get_secret(&request)
            .await
            .context(ProviderSnafu {
                name: &request.name,
            })?;
        let Some(issued) = issued else {
            let state = match self.provider.status(&request).await {
                Ok(state) => state,
                Err(err) if err.is_not_found() => "requested".to_owned(),
                Err(err) => {
                    return Err(err).context(ProviderSnafu {
                        name: &request.name,
                    });
                }
            };
            tracing::debug!(certificate = %request.name, %state, "certificate is not ready");
            traffic.meta_mut().set_certificate_state(&state);
            return Ok(ReconcileStatus::Continue);
        };

        // A shadow serves the key pair of its primary, which already copied it
        let secret = if traffic.is_shadow() {
            issued
        } else {
            self.copy_secret(traffic, issued).await?
        };
        traffic
            .meta_mut()
            .set_certificate_state(CERTIFICATE_STATE_READY);
        traffic.add_tls(&host, &secret);
        Ok(ReconcileStatus::Continue)
    }
}

#[async_trait]
impl Reconciler for CertificateReconciler {
    fn name(&self) -> &'static str {
        "certificate"
    }

    async fn reconcile(
        &self,
        traffic: &mut dyn Traffic,
    ) -> Result<ReconcileStatus, reconciler::Error> {
        self.reconcile_certificate(traffic)
            .await
            .context(reconciler::CertificateSnafu)
    }
}
