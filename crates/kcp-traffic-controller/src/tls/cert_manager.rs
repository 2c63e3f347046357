//! A [`CertificateProvider`] backed by cert-manager `Certificate` objects.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    store::{self, ObjectKey, Store, delete_ignore_not_found},
    tls::{CertificateProvider, CertificateRequest, Error},
};

/// The subset of the cert-manager `Certificate` the controller writes and reads.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    namespaced,
    status = "CertificateStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,

    #[serde(default)]
    pub dns_names: Vec<String>,

    pub issuer_ref: IssuerRef,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    #[serde(default)]
    pub conditions: Vec<CertificateCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Certificate {
    fn ready_condition(&self) -> Option<&CertificateCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|condition| condition.type_ == "Ready")
    }

    pub fn is_ready(&self) -> bool {
        self.ready_condition()
            .is_some_and(|condition| condition.status == "True")
    }
}

pub struct CertManagerProvider {
    certificates: Arc<dyn Store<Certificate>>,
    secrets: Arc<dyn Store<Secret>>,
    cluster: String,
    namespace: String,
    issuer: String,
}

impl CertManagerProvider {
    /// Certificates are requested in `namespace` of the controller's own `cluster`.
    pub fn new(
        certificates: Arc<dyn Store<Certificate>>,
        secrets: Arc<dyn Store<Secret>>,
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            certificates,
            secrets,
            cluster: cluster.into(),
            namespace: namespace.into(),
            issuer: issuer.into(),
        }
    }

    fn key(&self, name: &str) -> ObjectKey {
        ObjectKey::namespaced(&self.cluster, &self.namespace, name)
    }

    fn certificate(&self, request: &CertificateRequest) -> Certificate {
        let mut metadata = ObjectMeta {
            name: Some(request.name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: Some(request.labels.clone()).filter(|labels| !labels.is_empty()),
            annotations: Some(request.annotations.clone())
                .filter(|annotations| !annotations.is_empty()),
            ..ObjectMeta::default()
        };
        store::set_cluster(&mut metadata, &self.cluster);

        Certificate {
            metadata,
            spec: CertificateSpec {
                secret_name: request.name.clone(),
                dns_names: vec![request.host.clone()],
                issuer_ref: IssuerRef {
                    name: self.issuer.clone(),
                    kind: Some("ClusterIssuer".to_owned()),
                    group: Some("cert-manager.io".to_owned()),
                },
            },
            status: None,
        }
    }
}

fn provider_error(name: &str, source: store::Error) -> Error {
    Error::Provider {
        source: Box::new(source),
        name: name.to_owned(),
    }
}

#[async_trait]
impl CertificateProvider for CertManagerProvider {
    async fn create(&self, request: &CertificateRequest) -> Result<(), Error> {
        match self.certificates.create(&self.certificate(request)).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_already_exists() => Err(Error::AlreadyExists {
                name: request.name.clone(),
            }),
            Err(err) => Err(provider_error(&request.name, err)),
        }
    }

    async fn update(&self, request: &CertificateRequest) -> Result<(), Error> {
        store::create_or_update(self.certificates.as_ref(), self.certificate(request))
            .await
            .map(|_| ())
            .map_err(|err| provider_error(&request.name, err))
    }

    async fn delete(&self, request: &CertificateRequest) -> Result<(), Error> {
        let key = self.key(&request.name);
        match self.certificates.delete(&key).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                return Err(Error::NotFound {
                    name: request.name.clone(),
                });
            }
            Err(err) => return Err(provider_error(&request.name, err)),
        }

        // cert-manager leaves the issued secret behind
        delete_ignore_not_found(self.secrets.as_ref(), &key)
            .await
            .map_err(|err| provider_error(&request.name, err))
    }

    async fn get_secret(&self, request: &CertificateRequest) -> Result<Option<Secret>, Error> {
        let key = self.key(&request.name);
        let certificate = self
            .certificates
            .get(&key)
            .await
            .map_err(|err| provider_error(&request.name, err))?;
        if !certificate.is_some_and(|certificate| certificate.is_ready()) {
            return Ok(None);
        }

        self.secrets
            .get(&key)
            .await
            .map_err(|err| provider_error(&request.name, err))
    }

    async fn status(&self, request: &CertificateRequest) -> Result<String, Error> {
        let certificate = self
            .certificates
            .get(&self.key(&request.name))
            .await
            .map_err(|err| provider_error(&request.name, err))?;

        let Some(certificate) = certificate else {
            return Err(Error::NotFound {
                name: request.name.clone(),
            });
        };
        if certificate.is_ready() {
            return Ok("ready".to_owned());
        }
        Ok(certificate
            .ready_condition()
            .and_then(|condition| condition.reason.as_deref())
            .map_or_else(|| "pending".to_owned(), str::to_lowercase))
    }
}
