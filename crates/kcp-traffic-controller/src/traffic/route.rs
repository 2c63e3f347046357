//! [`Traffic`] for OpenShift `route.openshift.io/v1` Routes.
//!
//! A Route has a single host. While it serves a verified custom host, a shadow Route named
//! `<name>-shadow` keeps the generated host reachable. The shadow is owned by the primary, marked
//! with [`ANNOTATION_SHADOW`](super::meta::ANNOTATION_SHADOW) and never processed for custom hosts
//! itself.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    ByteString,
    api::core::v1::Secret,
    apimachinery::pkg::{
        apis::meta::v1::ObjectMeta,
        util::intstr::IntOrString,
    },
};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::{
    domain::{DomainVerification, is_domain_verified},
    store::{self, ObjectKey, Store},
    traffic::{
        Error, ParseAnnotationSnafu, SerializeAnnotationSnafu, ShadowSnafu, Traffic, TrafficKey,
        TrafficKind,
        meta::{
            ANNOTATION_PENDING_CUSTOM_HOSTS, ANNOTATION_SHADOW, PendingRules,
            SHADOW_CLEANUP_FINALIZER, TrafficMetaExt,
        },
    },
};

pub const SHADOW_SUFFIX: &str = "-shadow";

const TLS_TERMINATION_EDGE: &str = "edge";

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    namespaced,
    status = "RouteStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    pub to: RouteTargetReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<RoutePort>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wildcard_policy: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteTargetReference {
    pub kind: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoutePort {
    pub target_port: IntOrString,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub termination: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_certificate: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_ca_certificate: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_edge_termination_policy: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    #[serde(default)]
    pub ingress: Vec<RouteIngress>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteIngress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_canonical_hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wildcard_policy: Option<String>,
}

/// A host parked in the pending annotation of a Route.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PendingHost {
    pub host: String,
}

fn canonical_hostnames(status: Option<&RouteStatus>) -> Vec<String> {
    let mut hosts: Vec<String> = Vec::new();
    let canonical = status
        .iter()
        .flat_map(|status| &status.ingress)
        .filter_map(|ingress| ingress.router_canonical_hostname.as_ref())
        .filter(|host| !host.is_empty());
    for host in canonical {
        if !hosts.contains(host) {
            hosts.push(host.clone());
        }
    }
    hosts
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    let ByteString(bytes) = secret.data.as_ref()?.get(key)?;
    String::from_utf8(bytes.clone()).ok()
}

impl Route {
    fn host(&self) -> &str {
        self.spec.host.as_deref().unwrap_or_default()
    }

    fn set_host(&mut self, host: &str) {
        self.spec.host = Some(host.to_owned());
    }

    fn shadow_key(&self) -> ObjectKey {
        let key = ObjectKey::from_meta(&self.metadata);
        let name = format!("{}{SHADOW_SUFFIX}", key.name);
        key.with_name(name)
    }

    /// The shadow this Route needs while serving a custom host.
    ///
    /// An `existing` shadow is taken as the base, only the fields the primary owns are laid over
    /// it. Metadata written by other controllers, TLS material and status survive.
    fn shadow(&self, generated_host: &str, existing: Option<&Self>) -> Self {
        let key = self.shadow_key();
        let mut shadow = existing.cloned().unwrap_or_else(|| Self {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: self.metadata.namespace.clone(),
                ..ObjectMeta::default()
            },
            spec: RouteSpec::default(),
            status: None,
        });

        let metadata = &mut shadow.metadata;
        if let Some(labels) = &self.metadata.labels {
            metadata
                .labels
                .get_or_insert_with(BTreeMap::new)
                .extend(labels.clone());
        }
        metadata.owner_references = self.controller_owner_ref(&()).map(|owner| vec![owner]);
        store::set_cluster(metadata, &key.cluster);
        metadata.set_annotation(ANNOTATION_SHADOW, "true");
        metadata.set_generated_host(generated_host);

        let tls = shadow.spec.tls.take();
        shadow.spec = RouteSpec {
            host: Some(generated_host.to_owned()),
            tls,
            ..self.spec.clone()
        };
        shadow
    }

    async fn delete_shadow(&mut self, shadows: &dyn Store<Self>) -> Result<(), Error> {
        let key = self.shadow_key();
        store::delete_ignore_not_found(shadows, &key)
            .await
            .context(ShadowSnafu { key })?;
        self.metadata.remove_finalizer(SHADOW_CLEANUP_FINALIZER);
        Ok(())
    }

    async fn ensure_shadow(
        &mut self,
        generated_host: &str,
        shadows: &dyn Store<Self>,
    ) -> Result<(), Error> {
        let key = self.shadow_key();
        let existing = shadows
            .get(&key)
            .await
            .context(ShadowSnafu { key: key.clone() })?;
        let desired = self.shadow(generated_host, existing.as_ref());
        store::create_or_update(shadows, desired)
            .await
            .context(ShadowSnafu { key })?;
        self.metadata.add_finalizer(SHADOW_CLEANUP_FINALIZER);
        Ok(())
    }

    fn set_pending_hosts(
        &mut self,
        pending: &PendingRules<PendingHost, TlsConfig>,
    ) -> Result<(), Error> {
        self.metadata
            .set_pending_rules(pending)
            .context(SerializeAnnotationSnafu {
                annotation: ANNOTATION_PENDING_CUSTOM_HOSTS,
            })
    }
}

#[async_trait]
impl Traffic for Route {
    fn kind(&self) -> TrafficKind {
        TrafficKind::Route
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn certificate_owner(&self) -> TrafficKey {
        let mut key = self.key();
        if self.is_shadow()
            && let Some(primary) = key.name.strip_suffix(SHADOW_SUFFIX)
        {
            key.name = primary.to_owned();
        }
        key
    }

    fn hosts(&self) -> Vec<String> {
        match self.host() {
            "" => Vec::new(),
            host => vec![host.to_owned()],
        }
    }

    fn add_tls(&mut self, host: &str, secret: &Secret) {
        if host != self.host() {
            return;
        }
        let tls = self.spec.tls.get_or_insert_with(Default::default);
        tls.termination = TLS_TERMINATION_EDGE.to_owned();
        tls.certificate = secret_value(secret, "tls.crt");
        tls.key = secret_value(secret, "tls.key");
    }

    fn remove_tls(&mut self, hosts: &[String]) {
        if hosts.iter().any(|host| host == self.host()) {
            self.spec.tls = None;
        }
    }

    fn replace_custom_hosts(&mut self, managed_host: &str) -> Vec<String> {
        let host = self.host().to_owned();
        if host.is_empty() || host == managed_host {
            return Vec::new();
        }
        let replaced = vec![host];
        self.remove_tls(&replaced);
        self.set_host(managed_host);
        replaced
    }

    async fn process_custom_hosts(
        &mut self,
        verifications: &[DomainVerification],
        shadows: &dyn Store<Route>,
    ) -> Result<(), Error> {
        let Some(generated_host) = self.metadata.generated_host().map(str::to_owned) else {
            return Ok(());
        };

        if self.is_shadow() {
            self.set_host(&generated_host);
            return Ok(());
        }

        if self.is_deleting() {
            return self.delete_shadow(shadows).await;
        }

        let pending: PendingRules<PendingHost, TlsConfig> =
            self.metadata
                .pending_rules()
                .context(ParseAnnotationSnafu {
                    annotation: ANNOTATION_PENDING_CUSTOM_HOSTS,
                })?;

        // A Route without a custom host falls back to a parked one, if any. The TLS config of a
        // parked host was parked with it.
        let mut host = self.host().to_owned();
        let tls = if host.is_empty() || host == generated_host {
            let Some(PendingHost { host: parked }) = pending.rules.into_iter().next() else {
                self.set_host(&generated_host);
                self.set_pending_hosts(&PendingRules::default())?;
                return self.delete_shadow(shadows).await;
            };
            host = parked;
            pending.tls.into_iter().next()
        } else {
            self.spec.tls.clone()
        };

        if is_domain_verified(&host, verifications) {
            self.set_host(&host);
            if tls.is_some() {
                self.spec.tls = tls;
            }
            self.set_pending_hosts(&PendingRules::default())?;
            self.ensure_shadow(&generated_host, shadows).await
        } else {
            self.spec.tls = None;
            self.set_host(&generated_host);
            self.set_pending_hosts(&PendingRules {
                rules: vec![PendingHost { host }],
                tls: tls.into_iter().collect(),
            })?;
            self.delete_shadow(shadows).await
        }
    }

    async fn remove_shadow(&mut self, shadows: &dyn Store<Route>) -> Result<(), Error> {
        if !self.metadata.has_finalizer(SHADOW_CLEANUP_FINALIZER) {
            return Ok(());
        }
        self.delete_shadow(shadows).await
    }

    fn load_balancer_addresses(&self) -> Result<BTreeMap<String, Vec<String>>, Error> {
        if !self.tmc_enabled() {
            let cluster = store::cluster_of(&self.metadata).to_owned();
            return Ok(BTreeMap::from([(
                cluster,
                canonical_hostnames(self.status.as_ref()),
            )]));
        }

        let statuses = self
            .metadata
            .remote_statuses::<RouteStatus>()
            .map_err(|(annotation, source)| Error::ParseAnnotation { source, annotation })?;
        Ok(statuses
            .into_iter()
            .map(|(sync_target, status)| (sync_target, canonical_hostnames(Some(&status))))
            .collect())
    }

    fn set_dns_lb_host(&mut self, host: &str) {
        let status = self.status.get_or_insert_with(Default::default);
        status.ingress = vec![RouteIngress {
            host: self.spec.host.clone(),
            router_canonical_hostname: Some(host.to_owned()),
            ..RouteIngress::default()
        }];
    }
}
