//! The traffic object abstraction.
//!
//! Ingresses and Routes are both "traffic objects": they expose one or more hosts, carry TLS
//! material and report load balancer addresses, either natively or per remote cluster through
//! annotations. The reconcilers only ever see a `&mut dyn Traffic`.

use std::{
    collections::BTreeMap,
    fmt::Display,
    net::IpAddr,
    str::FromStr,
};

use async_trait::async_trait;
use k8s_openapi::{
    api::core::v1::Secret,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
};
use snafu::{OptionExt, ResultExt, Snafu, ensure};

use crate::{
    domain::DomainVerification,
    net::{self, HostResolver},
    store::{self, ObjectKey, Store},
    traffic::{meta::TrafficMetaExt, route::Route},
};

pub mod ingress;
pub mod meta;
pub mod route;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("invalid traffic key {key:?}"))]
    InvalidKey { key: String },

    #[snafu(display("failed to parse annotation {annotation:?}"))]
    ParseAnnotation {
        source: serde_json::Error,
        annotation: String,
    },

    #[snafu(display("failed to serialize annotation {annotation:?}"))]
    SerializeAnnotation {
        source: serde_json::Error,
        annotation: String,
    },

    #[snafu(display("failed to resolve load balancer host {host:?}"))]
    ResolveHost { source: net::Error, host: String },

    #[snafu(display("failed to manage shadow object {key}"))]
    Shadow { source: store::Error, key: ObjectKey },
}

impl Error {
    /// True if a load balancer host has no addresses (yet).
    pub fn is_no_such_host(&self) -> bool {
        matches!(self, Self::ResolveHost { source, .. } if source.is_no_such_host())
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
pub enum TrafficKind {
    Ingress,
    Route,
}

impl TrafficKind {
    pub fn api_version(self) -> &'static str {
        match self {
            Self::Ingress => "networking.k8s.io/v1",
            Self::Route => "route.openshift.io/v1",
        }
    }
}

/// Identity of a traffic object, also its work queue key.
///
/// The string form is `Kind|cluster|namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrafficKey {
    pub kind: TrafficKind,
    pub cluster: String,
    pub namespace: String,
    pub name: String,
}

impl TrafficKey {
    pub fn from_meta(kind: TrafficKind, meta: &ObjectMeta) -> Self {
        Self {
            kind,
            cluster: store::cluster_of(meta).to_owned(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::namespaced(&self.cluster, &self.namespace, &self.name)
    }
}

impl Display for TrafficKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}/{}",
            self.kind, self.cluster, self.namespace, self.name
        )
    }
}

impl FromStr for TrafficKey {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self, Error> {
        let mut parts = key.splitn(3, '|');
        let (Some(kind), Some(cluster), Some(rest)) = (parts.next(), parts.next(), parts.next())
        else {
            return InvalidKeySnafu { key }.fail();
        };
        let kind: TrafficKind = kind.parse().ok().context(InvalidKeySnafu { key })?;
        let (namespace, name) = rest.split_once('/').context(InvalidKeySnafu { key })?;
        ensure!(
            !namespace.is_empty() && !name.is_empty(),
            InvalidKeySnafu { key }
        );

        Ok(Self {
            kind,
            cluster: cluster.to_owned(),
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum TargetType {
    #[strum(serialize = "IP")]
    Ip,
    #[strum(serialize = "HOST")]
    Host,
}

/// A load balancer address a traffic object is reachable through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// The address as reported: an IP or a host name.
    pub value: String,
    pub target_type: TargetType,
    /// What `value` currently resolves to.
    pub addresses: Vec<IpAddr>,
}

/// Targets keyed by cluster, then by reported address.
pub type DnsTargets = BTreeMap<String, BTreeMap<String, Target>>;

/// The capabilities shared by all traffic object kinds.
#[async_trait]
pub trait Traffic: Send + Sync {
    fn kind(&self) -> TrafficKind;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> TrafficKey {
        TrafficKey::from_meta(self.kind(), self.meta())
    }

    fn is_shadow(&self) -> bool {
        self.meta().is_shadow()
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Identity the certificate of this object is requested under.
    ///
    /// Shadow objects share the certificate of their primary.
    fn certificate_owner(&self) -> TrafficKey {
        self.key()
    }

    /// All hosts the object currently serves.
    fn hosts(&self) -> Vec<String>;

    /// Serves `host` with the key pair in `secret`.
    fn add_tls(&mut self, host: &str, secret: &Secret);

    /// Stops serving TLS for `hosts`.
    fn remove_tls(&mut self, hosts: &[String]);

    /// Replaces every host other than `managed_host` by it, returns the replaced hosts.
    fn replace_custom_hosts(&mut self, managed_host: &str) -> Vec<String>;

    /// Moves hosts without a verified domain to the pending annotation and restores pending
    /// hosts whose domain got verified.
    ///
    /// `shadows` stores the shadow objects of kinds holding a single host.
    async fn process_custom_hosts(
        &mut self,
        verifications: &[DomainVerification],
        shadows: &dyn Store<Route>,
    ) -> Result<(), Error>;

    /// Deletes the shadow object serving the generated host next to a custom host, if there is
    /// one, and releases its finalizer.
    async fn remove_shadow(&mut self, shadows: &dyn Store<Route>) -> Result<(), Error>;

    /// Load balancer addresses (IPs or host names) per cluster.
    fn load_balancer_addresses(&self) -> Result<BTreeMap<String, Vec<String>>, Error>;

    /// Points the object's own status at `host`.
    fn set_dns_lb_host(&mut self, host: &str);

    /// True if the status is reported per remote cluster through annotations.
    fn tmc_enabled(&self) -> bool {
        self.meta().has_remote_status()
    }

    /// Remote clusters the object is placed on.
    fn sync_targets(&self) -> Vec<String> {
        self.meta().sync_targets()
    }

    /// Resolves all load balancer addresses to IP targets.
    async fn dns_targets(&self, resolver: &dyn HostResolver) -> Result<DnsTargets, Error> {
        let mut targets = DnsTargets::new();
        for (cluster, addresses) in self.load_balancer_addresses()? {
            let cluster_targets = targets.entry(cluster).or_default();
            for address in addresses {
                let target = resolve_target(&address, resolver).await?;
                cluster_targets.insert(address, target);
            }
        }
        Ok(targets)
    }
}

/// A controller reference to `traffic`, [`None`] until the object was persisted.
pub fn owner_reference(traffic: &dyn Traffic) -> Option<OwnerReference> {
    let meta = traffic.meta();
    Some(OwnerReference {
        api_version: traffic.kind().api_version().to_owned(),
        kind: traffic.kind().to_string(),
        name: meta.name.clone()?,
        uid: meta.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Turns a reported load balancer address into a [`Target`].
pub async fn resolve_target(address: &str, resolver: &dyn HostResolver) -> Result<Target, Error> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(Target {
            value: address.to_owned(),
            target_type: TargetType::Ip,
            addresses: vec![ip],
        });
    }

    let mut addresses: Vec<IpAddr> = resolver
        .lookup_ip_addr(address)
        .await
        .context(ResolveHostSnafu { host: address })?
        .into_iter()
        .map(|record| record.ip)
        .collect();
    addresses.sort_unstable();
    addresses.dedup();

    Ok(Target {
        value: address.to_owned(),
        target_type: TargetType::Host,
        addresses,
    })
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use rstest::rstest;

    use super::*;
    use crate::net::StaticResolver;

    #[rstest]
    #[case::ingress("Ingress|root:org|default/web", TrafficKind::Ingress, "root:org")]
    #[case::route("Route|root:org:team|default/web", TrafficKind::Route, "root:org:team")]
    #[case::default_cluster("Ingress||default/web", TrafficKind::Ingress, "")]
    fn traffic_key_round_trips(
        #[case] input: &str,
        #[case] kind: TrafficKind,
        #[case] cluster: &str,
    ) {
        let key: TrafficKey = input.parse().expect("valid key");
        assert_eq!(key.kind, kind);
        assert_eq!(key.cluster, cluster);
        assert_eq!(key.namespace, "default");
        assert_eq!(key.name, "web");
        assert_eq!(key.to_string(), input);
    }

    #[rstest]
    #[case::unknown_kind("Service|root:org|default/web")]
    #[case::missing_namespace("Ingress|root:org|web")]
    #[case::missing_cluster("Ingress|default/web")]
    #[case::empty_name("Ingress|root:org|default/")]
    fn traffic_key_rejects_malformed_keys(#[case] input: &str) {
        assert!(input.parse::<TrafficKey>().is_err());
    }

    #[tokio::test]
    async fn ip_addresses_are_used_directly() {
        let resolver = StaticResolver::default();
        let target = resolve_target("10.0.0.1", &resolver).await.expect("ip");
        assert_eq!(target.target_type, TargetType::Ip);
        assert_eq!(target.addresses, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);
    }

    #[tokio::test]
    async fn host_names_are_resolved() {
        let resolver = StaticResolver::default();
        resolver.set("lb.example.com", vec![
            Ipv4Addr::new(10, 0, 0, 2).into(),
            Ipv4Addr::new(10, 0, 0, 1).into(),
        ]);

        let target = resolve_target("lb.example.com", &resolver)
            .await
            .expect("resolves");
        assert_eq!(target.target_type, TargetType::Host);
        assert_eq!(target.addresses, vec![
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        ]);

        let err = resolve_target("missing.example.com", &resolver)
            .await
            .expect_err("unknown host");
        assert!(err.is_no_such_host());
    }
}
