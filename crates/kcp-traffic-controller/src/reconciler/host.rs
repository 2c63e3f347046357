//! Assigns the generated host and applies the custom host policy.

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use snafu::{ResultExt, Snafu};

use crate::{
    dns::DnsRecord,
    domain::DomainVerification,
    reconciler::{self, ReconcileStatus, Reconciler},
    store::{self, Store},
    traffic::{
        self, Traffic,
        meta::{ANNOTATION_CUSTOM_HOSTS_REPLACED, TrafficMetaExt},
        route::Route,
    },
};

/// Length of the random label of generated hosts.
pub const HOST_ID_LENGTH: usize = 20;

const BASE32_HEX: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up the DNS record of {key}"))]
    GetDnsRecord {
        source: store::Error,
        key: store::ObjectKey,
    },

    #[snafu(display("failed to list domain verifications of cluster {cluster:?}"))]
    ListVerifications {
        source: store::Error,
        cluster: String,
    },

    #[snafu(display("failed to process custom hosts"))]
    ProcessCustomHosts { source: traffic::Error },

    #[snafu(display("failed to remove the shadow object"))]
    RemoveShadow { source: traffic::Error },

    #[snafu(display("failed to record replaced hosts"))]
    RecordReplacedHosts { source: serde_json::Error },
}

/// A random DNS label, lower case base32hex.
pub fn generate_host_id() -> String {
    let mut rng = rand::rng();
    (0..HOST_ID_LENGTH)
        .map(|_| char::from(BASE32_HEX[rng.random_range(0..BASE32_HEX.len())]))
        .collect()
}

pub struct HostReconciler {
    managed_domain: String,
    custom_hosts_enabled: bool,
    verifications: Arc<dyn Store<DomainVerification>>,
    shadows: Arc<dyn Store<Route>>,
    dns_records: Arc<dyn Store<DnsRecord>>,
}

impl HostReconciler {
    pub fn new(
        managed_domain: &str,
        custom_hosts_enabled: bool,
        verifications: Arc<dyn Store<DomainVerification>>,
        shadows: Arc<dyn Store<Route>>,
        dns_records: Arc<dyn Store<DnsRecord>>,
    ) -> Self {
        Self {
            managed_domain: managed_domain.to_owned(),
            custom_hosts_enabled,
            verifications,
            shadows,
            dns_records,
        }
    }

    /// The host to assign: the one already published for the object, a fresh one otherwise.
    async fn assign_host(&self, traffic: &dyn Traffic) -> Result<String, Error> {
        let key = traffic.key().object_key();
        let record = self
            .dns_records
            .get(&key)
            .await
            .context(GetDnsRecordSnafu { key })?;
        if let Some(host) = record.as_ref().and_then(|record| record.metadata.generated_host()) {
            return Ok(host.to_owned());
        }

        Ok(format!("{}.{}", generate_host_id(), self.managed_domain))
    }

    async fn reconcile_host(&self, traffic: &mut dyn Traffic) -> Result<ReconcileStatus, Error> {
        let Some(generated_host) = traffic.meta().generated_host().map(str::to_owned) else {
            if traffic.is_deleting() {
                return Ok(ReconcileStatus::Continue);
            }
            let host = self.assign_host(traffic).await?;
            tracing::info!(
                traffic.key = %traffic.key(),
                dns.host = %host,
                "assigned generated host"
            );
            traffic.meta_mut().set_generated_host(&host);
            return Ok(ReconcileStatus::Stop);
        };

        if !self.custom_hosts_enabled {
            // A shadow created while custom hosts were enabled would claim the generated host
            traffic
                .remove_shadow(self.shadows.as_ref())
                .await
                .context(RemoveShadowSnafu)?;
            let replaced = traffic.replace_custom_hosts(&generated_host);
            if !replaced.is_empty() {
                tracing::info!(
                    traffic.key = %traffic.key(),
                    ?replaced,
                    "custom hosts are disabled, replaced them by the generated host"
                );
                traffic
                    .meta_mut()
                    .set_replaced_hosts(&replaced)
                    .context(RecordReplacedHostsSnafu)?;
            }
            return Ok(ReconcileStatus::Continue);
        }

        if traffic.meta().annotation(ANNOTATION_CUSTOM_HOSTS_REPLACED).is_some() {
            traffic
                .meta_mut()
                .set_replaced_hosts(&[])
                .context(RecordReplacedHostsSnafu)?;
        }

        let cluster = store::cluster_of(traffic.meta()).to_owned();
        let verifications = self
            .verifications
            .list(&cluster)
            .await
            .context(ListVerificationsSnafu { cluster })?;
        traffic
            .process_custom_hosts(&verifications, self.shadows.as_ref())
            .await
            .context(ProcessCustomHostsSnafu)?;
        Ok(ReconcileStatus::Continue)
    }
}

#[async_trait]
impl Reconciler for HostReconciler {
    fn name(&self) -> &'static str {
        "host"
    }

    async fn reconcile(
        &self,
        traffic: &mut dyn Traffic,
    ) -> Result<ReconcileStatus, reconciler::Error> {
        self.reconcile_host(traffic)
            .await
            .context(reconciler::HostSnafu)
    }
}
