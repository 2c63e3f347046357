//! Synthesizes the DNS Record of a traffic object from its load balancer targets.
//!
//! Load balancer host names are resolved and watched: when the addresses behind one of them
//! change, the [`HostWatcher`] enqueues the traffic object again.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::ObjectMeta, jiff::Timestamp,
};
use snafu::{ResultExt, Snafu};

use crate::{
    dns::{DnsRecord, DnsRecordSpec, set_endpoints},
    metrics::MetricsSink,
    net::watcher::HostWatcher,
    reconciler::{self, ReconcileStatus, Reconciler},
    store::{self, ObjectKey, Store},
    traffic::{
        self, DnsTargets, TargetType, Traffic,
        meta::{ANNOTATION_TRAFFIC_KEY, ANNOTATION_TRAFFIC_KIND, TrafficMetaExt},
        owner_reference,
    },
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("generated host is missing"))]
    GeneratedHostMissing,

    #[snafu(display("failed to discover DNS targets"))]
    DiscoverTargets { source: traffic::Error },

    #[snafu(display("failed to get DNS record {key}"))]
    GetRecord {
        source: store::Error,
        key: ObjectKey,
    },

    #[snafu(display("failed to write DNS record {key}"))]
    WriteRecord {
        source: store::Error,
        key: ObjectKey,
    },

    #[snafu(display("failed to delete DNS record {key}"))]
    DeleteRecord {
        source: store::Error,
        key: ObjectKey,
    },
}

/// Addresses grouped by the target they were discovered through.
type TargetGroups = BTreeMap<String, Vec<IpAddr>>;

/// The targets to publish and the host names among them.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ActiveTargets {
    pub groups: TargetGroups,
    pub hosts: BTreeSet<String>,
}

impl ActiveTargets {
    fn add(&mut self, targets: &BTreeMap<String, traffic::Target>) {
        for (address, target) in targets {
            let group = self.groups.entry(address.clone()).or_default();
            for ip in &target.addresses {
                if !group.contains(ip) {
                    group.push(*ip);
                }
            }
            if target.target_type == TargetType::Host {
                self.hosts.insert(address.clone());
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.groups.values().all(Vec::is_empty)
    }
}

/// Selects the targets of all clusters except those tearing the workload down.
///
/// If only deleting clusters have targets, theirs are used so the record does not go empty while
/// the workload moves.
pub fn active_targets(targets: &DnsTargets, deleting: &BTreeSet<String>) -> ActiveTargets {
    let mut active = ActiveTargets::default();
    let mut fallback = ActiveTargets::default();
    for (cluster, cluster_targets) in targets {
        if deleting.contains(cluster) {
            fallback.add(cluster_targets);
        } else {
            active.add(cluster_targets);
        }
    }

    if active.is_empty() && !fallback.is_empty() {
        tracing::info!(
            clusters = ?deleting,
            "only clusters being deleted have targets, keeping their addresses"
        );
        return fallback;
    }
    active
}

pub struct DnsReconciler {
    records: Arc<dyn Store<DnsRecord>>,
    watcher: Arc<HostWatcher>,
    metrics: Arc<dyn MetricsSink>,
}

impl DnsReconciler {
    pub fn new(
        records: Arc<dyn Store<DnsRecord>>,
        watcher: Arc<HostWatcher>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            records,
            watcher,
            metrics,
        }
    }

    /// Watches exactly `hosts` for `key`.
    fn sync_watches(&self, key: &str, hosts: &BTreeSet<String>) {
        for entry in self.watcher.list_host_record_watchers(key) {
            if !hosts.contains(&entry.host) {
                self.watcher.stop_watching(key, &entry.host);
            }
        }
        for host in hosts {
            if self.watcher.start_watching(key, host) {
                tracing::debug!(traffic.key = key, dns.host = %host, "watching load balancer host");
            }
        }
    }

    fn new_record(traffic: &dyn Traffic, key: &ObjectKey) -> DnsRecord {
        let mut metadata = ObjectMeta {
            name: Some(key.name.clone()),
            namespace: key.namespace.clone(),
            owner_references: owner_reference(traffic).map(|owner| vec![owner]),
            ..ObjectMeta::default()
        };
        store::set_cluster(&mut metadata, &key.cluster);
        metadata.set_annotation(ANNOTATION_TRAFFIC_KEY, key.to_string());
        metadata.set_annotation(ANNOTATION_TRAFFIC_KIND, traffic.kind().to_string());

        DnsRecord {
            metadata,
            spec: DnsRecordSpec::default(),
            status: None,
        }
    }

    fn observe_admission(&self, traffic: &dyn Traffic) {
        let Some(created) = &traffic.meta().creation_timestamp else {
            return;
        };
        let latency = Duration::try_from(Timestamp::now().duration_since(created.0))
            .unwrap_or_default();
        self.metrics
            .observe_admission_latency(traffic.kind(), latency);
    }

    async fn delete(&self, traffic: &dyn Traffic) -> Result<ReconcileStatus, Error> {
        self.watcher.stop_watching(&traffic.key().to_string(), "");
        let key = traffic.key().object_key();
        store::delete_ignore_not_found(self.records.as_ref(), &key)
            .await
            .context(DeleteRecordSnafu { key })?;
        Ok(ReconcileStatus::Continue)
    }

    async fn reconcile_dns(&self, traffic: &mut dyn Traffic) -> Result<ReconcileStatus, Error> {
        if traffic.is_shadow() {
            return Ok(ReconcileStatus::Continue);
        }
        if traffic.is_deleting() {
            return self.delete(traffic).await;
        }
        let Some(host) = traffic.meta().generated_host().map(str::to_owned) else {
            return GeneratedHostMissingSnafu.fail();
        };

        let traffic_key = traffic.key().to_string();
        let key = traffic.key().object_key();
        let existing = self
            .records
            .get(&key)
            .await
            .context(GetRecordSnafu { key: key.clone() })?;

        let targets = match traffic.dns_targets(self.watcher.resolver().as_ref()).await {
            Ok(targets) => targets,
            Err(err) if err.is_no_such_host() => {
                tracing::debug!(traffic.key = %traffic_key, "load balancer host does not resolve yet");
                return Ok(ReconcileStatus::Stop);
            }
            Err(err) => return Err(err).context(DiscoverTargetsSnafu),
        };
        let active = active_targets(&targets, &traffic.meta().deleting_sync_targets());
        self.sync_watches(&traffic_key, &active.hosts);

        match existing {
            None if active.is_empty() => {
                tracing::debug!(traffic.key = %traffic_key, "no targets discovered yet");
            }
            None => {
                let mut record = Self::new_record(traffic, &key);
                record.metadata.set_generated_host(&host);
                set_endpoints(&mut record, &host, &active.groups);
                match self.records.create(&record).await {
                    Ok(_) => {
                        tracing::info!(traffic.key = %traffic_key, dns.host = %host, "created DNS record");
                        self.observe_admission(traffic);
                    }
                    Err(err) if err.is_already_exists() => {}
                    Err(err) => return Err(err).context(WriteRecordSnafu { key }),
                }
            }
            Some(existing) => {
                let mut record = existing.clone();
                // Records written before the host moved to the traffic object lack it
                record.metadata.set_generated_host(&host);
                set_endpoints(&mut record, &host, &active.groups);
                if record != existing {
                    self.records
                        .update(&record)
                        .await
                        .context(WriteRecordSnafu { key })?;
                }
            }
        }

        if traffic.tmc_enabled() {
            traffic.set_dns_lb_host(&host);
        }
        Ok(ReconcileStatus::Continue)
    }
}

#[async_trait]
impl Reconciler for DnsReconciler {
    fn name(&self) -> &'static str {
        "dns"
    }

    async fn reconcile(
        &self,
        traffic: &mut dyn Traffic,
    ) -> Result<ReconcileStatus, reconciler::Error> {
        self.reconcile_dns(traffic)
            .await
            .context(reconciler::DnsSnafu)
    }
}
