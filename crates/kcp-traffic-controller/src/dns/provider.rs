//! Publishes [`DnsRecord`]s to the DNS provider.
//!
//! The provider itself is an external collaborator behind [`DnsProvider`]. The
//! [`DnsRecordReconciler`] applies each record to every configured zone and mirrors the outcome
//! per zone into `status.zones[].conditions`.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    jiff::Timestamp,
};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    dns::{DnsRecord, DnsZone, DnsZoneStatus},
    logging::controller::{ReconcilerError, error_chain},
    store::{self, ObjectKey, Store},
    traffic::meta::TrafficMetaExt,
    workqueue::Process,
};

pub const CONTROLLER_NAME: &str = "dns-record";

/// Held on a DNS Record until it was removed from every zone.
pub const DNS_CLEANUP_FINALIZER: &str = "kuadrant.dev/dns-cleanup";

pub const PUBLISHED_CONDITION: &str = "Published";

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The authoritative DNS service.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Upserts all endpoints of `record` into `zone` and removes endpoints it no longer has.
    async fn ensure(&self, record: &DnsRecord, zone: &DnsZone) -> Result<(), BoxError>;

    /// Removes all endpoints of `record` from `zone`.
    async fn delete(&self, record: &DnsRecord, zone: &DnsZone) -> Result<(), BoxError>;
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("invalid work queue key"))]
    InvalidKey { source: store::Error },

    #[snafu(display("failed to get DNS record {key}"))]
    GetRecord { source: store::Error, key: String },

    #[snafu(display("failed to update DNS record {key}"))]
    UpdateRecord { source: store::Error, key: String },

    #[snafu(display("failed to publish DNS record {key} to zone {zone:?}"))]
    EnsureInZone {
        source: BoxError,
        key: String,
        zone: String,
    },

    #[snafu(display("failed to remove DNS record {key} from zone {zone:?}"))]
    DeleteFromZone {
        source: BoxError,
        key: String,
        zone: String,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub struct DnsRecordReconciler {
    store: Arc<dyn Store<DnsRecord>>,
    provider: Arc<dyn DnsProvider>,
    zones: Vec<DnsZone>,
}

impl DnsRecordReconciler {
    pub fn new(
        store: Arc<dyn Store<DnsRecord>>,
        provider: Arc<dyn DnsProvider>,
        zones: Vec<DnsZone>,
    ) -> Self {
        Self {
            store,
            provider,
            zones,
        }
    }

    async fn delete_from_zones(&self, key: &str, mut record: DnsRecord) -> Result<(), Error> {
        if !record.metadata.has_finalizer(DNS_CLEANUP_FINALIZER) {
            return Ok(());
        }

        for zone in &self.zones {
            self.provider
                .delete(&record, zone)
                .await
                .context(DeleteFromZoneSnafu { key, zone: &zone.id })?;
        }

        record.metadata.remove_finalizer(DNS_CLEANUP_FINALIZER);
        self.store
            .update(&record)
            .await
            .context(UpdateRecordSnafu { key })?;
        Ok(())
    }

    async fn publish(&self, key: &str, mut record: DnsRecord) -> Result<(), Error> {
        if record.metadata.add_finalizer(DNS_CLEANUP_FINALIZER) {
            record = self
                .store
                .update(&record)
                .await
                .context(UpdateRecordSnafu { key })?;
        }

        let before = record.status.clone();
        let generation = record.metadata.generation;
        let now = Timestamp::now();
        let mut first_error = None;

        let mut zones = Vec::with_capacity(self.zones.len());
        for zone in &self.zones {
            let result = self.provider.ensure(&record, zone).await;
            let previous = before
                .as_ref()
                .and_then(|status| status.zones.iter().find(|z| z.dns_zone == *zone));
            let condition = published_condition(
                previous.and_then(|z| find_condition(&z.conditions, PUBLISHED_CONDITION)),
                result.as_ref().err().map(|err| error_chain(&**err)),
                generation,
                now,
            );
            zones.push(DnsZoneStatus {
                dns_zone: zone.clone(),
                conditions: vec![condition],
            });

            if let Err(source) = result {
                tracing::warn!(key, zone = %zone.id, "failed to publish DNS record");
                first_error.get_or_insert(Error::EnsureInZone {
                    source,
                    key: key.to_owned(),
                    zone: zone.id.clone(),
                });
            }
        }

        let status = record.status.get_or_insert_with(Default::default);
        status.zones = zones;
        status.observed_generation = generation;
        if record.status != before {
            self.store
                .update_status(&record)
                .await
                .context(UpdateRecordSnafu { key })?;
        }

        first_error.map_or(Ok(()), Err)
    }
}

fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.type_ == type_)
}

/// Builds the `Published` condition, keeping the transition time if the status did not flip.
fn published_condition(
    previous: Option<&Condition>,
    error: Option<String>,
    generation: Option<i64>,
    now: Timestamp,
) -> Condition {
    let (status, reason, message) = match error {
        None => ("True", "ProviderSuccess", "records are published".to_owned()),
        Some(message) => ("False", "ProviderError", message),
    };
    let last_transition_time = match previous {
        Some(previous) if previous.status == status => previous.last_transition_time.clone(),
        _ => Time(now),
    };

    Condition {
        type_: PUBLISHED_CONDITION.to_owned(),
        status: status.to_owned(),
        reason: reason.to_owned(),
        message,
        last_transition_time,
        observed_generation: generation,
    }
}

#[async_trait]
impl Process for DnsRecordReconciler {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn process(&self, key: &str) -> Result<(), Error> {
        let object_key: ObjectKey = key.parse().context(InvalidKeySnafu)?;
        let Some(record) = self
            .store
            .get(&object_key)
            .await
            .context(GetRecordSnafu { key })?
        else {
            return Ok(());
        };

        if record.metadata.deletion_timestamp.is_some() {
            self.delete_from_zones(key, record).await
        } else {
            self.publish(key, record).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        net::{IpAddr, Ipv4Addr},
    };

    use super::*;
    use crate::{
        dns::{DnsRecordSpec, set_endpoints},
        store::set_cluster,
        testing::{FakeDnsProvider, MemoryStore},
    };

    const KEY: &str = "root:org|default/web";

    fn record() -> DnsRecord {
        let mut record = DnsRecord::new("web", DnsRecordSpec::default());
        record.metadata.namespace = Some("default".to_owned());
        set_cluster(&mut record.metadata, "root:org");
        set_endpoints(
            &mut record,
            "abc.hcpapps.net",
            &BTreeMap::from([(
                "10.0.0.1".to_owned(),
                vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))],
            )]),
        );
        record
    }

    fn fixture(
        provider: Arc<FakeDnsProvider>,
    ) -> (Arc<MemoryStore<DnsRecord>>, DnsRecordReconciler) {
        let store = Arc::new(MemoryStore::default());
        store.insert(record());
        let reconciler = DnsRecordReconciler::new(store.clone(), provider, vec![
            DnsZone {
                id: "zone-a".to_owned(),
            },
            DnsZone {
                id: "zone-b".to_owned(),
            },
        ]);
        (store, reconciler)
    }

    fn stored(store: &MemoryStore<DnsRecord>) -> DnsRecord {
        store.object(&KEY.parse().expect("key")).expect("exists")
    }

    #[tokio::test]
    async fn publishes_to_every_zone() {
        let provider = Arc::new(FakeDnsProvider::default());
        let (store, reconciler) = fixture(provider.clone());

        reconciler.process(KEY).await.expect("publishes");

        assert_eq!(provider.published("zone-a").len(), 1);
        assert_eq!(provider.published("zone-b").len(), 1);
        let record = stored(&store);
        assert!(record.metadata.has_finalizer(DNS_CLEANUP_FINALIZER));
        let status = record.status.expect("status");
        assert_eq!(status.zones.len(), 2);
        assert!(status
            .zones
            .iter()
            .all(|zone| zone.conditions[0].status == "True"));
    }

    #[tokio::test]
    async fn second_publish_does_not_rewrite_status() {
        let provider = Arc::new(FakeDnsProvider::default());
        let (store, reconciler) = fixture(provider);

        reconciler.process(KEY).await.expect("first");
        let writes = store.writes();
        reconciler.process(KEY).await.expect("second");
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn provider_failure_is_recorded_per_zone() {
        let provider = Arc::new(FakeDnsProvider::default());
        provider.fail_zone("zone-b");
        let (store, reconciler) = fixture(provider);

        let err = reconciler.process(KEY).await.expect_err("zone-b fails");
        assert!(matches!(err, Error::EnsureInZone { ref zone, .. } if zone == "zone-b"));

        let status = stored(&store).status.expect("status");
        let conditions: Vec<_> = status
            .zones
            .iter()
            .map(|zone| (zone.dns_zone.id.as_str(), zone.conditions[0].status.as_str()))
            .collect();
        assert_eq!(conditions, vec![("zone-a", "True"), ("zone-b", "False")]);
    }

    #[tokio::test]
    async fn deletion_removes_record_from_every_zone() {
        let provider = Arc::new(FakeDnsProvider::default());
        let (store, reconciler) = fixture(provider.clone());
        reconciler.process(KEY).await.expect("publishes");

        let mut record = stored(&store);
        record.metadata.deletion_timestamp = Some(Time(Timestamp::now()));
        store.insert(record);
        reconciler.process(KEY).await.expect("deletes");

        assert!(provider.published("zone-a").is_empty());
        assert!(provider.published("zone-b").is_empty());
        // Releasing the last finalizer lets the store drop the record
        assert!(store.object(&KEY.parse().expect("key")).is_none());
    }
}
