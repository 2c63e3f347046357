//! The DNS Record resource and the synthesis of its weighted endpoints.
//!
//! Every traffic object owns one [`DnsRecord`] with the same name and namespace. Its endpoints
//! are regenerated wholesale on every reconcile from the currently reachable addresses: one
//! `A` endpoint per address, identified by the address itself, weighted so that traffic is split
//! evenly across the addresses of a target.

use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod provider;

pub const RECORD_TYPE_A: &str = "A";

/// TTL of every synthesized endpoint, in seconds.
pub const DEFAULT_RECORD_TTL: i64 = 60;

/// Provider specific property carrying the routing weight.
pub const AWS_WEIGHT_PROPERTY: &str = "aws/weight";

/// Upper bound of the routing weight, keeps the value within the provider's 0-255 range.
pub const MAX_AWS_WEIGHT: usize = 120;

/// A set of DNS resource records published to the configured zones.
#[derive(
    CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq,
)]
#[kube(
    group = "kuadrant.dev",
    version = "v1",
    kind = "DNSRecord",
    root = "DnsRecord",
    plural = "dnsrecords",
    namespaced,
    status = "DnsRecordStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecordSpec {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// A single DNS resource record.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub dns_name: String,

    #[serde(default)]
    pub targets: Vec<String>,

    pub record_type: String,

    /// Distinguishes endpoints sharing the same name and type.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub set_identifier: String,

    #[serde(rename = "recordTTL", default)]
    pub record_ttl: i64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provider_specific: Vec<ProviderSpecificProperty>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct ProviderSpecificProperty {
    pub name: String,
    pub value: String,
}

impl Endpoint {
    pub fn provider_specific(&self, name: &str) -> Option<&str> {
        self.provider_specific
            .iter()
            .find(|property| property.name == name)
            .map(|property| property.value.as_str())
    }

    /// Sets a provider specific property, replacing an existing value.
    pub fn set_provider_specific(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .provider_specific
            .iter_mut()
            .find(|property| property.name == name)
        {
            Some(property) => property.value = value,
            None => self.provider_specific.push(ProviderSpecificProperty {
                name: name.to_owned(),
                value,
            }),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecordStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Publication state per zone.
    #[serde(default)]
    pub zones: Vec<DnsZoneStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DnsZoneStatus {
    pub dns_zone: DnsZone,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A hosted zone of the DNS provider.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct DnsZone {
    pub id: String,
}

/// Routing weight of each address of a target with `num_targets` addresses.
///
/// The weight is `120 / n`, with `n` capped at 120, so it never drops below 1.
pub fn aws_endpoint_weight(num_targets: usize) -> usize {
    let n = num_targets.clamp(1, MAX_AWS_WEIGHT);
    MAX_AWS_WEIGHT / n
}

/// Replaces the endpoints of `record` with one endpoint per reachable address.
///
/// `groups` maps each discovered target (an IP or a load balancer host name) to the addresses it
/// currently resolves to. Existing endpoints are reused by set identifier so labels and
/// properties set by others survive, stale endpoints are dropped. The result is ordered by
/// address. An address reachable through several targets is published once.
pub fn set_endpoints(
    record: &mut DnsRecord,
    dns_name: &str,
    groups: &BTreeMap<String, Vec<IpAddr>>,
) {
    let mut existing: HashMap<String, Endpoint> = std::mem::take(&mut record.spec.endpoints)
        .into_iter()
        .map(|endpoint| (endpoint.set_identifier.clone(), endpoint))
        .collect();

    let mut endpoints: BTreeMap<IpAddr, Endpoint> = BTreeMap::new();
    for addresses in groups.values() {
        let weight = aws_endpoint_weight(addresses.len());
        for address in addresses {
            if endpoints.contains_key(address) {
                continue;
            }

            let set_identifier = address.to_string();
            let mut endpoint = existing.remove(&set_identifier).unwrap_or_default();
            endpoint.dns_name = dns_name.to_owned();
            endpoint.record_type = RECORD_TYPE_A.to_owned();
            endpoint.targets = vec![set_identifier.clone()];
            endpoint.set_identifier = set_identifier;
            endpoint.record_ttl = DEFAULT_RECORD_TTL;
            endpoint.set_provider_specific(AWS_WEIGHT_PROPERTY, weight.to_string());
            endpoints.insert(*address, endpoint);
        }
    }

    record.spec.endpoints = endpoints.into_values().collect();
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use rstest::rstest;

    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[rstest]
    #[case(1, 120)]
    #[case(2, 60)]
    #[case(3, 40)]
    #[case(4, 30)]
    #[case(7, 17)]
    #[case(60, 2)]
    #[case(61, 1)]
    #[case(120, 1)]
    #[case(121, 1)]
    fn endpoint_weight_splits_evenly(#[case] num_targets: usize, #[case] expected: usize) {
        assert_eq!(aws_endpoint_weight(num_targets), expected);
    }

    #[test]
    fn endpoint_weight_is_non_increasing() {
        let weights: Vec<_> = (1..=200).map(aws_endpoint_weight).collect();
        assert!(weights.windows(2).all(|pair| pair[0] >= pair[1]));
    }

    #[test]
    fn two_addresses_of_one_target_get_half_the_weight() {
        let mut record = DnsRecord::new("web", DnsRecordSpec::default());
        let groups = BTreeMap::from([("lb.example.com".to_owned(), vec![ip(2), ip(1)])]);

        set_endpoints(&mut record, "abc.hcpapps.net", &groups);

        let endpoints = &record.spec.endpoints;
        assert_eq!(endpoints.len(), 2);
        for (endpoint, expected_ip) in endpoints.iter().zip(["10.0.0.1", "10.0.0.2"]) {
            assert_eq!(endpoint.dns_name, "abc.hcpapps.net");
            assert_eq!(endpoint.record_type, "A");
            assert_eq!(endpoint.record_ttl, 60);
            assert_eq!(endpoint.targets, vec![expected_ip]);
            assert_eq!(endpoint.set_identifier, expected_ip);
            assert_eq!(endpoint.provider_specific(AWS_WEIGHT_PROPERTY), Some("60"));
        }
    }

    #[test]
    fn stale_endpoints_are_dropped_and_existing_ones_reused() {
        let mut record = DnsRecord::new("web", DnsRecordSpec::default());
        set_endpoints(
            &mut record,
            "abc.hcpapps.net",
            &BTreeMap::from([("10.0.0.1".to_owned(), vec![ip(1)])]),
        );
        record.spec.endpoints[0]
            .labels
            .insert("owner".to_owned(), "someone".to_owned());

        set_endpoints(
            &mut record,
            "abc.hcpapps.net",
            &BTreeMap::from([
                ("10.0.0.1".to_owned(), vec![ip(1)]),
                ("10.0.0.3".to_owned(), vec![ip(3)]),
            ]),
        );
        assert_eq!(record.spec.endpoints.len(), 2);
        assert_eq!(record.spec.endpoints[0].labels["owner"], "someone");

        set_endpoints(
            &mut record,
            "abc.hcpapps.net",
            &BTreeMap::from([("10.0.0.3".to_owned(), vec![ip(3)])]),
        );
        assert_eq!(record.spec.endpoints.len(), 1);
        assert_eq!(record.spec.endpoints[0].set_identifier, "10.0.0.3");
        assert_eq!(
            record.spec.endpoints[0].provider_specific(AWS_WEIGHT_PROPERTY),
            Some("120")
        );
    }

    #[test]
    fn synthesis_is_deterministic() {
        let groups = BTreeMap::from([
            ("lb-b.example.com".to_owned(), vec![ip(4), ip(3)]),
            ("lb-a.example.com".to_owned(), vec![ip(1)]),
        ]);
        let mut first = DnsRecord::new("web", DnsRecordSpec::default());
        set_endpoints(&mut first, "abc.hcpapps.net", &groups);
        let mut second = first.clone();
        set_endpoints(&mut second, "abc.hcpapps.net", &groups);

        assert_eq!(first, second);
        let identifiers: Vec<_> = first
            .spec
            .endpoints
            .iter()
            .map(|endpoint| endpoint.set_identifier.as_str())
            .collect();
        assert_eq!(identifiers, vec!["10.0.0.1", "10.0.0.3", "10.0.0.4"]);
    }
}
