//! [`Traffic`] for `networking.k8s.io/v1` Ingresses.
//!
//! An Ingress holds a list of host rules, so a custom host and the generated host can be served
//! side by side: every active rule gets a copy pointing at the generated host.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        core::v1::Secret,
        networking::v1::{
            Ingress, IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressRule,
            IngressStatus, IngressTLS,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use snafu::ResultExt;

use crate::{
    domain::{DomainVerification, is_domain_verified},
    store::{self, Store},
    traffic::{
        Error, ParseAnnotationSnafu, SerializeAnnotationSnafu, Traffic, TrafficKind,
        meta::{
            ANNOTATION_PENDING_CUSTOM_HOSTS, PendingRules, REMOTE_STATUS_ANNOTATION_PREFIX,
            TrafficMetaExt,
        },
        route::Route,
    },
};

fn rule_host(rule: &IngressRule) -> &str {
    rule.host.as_deref().unwrap_or_default()
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

/// Adds the hosts of `entry` to the entry of the same secret, or appends it.
fn merge_tls(tls: &mut Vec<IngressTLS>, entry: IngressTLS) {
    match tls
        .iter_mut()
        .find(|existing| existing.secret_name == entry.secret_name)
    {
        Some(existing) => {
            let hosts = existing.hosts.get_or_insert_with(Vec::new);
            for host in entry.hosts.into_iter().flatten() {
                push_unique(hosts, host);
            }
        }
        None => tls.push(entry),
    }
}

/// Splits `entries` into the parts covering `hosts` and the parts covering all other hosts.
fn split_tls(entries: Vec<IngressTLS>, hosts: &[String]) -> (Vec<IngressTLS>, Vec<IngressTLS>) {
    let mut matching = Vec::new();
    let mut other = Vec::new();
    for entry in entries {
        let (matched, rest): (Vec<String>, Vec<String>) = entry
            .hosts
            .into_iter()
            .flatten()
            .partition(|host| hosts.contains(host));
        if !matched.is_empty() {
            matching.push(IngressTLS {
                hosts: Some(matched),
                secret_name: entry.secret_name.clone(),
            });
        }
        if !rest.is_empty() {
            other.push(IngressTLS {
                hosts: Some(rest),
                secret_name: entry.secret_name,
            });
        }
    }
    (matching, other)
}

fn load_balancer_hosts(status: Option<&IngressStatus>) -> Vec<String> {
    status
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|load_balancer| load_balancer.ingress.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|ingress| ingress.ip.clone().or_else(|| ingress.hostname.clone()))
        .filter(|address| !address.is_empty())
        .collect()
}

#[async_trait]
impl Traffic for Ingress {
    fn kind(&self) -> TrafficKind {
        TrafficKind::Ingress
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn hosts(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        for rule in self.spec.iter().flat_map(|spec| spec.rules.iter().flatten()) {
            let host = rule_host(rule);
            if !host.is_empty() {
                push_unique(&mut hosts, host.to_owned());
            }
        }
        hosts
    }

    fn add_tls(&mut self, host: &str, secret: &Secret) {
        let tls = self
            .spec
            .get_or_insert_with(Default::default)
            .tls
            .get_or_insert_with(Vec::new);
        merge_tls(tls, IngressTLS {
            hosts: Some(vec![host.to_owned()]),
            secret_name: secret.metadata.name.clone(),
        });
    }

    fn remove_tls(&mut self, hosts: &[String]) {
        let Some(tls) = self.spec.as_mut().and_then(|spec| spec.tls.as_mut()) else {
            return;
        };
        for entry in tls.iter_mut() {
            if let Some(entry_hosts) = entry.hosts.as_mut() {
                entry_hosts.retain(|host| !hosts.contains(host));
            }
        }
        tls.retain(|entry| entry.hosts.as_ref().is_some_and(|hosts| !hosts.is_empty()));
    }

    fn replace_custom_hosts(&mut self, managed_host: &str) -> Vec<String> {
        let Some(rules) = self.spec.as_mut().and_then(|spec| spec.rules.as_mut()) else {
            return Vec::new();
        };

        let mut replaced = Vec::new();
        let mut kept = Vec::with_capacity(rules.len());
        for mut rule in rules.drain(..) {
            let host = rule_host(&rule);
            if !host.is_empty() && host != managed_host {
                push_unique(&mut replaced, host.to_owned());
                rule.host = Some(managed_host.to_owned());
            }
            push_unique(&mut kept, rule);
        }
        *rules = kept;

        self.remove_tls(&replaced);
        replaced
    }

    async fn process_custom_hosts(
        &mut self,
        verifications: &[DomainVerification],
        _shadows: &dyn Store<Route>,
    ) -> Result<(), Error> {
        let Some(generated_host) = self.metadata.generated_host().map(str::to_owned) else {
            return Ok(());
        };

        let pending: PendingRules<IngressRule, IngressTLS> =
            self.metadata
                .pending_rules()
                .context(ParseAnnotationSnafu {
                    annotation: ANNOTATION_PENDING_CUSTOM_HOSTS,
                })?;
        let current = self
            .spec
            .as_ref()
            .and_then(|spec| spec.rules.clone())
            .unwrap_or_default();

        // Custom rules are rebuilt from the declared rules and every previously parked rule
        let mut custom = Vec::new();
        for rule in current
            .iter()
            .filter(|rule| rule_host(rule) != generated_host)
            .cloned()
            .chain(pending.rules)
        {
            push_unique(&mut custom, rule);
        }

        let mut rules = Vec::new();
        let mut unverified = Vec::new();
        if custom.is_empty() {
            rules = current;
        }
        for rule in custom {
            let host = rule_host(&rule);
            let mut generated_rule = rule.clone();
            generated_rule.host = Some(generated_host.clone());

            if host.is_empty() || is_domain_verified(host, verifications) {
                push_unique(&mut rules, rule);
            } else {
                unverified.push(rule);
            }
            push_unique(&mut rules, generated_rule);
        }

        // TLS entries of parked hosts are parked with them and come back once they are verified
        let pending_hosts: Vec<String> = unverified
            .iter()
            .map(|rule| rule_host(rule).to_owned())
            .collect();
        let declared_tls = self
            .spec
            .as_ref()
            .and_then(|spec| spec.tls.clone())
            .unwrap_or_default();
        let (parking, _) = split_tls(declared_tls, &pending_hosts);
        let (mut parked_tls, restored_tls) = split_tls(pending.tls, &pending_hosts);
        for entry in parking {
            merge_tls(&mut parked_tls, entry);
        }

        self.metadata
            .set_pending_rules(&PendingRules {
                rules: unverified,
                tls: parked_tls,
            })
            .context(SerializeAnnotationSnafu {
                annotation: ANNOTATION_PENDING_CUSTOM_HOSTS,
            })?;
        self.spec.get_or_insert_with(Default::default).rules = Some(rules);
        self.remove_tls(&pending_hosts);
        if !restored_tls.is_empty() {
            let tls = self
                .spec
                .get_or_insert_with(Default::default)
                .tls
                .get_or_insert_with(Vec::new);
            for entry in restored_tls {
                merge_tls(tls, entry);
            }
        }
        Ok(())
    }

    // Both hosts are served by the Ingress itself
    async fn remove_shadow(&mut self, _shadows: &dyn Store<Route>) -> Result<(), Error> {
        Ok(())
    }

    fn load_balancer_addresses(&self) -> Result<BTreeMap<String, Vec<String>>, Error> {
        if !self.tmc_enabled() {
            let cluster = store::cluster_of(&self.metadata).to_owned();
            return Ok(BTreeMap::from([(
                cluster,
                load_balancer_hosts(self.status.as_ref()),
            )]));
        }

        let statuses = self
            .metadata
            .remote_statuses::<IngressStatus>()
            .map_err(|(annotation, source)| Error::ParseAnnotation { source, annotation })?;
        Ok(statuses
            .into_iter()
            .map(|(sync_target, status)| (sync_target, load_balancer_hosts(Some(&status))))
            .collect())
    }

    fn set_dns_lb_host(&mut self, host: &str) {
        self.status = Some(IngressStatus {
            load_balancer: Some(IngressLoadBalancerStatus {
                ingress: Some(vec![IngressLoadBalancerIngress {
                    hostname: Some(host.to_owned()),
                    ..IngressLoadBalancerIngress::default()
                }]),
            }),
        });
    }
}

/// The JSON remote status annotation of an Ingress load balanced through `hostname`.
#[cfg(any(test, feature = "test-utils"))]
pub fn remote_status_annotation(sync_target: &str, hostname: &str) -> (String, String) {
    let status = IngressStatus {
        load_balancer: Some(IngressLoadBalancerStatus {
            ingress: Some(vec![IngressLoadBalancerIngress {
                hostname: Some(hostname.to_owned()),
                ..IngressLoadBalancerIngress::default()
            }]),
        }),
    };
    (
        format!("{REMOTE_STATUS_ANNOTATION_PREFIX}{sync_target}"),
        serde_json::to_string(&status).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressServiceBackend, IngressSpec,
        ServiceBackendPort,
    };

    use super::*;
    use crate::{
        domain::{DomainVerificationSpec, DomainVerificationStatus},
        testing::MemoryStore,
        traffic::meta::LABEL_HAS_PENDING_HOSTS,
    };

    const GENERATED: &str = "abc.hcpapps.net";

    fn http() -> HTTPIngressRuleValue {
        HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_owned()),
                path_type: "Prefix".to_owned(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: "web".to_owned(),
                        port: Some(ServiceBackendPort {
                            number: Some(8080),
                            ..ServiceBackendPort::default()
                        }),
                    }),
                    ..IngressBackend::default()
                },
            }],
        }
    }

    fn rule(host: &str) -> IngressRule {
        IngressRule {
            host: Some(host.to_owned()),
            http: Some(http()),
        }
    }

    fn ingress(hosts: &[&str]) -> Ingress {
        let mut ingress = Ingress {
            spec: Some(IngressSpec {
                rules: Some(hosts.iter().map(|host| rule(host)).collect()),
                ..IngressSpec::default()
            }),
            ..Ingress::default()
        };
        ingress.metadata.name = Some("web".to_owned());
        ingress.metadata.namespace = Some("default".to_owned());
        store::set_cluster(&mut ingress.metadata, "root:org");
        ingress.metadata.set_generated_host(GENERATED);
        ingress
    }

    fn verification(domain: &str, verified: bool) -> DomainVerification {
        let mut verification = DomainVerification::new(domain, DomainVerificationSpec {
            domain: domain.to_owned(),
        });
        verification.status = Some(DomainVerificationStatus {
            verified,
            ..DomainVerificationStatus::default()
        });
        verification
    }

    fn secret(name: &str) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some(name.to_owned());
        secret
    }

    fn pending(ingress: &Ingress) -> PendingRules<IngressRule, IngressTLS> {
        ingress.metadata.pending_rules().expect("pending")
    }

    fn tls(ingress: &Ingress) -> Option<Vec<IngressTLS>> {
        ingress.spec.as_ref().and_then(|spec| spec.tls.clone())
    }

    #[tokio::test]
    async fn unverified_hosts_become_pending_and_return_once_verified() {
        let shadows = MemoryStore::<Route>::default();
        let mut ingress = ingress(&["api.example.com"]);
        ingress.add_tls("api.example.com", &secret("custom-tls"));

        ingress
            .process_custom_hosts(&[verification("api.example.com", false)], &shadows)
            .await
            .expect("processed");

        assert_eq!(ingress.hosts(), vec![GENERATED]);
        assert_eq!(ingress.metadata.label(LABEL_HAS_PENDING_HOSTS), Some("true"));
        assert_eq!(pending(&ingress), PendingRules {
            rules: vec![rule("api.example.com")],
            tls: vec![IngressTLS {
                hosts: Some(vec!["api.example.com".to_owned()]),
                secret_name: Some("custom-tls".to_owned()),
            }],
        });
        assert_eq!(tls(&ingress), Some(Vec::new()));

        // Parked TLS stays parked while the domain is unverified
        let parked = ingress.clone();
        ingress
            .process_custom_hosts(&[verification("api.example.com", false)], &shadows)
            .await
            .expect("processed");
        assert_eq!(ingress, parked);

        ingress
            .process_custom_hosts(&[verification("example.com", true)], &shadows)
            .await
            .expect("processed");

        assert_eq!(ingress.hosts(), vec!["api.example.com", GENERATED]);
        assert_eq!(ingress.metadata.label(LABEL_HAS_PENDING_HOSTS), None);
        assert_eq!(ingress.metadata.annotation(ANNOTATION_PENDING_CUSTOM_HOSTS), None);
        assert_eq!(
            tls(&ingress),
            Some(vec![IngressTLS {
                hosts: Some(vec!["api.example.com".to_owned()]),
                secret_name: Some("custom-tls".to_owned()),
            }])
        );
    }

    #[tokio::test]
    async fn only_the_tls_hosts_of_parked_rules_are_parked() {
        let shadows = MemoryStore::<Route>::default();
        let mut ingress = ingress(&["api.example.com", "shop.example.net"]);
        ingress.add_tls("api.example.com", &secret("custom-tls"));
        ingress.add_tls("shop.example.net", &secret("custom-tls"));
        ingress.add_tls(GENERATED, &secret("generated-tls"));

        ingress
            .process_custom_hosts(&[verification("example.com", true)], &shadows)
            .await
            .expect("processed");

        assert_eq!(
            tls(&ingress),
            Some(vec![
                IngressTLS {
                    hosts: Some(vec!["api.example.com".to_owned()]),
                    secret_name: Some("custom-tls".to_owned()),
                },
                IngressTLS {
                    hosts: Some(vec![GENERATED.to_owned()]),
                    secret_name: Some("generated-tls".to_owned()),
                },
            ])
        );
        assert_eq!(pending(&ingress).tls, vec![IngressTLS {
            hosts: Some(vec!["shop.example.net".to_owned()]),
            secret_name: Some("custom-tls".to_owned()),
        }]);

        ingress
            .process_custom_hosts(
                &[
                    verification("example.com", true),
                    verification("example.net", true),
                ],
                &shadows,
            )
            .await
            .expect("processed");

        assert_eq!(
            tls(&ingress),
            Some(vec![
                IngressTLS {
                    hosts: Some(vec![
                        "api.example.com".to_owned(),
                        "shop.example.net".to_owned()
                    ]),
                    secret_name: Some("custom-tls".to_owned()),
                },
                IngressTLS {
                    hosts: Some(vec![GENERATED.to_owned()]),
                    secret_name: Some("generated-tls".to_owned()),
                },
            ])
        );
        assert_eq!(ingress.metadata.annotation(ANNOTATION_PENDING_CUSTOM_HOSTS), None);
    }

    #[tokio::test]
    async fn processing_is_idempotent() {
        let shadows = MemoryStore::<Route>::default();
        let verifications = [verification("example.com", true)];
        let mut ingress = ingress(&["api.example.com", "other.net"]);

        ingress
            .process_custom_hosts(&verifications, &shadows)
            .await
            .expect("processed");
        let first = ingress.clone();
        ingress
            .process_custom_hosts(&verifications, &shadows)
            .await
            .expect("processed");

        assert_eq!(ingress, first);
        assert_eq!(ingress.hosts(), vec!["api.example.com", GENERATED]);
        assert_eq!(pending(&ingress).rules, vec![rule("other.net")]);
    }

    #[tokio::test]
    async fn generated_host_only_is_left_alone() {
        let shadows = MemoryStore::<Route>::default();
        let mut ingress = ingress(&[GENERATED]);
        let before = ingress.clone();

        ingress
            .process_custom_hosts(&[], &shadows)
            .await
            .expect("processed");
        assert_eq!(ingress, before);
    }

    #[test]
    fn replace_custom_hosts_keeps_only_the_managed_host() {
        let mut ingress = ingress(&["api.example.com", GENERATED, "www.example.com"]);
        ingress.add_tls("api.example.com", &secret("custom-tls"));
        ingress.add_tls(GENERATED, &secret("generated-tls"));

        let replaced = ingress.replace_custom_hosts(GENERATED);

        assert_eq!(replaced, vec!["api.example.com", "www.example.com"]);
        assert_eq!(ingress.hosts(), vec![GENERATED]);
        assert_eq!(
            ingress
                .spec
                .as_ref()
                .and_then(|spec| spec.rules.as_ref())
                .map(Vec::len),
            Some(1)
        );
        assert_eq!(
            ingress.spec.and_then(|spec| spec.tls),
            Some(vec![IngressTLS {
                hosts: Some(vec![GENERATED.to_owned()]),
                secret_name: Some("generated-tls".to_owned()),
            }])
        );
    }

    #[test]
    fn add_tls_reuses_entry_of_the_same_secret() {
        let mut ingress = ingress(&[GENERATED]);
        ingress.add_tls(GENERATED, &secret("generated-tls"));
        ingress.add_tls(GENERATED, &secret("generated-tls"));
        ingress.add_tls("api.example.com", &secret("generated-tls"));

        assert_eq!(
            ingress.spec.and_then(|spec| spec.tls),
            Some(vec![IngressTLS {
                hosts: Some(vec![GENERATED.to_owned(), "api.example.com".to_owned()]),
                secret_name: Some("generated-tls".to_owned()),
            }])
        );
    }

    #[test]
    fn load_balancer_addresses_from_native_status() {
        let mut ingress = ingress(&[GENERATED]);
        ingress.status = Some(IngressStatus {
            load_balancer: Some(IngressLoadBalancerStatus {
                ingress: Some(vec![
                    IngressLoadBalancerIngress {
                        ip: Some("10.0.0.1".to_owned()),
                        ..IngressLoadBalancerIngress::default()
                    },
                    IngressLoadBalancerIngress {
                        hostname: Some("lb.example.com".to_owned()),
                        ..IngressLoadBalancerIngress::default()
                    },
                ]),
            }),
        });

        assert!(!ingress.tmc_enabled());
        assert_eq!(
            ingress.load_balancer_addresses().expect("addresses"),
            BTreeMap::from([(
                "root:org".to_owned(),
                vec!["10.0.0.1".to_owned(), "lb.example.com".to_owned()]
            )])
        );
    }

    #[test]
    fn load_balancer_addresses_from_remote_status() {
        let mut ingress = ingress(&[GENERATED]);
        let (key, value) = remote_status_annotation("us-east", "lb.us-east.example.com");
        ingress.metadata.set_annotation(&key, value);
        ingress.set_dns_lb_host(GENERATED);

        assert!(ingress.tmc_enabled());
        assert_eq!(
            ingress.load_balancer_addresses().expect("addresses"),
            BTreeMap::from([(
                "us-east".to_owned(),
                vec!["lb.us-east.example.com".to_owned()]
            )])
        );
    }
}
