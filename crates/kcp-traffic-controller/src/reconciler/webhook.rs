//! Points the domain verification webhook at the controller's own Ingress.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::{
    ByteString,
    api::{
        admissionregistration::v1::{
            RuleWithOperations, ValidatingWebhook, ValidatingWebhookConfiguration,
            WebhookClientConfig,
        },
        core::v1::Secret,
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use snafu::{ResultExt, Snafu};

use crate::{
    reconciler::{self, ReconcileStatus, Reconciler},
    store::{self, ObjectKey, Store},
    tls::tls_secret_name,
    traffic::{Traffic, TrafficKind, meta::TrafficMetaExt},
};

/// Path the controller serves domain verification admission reviews on.
pub const WEBHOOK_PATH: &str = "/domainverifications";

const WEBHOOK_NAME: &str = "domainverifications.kuadrant.dev";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("generated host is missing"))]
    GeneratedHostMissing,

    #[snafu(display("failed to get TLS secret {key}"))]
    GetSecret {
        source: store::Error,
        key: ObjectKey,
    },

    #[snafu(display("TLS secret {key} has no certificate"))]
    MissingCertificate { key: ObjectKey },

    #[snafu(display("failed to apply validating webhook configuration {key}"))]
    ApplyConfiguration {
        source: store::Error,
        key: ObjectKey,
    },

    #[snafu(display("failed to delete validating webhook configuration {key}"))]
    DeleteConfiguration {
        source: store::Error,
        key: ObjectKey,
    },
}

/// The configuration sending domain verification writes to `https://<host>/domainverifications`.
pub fn webhook_configuration(
    name: &str,
    cluster: &str,
    host: &str,
    ca_bundle: ByteString,
) -> ValidatingWebhookConfiguration {
    let mut metadata = ObjectMeta {
        name: Some(name.to_owned()),
        ..ObjectMeta::default()
    };
    store::set_cluster(&mut metadata, cluster);

    ValidatingWebhookConfiguration {
        metadata,
        webhooks: Some(vec![ValidatingWebhook {
            name: WEBHOOK_NAME.to_owned(),
            admission_review_versions: vec!["v1".to_owned()],
            side_effects: "None".to_owned(),
            client_config: WebhookClientConfig {
                url: Some(format!("https://{host}{WEBHOOK_PATH}")),
                ca_bundle: Some(ca_bundle),
                service: None,
            },
            rules: Some(vec![RuleWithOperations {
                api_groups: Some(vec!["kuadrant.dev".to_owned()]),
                api_versions: Some(vec!["v1".to_owned()]),
                operations: Some(vec!["CREATE".to_owned(), "UPDATE".to_owned()]),
                resources: Some(vec!["domainverifications".to_owned()]),
                scope: None,
            }]),
            ..ValidatingWebhook::default()
        }]),
    }
}

pub struct WebhookReconciler {
    ingress_namespace: String,
    ingress_name: String,
    configuration_name: String,
    configurations: Arc<dyn Store<ValidatingWebhookConfiguration>>,
    secrets: Arc<dyn Store<Secret>>,
}

impl WebhookReconciler {
    pub fn new(
        ingress_namespace: &str,
        ingress_name: &str,
        configuration_name: &str,
        configurations: Arc<dyn Store<ValidatingWebhookConfiguration>>,
        secrets: Arc<dyn Store<Secret>>,
    ) -> Self {
        Self {
            ingress_namespace: ingress_namespace.to_owned(),
            ingress_name: ingress_name.to_owned(),
            configuration_name: configuration_name.to_owned(),
            configurations,
            secrets,
        }
    }

    fn applies_to(&self, traffic: &dyn Traffic) -> bool {
        let key = traffic.key();
        key.kind == TrafficKind::Ingress
            && key.namespace == self.ingress_namespace
            && key.name == self.ingress_name
    }

    async fn reconcile_webhook(&self, traffic: &dyn Traffic) -> Result<ReconcileStatus, Error> {
        if !self.applies_to(traffic) {
            return Ok(ReconcileStatus::Continue);
        }

        let cluster = store::cluster_of(traffic.meta());
        let configuration_key = ObjectKey::cluster_scoped(cluster, &self.configuration_name);
        if traffic.is_deleting() {
            store::delete_ignore_not_found(self.configurations.as_ref(), &configuration_key)
                .await
                .context(DeleteConfigurationSnafu {
                    key: configuration_key,
                })?;
            return Ok(ReconcileStatus::Continue);
        }

        let Some(host) = traffic.meta().generated_host() else {
            return GeneratedHostMissingSnafu.fail();
        };

        let secret_key = traffic
            .key()
            .object_key()
            .with_name(tls_secret_name(&traffic.certificate_owner()));
        let Some(secret) = self
            .secrets
            .get(&secret_key)
            .await
            .context(GetSecretSnafu {
                key: secret_key.clone(),
            })?
        else {
            tracing::debug!(secret = %secret_key, "webhook TLS secret does not exist yet");
            return Ok(ReconcileStatus::Continue);
        };

        let data = secret.data.unwrap_or_default();
        let Some(ca_bundle) = data.get("ca.crt").or_else(|| data.get("tls.crt")).cloned() else {
            return MissingCertificateSnafu { key: secret_key }.fail();
        };

        let desired = webhook_configuration(&self.configuration_name, cluster, host, ca_bundle);
        store::create_or_update(self.configurations.as_ref(), desired)
            .await
            .context(ApplyConfigurationSnafu {
                key: configuration_key,
            })?;
        Ok(ReconcileStatus::Continue)
    }
}

#[async_trait]
impl Reconciler for WebhookReconciler {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn reconcile(
        &self,
        traffic: &mut dyn Traffic,
    ) -> Result<ReconcileStatus, reconciler::Error> {
        self.reconcile_webhook(traffic)
            .await
            .context(reconciler::WebhookSnafu)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::networking::v1::Ingress;
    use rstest::rstest;

    use super::*;
    use crate::testing::MemoryStore;

    const GENERATED: &str = "glbc.hcpapps.net";

    struct Fixture {
        configurations: Arc<MemoryStore<ValidatingWebhookConfiguration>>,
        secrets: Arc<MemoryStore<Secret>>,
        reconciler: WebhookReconciler,
    }

    fn fixture() -> Fixture {
        let configurations = Arc::new(MemoryStore::default());
        let secrets = Arc::new(MemoryStore::default());
        let reconciler = WebhookReconciler::new(
            "kcp-glbc",
            "glbc",
            "glbc-webhook",
            configurations.clone(),
            secrets.clone(),
        );
        Fixture {
            configurations,
            secrets,
            reconciler,
        }
    }

    fn ingress(namespace: &str, name: &str) -> Ingress {
        let mut ingress = Ingress::default();
        ingress.metadata.name = Some(name.to_owned());
        ingress.metadata.namespace = Some(namespace.to_owned());
        store::set_cluster(&mut ingress.metadata, "root:glbc");
        ingress.metadata.set_generated_host(GENERATED);
        ingress
    }

    fn secret(entries: &[(&str, &str)]) -> Secret {
        let mut secret = Secret {
            data: Some(
                entries
                    .iter()
                    .map(|(key, value)| ((*key).to_owned(), ByteString(value.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Secret::default()
        };
        let owner: crate::traffic::TrafficKey =
            "Ingress|root:glbc|kcp-glbc/glbc".parse().expect("valid key");
        secret.metadata.name = Some(tls_secret_name(&owner));
        secret.metadata.namespace = Some("kcp-glbc".to_owned());
        store::set_cluster(&mut secret.metadata, "root:glbc");
        secret
    }

    fn configuration(fixture: &Fixture) -> Option<ValidatingWebhookConfiguration> {
        fixture
            .configurations
            .object(&ObjectKey::cluster_scoped("root:glbc", "glbc-webhook"))
    }

    #[rstest]
    #[case::ca_preferred(&[("tls.crt", "leaf"), ("ca.crt", "root")], "root")]
    #[case::falls_back_to_leaf(&[("tls.crt", "leaf")], "leaf")]
    #[tokio::test]
    async fn configuration_points_at_generated_host(
        #[case] entries: &[(&str, &str)],
        #[case] expected_ca: &str,
    ) {
        let fixture = fixture();
        fixture.secrets.insert(secret(entries));
        let mut ingress = ingress("kcp-glbc", "glbc");

        fixture
            .reconciler
            .reconcile(&mut ingress)
            .await
            .expect("reconciles");

        let configuration = configuration(&fixture).expect("created");
        let webhooks = configuration.webhooks.expect("webhooks");
        assert_eq!(webhooks.len(), 1);
        let webhook = &webhooks[0];
        assert_eq!(
            webhook.client_config.url.as_deref(),
            Some("https://glbc.hcpapps.net/domainverifications")
        );
        assert_eq!(
            webhook.client_config.ca_bundle,
            Some(ByteString(expected_ca.as_bytes().to_vec()))
        );
        assert_eq!(webhook.side_effects, "None");
        assert_eq!(webhook.admission_review_versions, vec!["v1"]);
        let rule = &webhook.rules.as_ref().expect("rules")[0];
        assert_eq!(
            rule.operations,
            Some(vec!["CREATE".to_owned(), "UPDATE".to_owned()])
        );

        let writes = fixture.configurations.writes();
        fixture
            .reconciler
            .reconcile(&mut ingress)
            .await
            .expect("reconciles");
        assert_eq!(fixture.configurations.writes(), writes);
    }

    #[tokio::test]
    async fn other_ingresses_are_ignored() {
        let fixture = fixture();
        fixture.secrets.insert(secret(&[("tls.crt", "leaf")]));
        let mut ingress = ingress("kcp-glbc", "other");

        fixture
            .reconciler
            .reconcile(&mut ingress)
            .await
            .expect("reconciles");
        assert!(configuration(&fixture).is_none());
    }

    #[tokio::test]
    async fn waits_for_the_tls_secret() {
        let fixture = fixture();
        let mut ingress = ingress("kcp-glbc", "glbc");

        let status = fixture
            .reconciler
            .reconcile(&mut ingress)
            .await
            .expect("reconciles");
        assert_eq!(status, ReconcileStatus::Continue);
        assert!(configuration(&fixture).is_none());
    }

    #[tokio::test]
    async fn missing_generated_host_is_an_error() {
        let fixture = fixture();
        let mut ingress = ingress("kcp-glbc", "glbc");
        ingress
            .metadata
            .remove_annotation(crate::traffic::meta::ANNOTATION_GENERATED_HOST);

        let err = fixture
            .reconciler
            .reconcile(&mut ingress)
            .await
            .expect_err("fails");
        assert!(!err.is_fatal());
    }
}
