//! The ordered reconciler pipeline run for every traffic object.
//!
//! Stages run in a fixed order: [`host`], [`certificate`], [`dns`] and, for the controller's own
//! Ingress only, [`webhook`]. A stage returning [`ReconcileStatus::Stop`] ends the run so its
//! mutation is persisted before later stages observe it. Stage errors are collected, a fatal one
//! stops the run like [`ReconcileStatus::Stop`].

use std::{fmt::Display, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::{
    admissionregistration::v1::ValidatingWebhookConfiguration, core::v1::Secret,
};
use snafu::Snafu;
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    cli::ControllerOptions,
    dns::DnsRecord,
    domain::DomainVerification,
    metrics::MetricsSink,
    net::watcher::HostWatcher,
    store::Store,
    tls::CertificateProvider,
    traffic::{Traffic, route::Route},
};

pub mod certificate;
pub mod dns;
pub mod host;
pub mod webhook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReconcileStatus {
    Continue,
    Stop,
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("host reconciler failed"))]
    Host { source: host::Error },

    #[snafu(display("certificate reconciler failed"))]
    Certificate { source: certificate::Error },

    #[snafu(display("dns reconciler failed"))]
    Dns { source: dns::Error },

    #[snafu(display("webhook reconciler failed"))]
    Webhook { source: webhook::Error },
}

impl Error {
    /// Fatal errors stop the pipeline, later stages depend on the failed one.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Webhook { .. })
    }

    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// All stage errors of one pipeline run.
#[derive(Debug)]
pub struct PipelineError {
    pub errors: Vec<Error>,
}

impl Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let messages: Vec<String> = self
            .errors
            .iter()
            .map(|err| crate::logging::controller::error_chain(err))
            .collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for PipelineError {}

/// One stage of the pipeline.
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, traffic: &mut dyn Traffic) -> Result<ReconcileStatus, Error>;
}

/// The collaborators the stages talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub verifications: Arc<dyn Store<DomainVerification>>,
    pub shadows: Arc<dyn Store<Route>>,
    pub dns_records: Arc<dyn Store<DnsRecord>>,
    pub secrets: Arc<dyn Store<Secret>>,
    pub webhook_configurations: Arc<dyn Store<ValidatingWebhookConfiguration>>,
    pub certificates: Arc<dyn CertificateProvider>,
    pub watcher: Arc<HostWatcher>,
    pub metrics: Arc<dyn MetricsSink>,
}

pub struct Pipeline {
    reconcilers: Vec<Box<dyn Reconciler>>,
}

impl Pipeline {
    pub fn new(reconcilers: Vec<Box<dyn Reconciler>>) -> Self {
        Self { reconcilers }
    }

    /// The standard pipeline. The webhook stage is only added if the controller's own Ingress
    /// is configured.
    pub fn from_options(options: &ControllerOptions, collaborators: Collaborators) -> Self {
        let mut reconcilers: Vec<Box<dyn Reconciler>> = vec![
            Box::new(host::HostReconciler::new(
                &options.managed_domain,
                options.custom_hosts_enabled,
                collaborators.verifications,
                collaborators.shadows,
                collaborators.dns_records.clone(),
            )),
            Box::new(certificate::CertificateReconciler::new(
                collaborators.certificates,
                collaborators.secrets.clone(),
            )),
            Box::new(dns::DnsReconciler::new(
                collaborators.dns_records,
                collaborators.watcher,
                collaborators.metrics,
            )),
        ];

        let webhook = &options.webhook;
        if !webhook.webhook_ingress_name.is_empty() {
            reconcilers.push(Box::new(webhook::WebhookReconciler::new(
                &webhook.webhook_ingress_namespace,
                &webhook.webhook_ingress_name,
                &webhook.webhook_configuration_name,
                collaborators.webhook_configurations,
                collaborators.secrets,
            )));
        }

        Self::new(reconcilers)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.reconcilers
            .iter()
            .map(|reconciler| reconciler.name())
            .collect()
    }

    /// Runs all stages in order until one stops.
    pub async fn run(&self, traffic: &mut dyn Traffic) -> Result<ReconcileStatus, PipelineError> {
        let mut errors = Vec::new();
        let mut status = ReconcileStatus::Continue;

        for reconciler in &self.reconcilers {
            match reconciler.reconcile(traffic).await {
                Ok(ReconcileStatus::Continue) => {}
                Ok(ReconcileStatus::Stop) => {
                    tracing::debug!(
                        reconciler = reconciler.name(),
                        "reconciler stopped the pipeline"
                    );
                    status = ReconcileStatus::Stop;
                    break;
                }
                Err(err) => {
                    let fatal = err.is_fatal();
                    tracing::debug!(
                        reconciler = reconciler.name(),
                        error.category = err.category(),
                        fatal,
                        "reconciler failed"
                    );
                    errors.push(err);
                    if fatal {
                        status = ReconcileStatus::Stop;
                        break;
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(status)
        } else {
            Err(PipelineError { errors })
        }
    }
}
