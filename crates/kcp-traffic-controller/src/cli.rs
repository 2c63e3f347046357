//! Command line and environment options of the traffic controller.
//!
//! Every option can also be provided through an environment variable, e.g. `--managed-domain`
//! through `MANAGED_DOMAIN`.
//!
//! ```rust
//! use clap::Parser;
//! use kcp_traffic_controller::cli::ControllerOptions;
//!
//! let opts = ControllerOptions::parse_from([
//!     "kcp-traffic-controller",
//!     "--managed-domain",
//!     "hcpapps.net",
//!     "--custom-hosts-enabled",
//! ]);
//! assert!(opts.custom_hosts_enabled);
//! ```

use std::time::Duration;

use clap::{Args, Parser};

use crate::validation::DomainName;

pub const DEFAULT_MANAGED_DOMAIN: &str = "hcpapps.net";

/// Options for the traffic reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct ControllerOptions {
    /// The domain generated hosts are created under, e.g. `<random-id>.hcpapps.net`.
    #[arg(long, env, default_value = DEFAULT_MANAGED_DOMAIN)]
    pub managed_domain: DomainName,

    /// Allow traffic objects to use verified custom domains next to the generated host.
    ///
    /// When disabled, every declared host is replaced with the generated host.
    #[arg(long, env)]
    pub custom_hosts_enabled: bool,

    /// Number of concurrent workers per controller.
    #[arg(long, env, default_value_t = 2)]
    pub workers: usize,

    /// How often a failing key is retried before it is dropped.
    #[arg(long, env, default_value_t = 5)]
    pub max_retries: u32,

    /// Initial delay of the exponential per-key retry backoff.
    #[arg(long, env, default_value = "5ms", value_parser = humantime::parse_duration)]
    pub retry_base_delay: Duration,

    /// Upper bound of the exponential per-key retry backoff.
    #[arg(long, env, default_value = "1000s", value_parser = humantime::parse_duration)]
    pub retry_max_delay: Duration,

    /// Delay before a traffic object is looked at again when one of its backend hostnames does
    /// not resolve yet.
    #[arg(long, env, default_value = "30s", value_parser = humantime::parse_duration)]
    pub dns_retry_interval: Duration,

    /// Interval between two TXT record checks of an unverified domain.
    #[arg(long, env, default_value = "60s", value_parser = humantime::parse_duration)]
    pub domain_verification_interval: Duration,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub certificates: CertificateOptions,

    #[command(flatten)]
    pub webhook: WebhookOptions,
}

/// Options for the certificate provider.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
#[command(next_help_heading = "Certificate Options")]
pub struct CertificateOptions {
    /// Issuer used for all certificates requested for generated hosts.
    #[arg(long, env, default_value = "glbc-ca")]
    pub certificate_issuer: String,

    /// Namespace certificates and their secrets are created in by the certificate provider.
    #[arg(long, env, default_value = "kcp-glbc")]
    pub certificate_namespace: String,
}

/// Options describing the controller's own API endpoint, which receives a validating webhook.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
#[command(next_help_heading = "Webhook Options")]
pub struct WebhookOptions {
    /// Namespace of the ingress exposing the controller's own webhook endpoint.
    #[arg(long, env, default_value = "kcp-glbc")]
    pub webhook_ingress_namespace: String,

    /// Name of the ingress exposing the controller's own webhook endpoint.
    ///
    /// Leave empty to disable webhook configuration management.
    #[arg(long, env, default_value = "")]
    pub webhook_ingress_name: String,

    /// Name of the validating webhook configuration maintained for the webhook endpoint.
    #[arg(long, env, default_value = "kcp-glbc")]
    pub webhook_configuration_name: String,
}

// Mirrors the clap defaults without looking at the environment
impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            managed_domain: DomainName::from_static(DEFAULT_MANAGED_DOMAIN),
            custom_hosts_enabled: false,
            workers: 2,
            max_retries: 5,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_secs(1000),
            dns_retry_interval: Duration::from_secs(30),
            domain_verification_interval: Duration::from_secs(60),
            certificates: CertificateOptions {
                certificate_issuer: "glbc-ca".to_owned(),
                certificate_namespace: "kcp-glbc".to_owned(),
            },
            webhook: WebhookOptions {
                webhook_ingress_namespace: "kcp-glbc".to_owned(),
                webhook_ingress_name: String::new(),
                webhook_configuration_name: "kcp-glbc".to_owned(),
            },
        }
    }
}
