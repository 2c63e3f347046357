//! Custom domain ownership.
//!
//! A [`DomainVerification`] proves that the owner of a logical cluster controls a domain: the
//! controller issues a token, the owner publishes it as a TXT record and the
//! [`controller`] flips `status.verified` once the record is visible. Traffic objects may only
//! serve custom hosts below a verified domain, see [`is_domain_verified`].

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod controller;
pub mod oracle;

/// Prefix of the TXT record that carries the verification token.
pub const VERIFICATION_RECORD_PREFIX: &str = "_kuadrant-verification";

/// Proof of ownership of a custom domain.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "kuadrant.dev",
    version = "v1",
    kind = "DomainVerification",
    plural = "domainverifications",
    status = "DomainVerificationStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct DomainVerificationSpec {
    /// The domain, including all its subdomains, to verify.
    pub domain: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainVerificationStatus {
    /// Value the TXT record has to carry.
    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub verified: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_check: Option<Time>,

    /// Human readable outcome of the last check.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl DomainVerification {
    pub fn is_verified(&self) -> bool {
        self.status.as_ref().is_some_and(|status| status.verified)
    }

    /// Name of the TXT record the token is expected in.
    pub fn txt_record_name(&self) -> String {
        format!("{VERIFICATION_RECORD_PREFIX}.{}", self.spec.domain)
    }
}

/// Checks whether `host` or any of its parent domains is verified.
///
/// `sub.example.com` is authorized by a verified `sub.example.com` or `example.com`. A bare
/// top level label (no dot) never matches.
pub fn is_domain_verified(host: &str, verifications: &[DomainVerification]) -> bool {
    let mut candidate = host;
    while candidate.contains('.') {
        if verifications
            .iter()
            .any(|dv| dv.spec.domain == candidate && dv.is_verified())
        {
            return true;
        }
        candidate = match candidate.split_once('.') {
            Some((_, parent)) => parent,
            None => break,
        };
    }
    false
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn verification(domain: &str, verified: bool) -> DomainVerification {
        let mut dv = DomainVerification::new(domain, DomainVerificationSpec {
            domain: domain.to_owned(),
        });
        dv.status = Some(DomainVerificationStatus {
            verified,
            ..DomainVerificationStatus::default()
        });
        dv
    }

    #[rstest]
    #[case::exact("pb-custom.hcpapps.net", true)]
    #[case::climbs_two_labels("sub.test.pb-custom.hcpapps.net", true)]
    #[case::unrelated("other.net", false)]
    #[case::parent_of_verified("hcpapps.net", false)]
    #[case::suffix_without_dot_boundary("xpb-custom.hcpapps.net", false)]
    #[case::empty("", false)]
    fn climbs_to_verified_parent(#[case] host: &str, #[case] expected: bool) {
        let verifications = vec![
            verification("pb-custom.hcpapps.net", true),
            verification("unverified.net", false),
        ];
        assert_eq!(is_domain_verified(host, &verifications), expected);
    }

    #[test]
    fn unverified_record_does_not_authorize() {
        let verifications = vec![verification("api.example.com", false)];
        assert!(!is_domain_verified("api.example.com", &verifications));
    }

    #[test]
    fn missing_status_is_unverified() {
        let dv = DomainVerification::new("example.com", DomainVerificationSpec {
            domain: "example.com".to_owned(),
        });
        assert!(!is_domain_verified("example.com", &[dv]));
    }

    #[test]
    fn txt_record_name_is_prefixed() {
        assert_eq!(
            verification("example.com", false).txt_record_name(),
            "_kuadrant-verification.example.com"
        );
    }
}
