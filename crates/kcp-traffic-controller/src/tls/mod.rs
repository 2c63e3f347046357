//! The certificate provider collaborator.
//!
//! Certificates are requested per traffic object under a deterministic name derived from its
//! [`TrafficKey`]. Once issued, the provider hands out the key pair as a TLS [`Secret`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use sha2::{Digest, Sha256};
use snafu::Snafu;

use crate::traffic::TrafficKey;

pub mod cert_manager;

/// Longest name a Kubernetes object may have.
const MAX_NAME_LENGTH: usize = 253;

const TLS_SECRET_SUFFIX: &str = "-tls";

/// Length of the hex key digest appended to certificate names.
const HASH_LENGTH: usize = 8;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("certificate {name:?} already exists"))]
    AlreadyExists { name: String },

    #[snafu(display("certificate {name:?} not found"))]
    NotFound { name: String },

    #[snafu(display("certificate provider request for {name:?} failed"))]
    Provider { source: BoxError, name: String },
}

impl Error {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A request for a certificate covering a single host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateRequest {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub host: String,
}

/// Issues certificates.
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    /// Fails with [`Error::AlreadyExists`] if a certificate with the same name exists.
    async fn create(&self, request: &CertificateRequest) -> Result<(), Error>;

    async fn update(&self, request: &CertificateRequest) -> Result<(), Error>;

    /// Fails with [`Error::NotFound`] if there is no such certificate.
    async fn delete(&self, request: &CertificateRequest) -> Result<(), Error>;

    /// Returns the issued key pair, [`None`] while the certificate is not ready.
    async fn get_secret(&self, request: &CertificateRequest) -> Result<Option<Secret>, Error>;

    /// Human readable issuance state, for example `"ready"` or `"pending"`.
    async fn status(&self, request: &CertificateRequest) -> Result<String, Error>;
}

/// Deterministic certificate name of a traffic object.
///
/// The readable part is not unique on its own: `-` joins the parts of the key but may also occur
/// within them. A digest of the key disambiguates. The name is a valid object name and leaves room
/// for the suffix of [`tls_secret_name`].
pub fn certificate_name(key: &TrafficKey) -> String {
    let digest = Sha256::digest(key.to_string().as_bytes());
    let hash = format!(
        "{:08x}",
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    );

    let mut readable = sanitize_name(&format!(
        "{}-{}-{}-{}",
        key.cluster, key.kind, key.namespace, key.name
    ));
    readable.truncate(MAX_NAME_LENGTH - TLS_SECRET_SUFFIX.len() - HASH_LENGTH - 1);
    match readable.trim_end_matches(['-', '.']) {
        "" => hash,
        readable => format!("{readable}-{hash}"),
    }
}

/// Name of the TLS secret copied into the traffic object's namespace.
pub fn tls_secret_name(key: &TrafficKey) -> String {
    format!("{}{TLS_SECRET_SUFFIX}", certificate_name(key))
}

fn sanitize_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '-' | '.') => c,
            _ => '-',
        })
        .collect();
    name.truncate(MAX_NAME_LENGTH);
    name.trim_matches(|c| c == '-' || c == '.').to_owned()
}
