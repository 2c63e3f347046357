//! The DNS TXT oracle used to verify domain ownership.

use async_trait::async_trait;
use hickory_resolver::{
    TokioAsyncResolver,
    error::{ResolveError, ResolveErrorKind},
};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to look up TXT records of {domain:?}"))]
    TxtLookup { source: ResolveError, domain: String },
}

#[async_trait]
pub trait TxtVerifier: Send + Sync {
    /// Checks whether `domain` publishes a TXT record with exactly `value`.
    ///
    /// A domain without TXT records is not an error, it simply is not verified.
    async fn txt_record_exists(&self, domain: &str, value: &str) -> Result<bool, Error>;
}

/// Queries TXT records through a live resolver.
pub struct DnsTxtVerifier {
    resolver: TokioAsyncResolver,
}

impl DnsTxtVerifier {
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }

    pub fn new(resolver: TokioAsyncResolver) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl TxtVerifier for DnsTxtVerifier {
    async fn txt_record_exists(&self, domain: &str, value: &str) -> Result<bool, Error> {
        let lookup = match self.resolver.txt_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                return Ok(false);
            }
            Err(err) => return Err(err).context(TxtLookupSnafu { domain }),
        };

        // A single TXT record may be split into several character strings
        Ok(lookup.iter().any(|txt| {
            let joined: Vec<u8> = txt
                .txt_data()
                .iter()
                .flat_map(|part| part.iter().copied())
                .collect();
            joined == value.as_bytes()
        }))
    }
}
