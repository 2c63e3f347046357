//! Checks the TXT records backing [`DomainVerification`]s.
//!
//! Each verification gets a random token on first sight. Afterwards the TXT record
//! `_kuadrant-verification.<domain>` is queried once `status.nextCheck` has passed, and the key is
//! scheduled for the next check. Verified domains are final and no longer checked.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::Time,
    jiff::{SignedDuration, Timestamp},
};
use rand::{Rng, distr::Alphanumeric};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    domain::{
        DomainVerification, DomainVerificationStatus,
        oracle::{self, TxtVerifier},
    },
    logging::controller::ReconcilerError,
    store::{self, ObjectKey, Store},
    workqueue::{Process, WorkQueue},
};

pub const CONTROLLER_NAME: &str = "domain-verification";

const TOKEN_LENGTH: usize = 32;

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("invalid work queue key"))]
    InvalidKey { source: store::Error },

    #[snafu(display("failed to get domain verification {key}"))]
    GetVerification { source: store::Error, key: String },

    #[snafu(display("failed to update the status of domain verification {key}"))]
    UpdateVerification { source: store::Error, key: String },

    #[snafu(display("failed to check the TXT record of domain verification {key}"))]
    CheckTxtRecord { source: oracle::Error, key: String },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// Called with the logical cluster of a verification that became verified.
pub type OnVerified = Arc<dyn Fn(&str) + Send + Sync>;

pub struct DomainVerificationReconciler {
    store: Arc<dyn Store<DomainVerification>>,
    verifier: Arc<dyn TxtVerifier>,
    queue: Arc<WorkQueue>,
    check_interval: Duration,
    on_verified: Option<OnVerified>,
}

impl DomainVerificationReconciler {
    pub fn new(
        store: Arc<dyn Store<DomainVerification>>,
        verifier: Arc<dyn TxtVerifier>,
        queue: Arc<WorkQueue>,
        check_interval: Duration,
    ) -> Self {
        Self {
            store,
            verifier,
            queue,
            check_interval,
            on_verified: None,
        }
    }

    /// Registers a callback fired when a domain becomes verified, usually
    /// [`TrafficController::enqueue_pending_hosts`](crate::controller::TrafficController::enqueue_pending_hosts).
    pub fn on_verified(mut self, callback: OnVerified) -> Self {
        self.on_verified = Some(callback);
        self
    }

    /// Advances `dv` to `now`, returns when it should be looked at again.
    async fn check(
        &self,
        dv: &mut DomainVerification,
        now: Timestamp,
    ) -> Result<Option<Duration>, oracle::Error> {
        let record_name = dv.txt_record_name();
        let status = dv.status.get_or_insert_with(Default::default);

        if status.token.is_empty() {
            status.token = generate_token();
            status.message = format!("publish a TXT record {record_name} with the token");
        }

        if status.verified {
            return Ok(None);
        }

        if let Some(next_check) = &status.next_check
            && next_check.0 > now
        {
            return Ok(Some(duration_between(now, next_check.0)));
        }

        let found = self
            .verifier
            .txt_record_exists(&record_name, &status.token)
            .await?;
        record_check(status, found, now, self.check_interval);

        Ok((!status.verified).then_some(self.check_interval))
    }
}

fn generate_token() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

fn record_check(
    status: &mut DomainVerificationStatus,
    found: bool,
    now: Timestamp,
    interval: Duration,
) {
    status.verified = found;
    status.last_checked = Some(Time(now));
    if found {
        status.next_check = None;
        status.message = "domain verified".to_owned();
    } else {
        let next = SignedDuration::try_from(interval)
            .ok()
            .and_then(|interval| now.checked_add(interval).ok())
            .unwrap_or(now);
        status.next_check = Some(Time(next));
        status.message = "TXT record not found or token mismatch".to_owned();
    }
}

fn duration_between(from: Timestamp, to: Timestamp) -> Duration {
    Duration::try_from(to.duration_since(from)).unwrap_or_default()
}

#[async_trait]
impl Process for DomainVerificationReconciler {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn process(&self, key: &str) -> Result<(), Error> {
        let object_key: ObjectKey = key.parse().context(InvalidKeySnafu)?;
        let Some(current) = self
            .store
            .get(&object_key)
            .await
            .context(GetVerificationSnafu { key })?
        else {
            tracing::debug!("domain verification was deleted");
            return Ok(());
        };

        let mut dv = current.clone();
        let requeue = self
            .check(&mut dv, Timestamp::now())
            .await
            .context(CheckTxtRecordSnafu { key })?;

        if dv != current {
            self.store
                .update_status(&dv)
                .await
                .context(UpdateVerificationSnafu { key })?;

            if dv.is_verified() && !current.is_verified() {
                tracing::info!(domain = %dv.spec.domain, "domain verified");
                if let Some(on_verified) = &self.on_verified {
                    on_verified(&object_key.cluster);
                }
            }
        }

        if let Some(requeue) = requeue {
            self.queue.add_after(key, requeue);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        domain::DomainVerificationSpec,
        store::set_cluster,
        testing::{FakeTxtVerifier, MemoryStore},
        workqueue::RateLimiter,
    };

    const KEY: &str = "root:org|example.com";

    fn fixture() -> (
        Arc<MemoryStore<DomainVerification>>,
        Arc<FakeTxtVerifier>,
        DomainVerificationReconciler,
    ) {
        let store = Arc::new(MemoryStore::default());
        let mut dv = DomainVerification::new("example.com", DomainVerificationSpec {
            domain: "example.com".to_owned(),
        });
        set_cluster(&mut dv.metadata, "root:org");
        store.insert(dv);

        let verifier = Arc::new(FakeTxtVerifier::default());
        let reconciler = DomainVerificationReconciler::new(
            store.clone(),
            verifier.clone(),
            WorkQueue::new(RateLimiter::default()),
            Duration::from_secs(60),
        );
        (store, verifier, reconciler)
    }

    fn status(store: &MemoryStore<DomainVerification>) -> DomainVerificationStatus {
        store
            .object(&KEY.parse().expect("key"))
            .expect("exists")
            .status
            .expect("status")
    }

    #[tokio::test]
    async fn issues_token_and_schedules_recheck() {
        let (store, verifier, reconciler) = fixture();

        reconciler.process(KEY).await.expect("reconciles");

        let status = status(&store);
        assert_eq!(status.token.len(), TOKEN_LENGTH);
        assert!(!status.verified);
        assert!(status.last_checked.is_some());
        assert!(status.next_check.is_some());
        assert_eq!(verifier.lookups(), 1);
    }

    #[tokio::test]
    async fn verifies_once_txt_record_is_published() {
        let (store, verifier, reconciler) = fixture();
        let verified_clusters = Arc::new(Mutex::new(Vec::new()));
        let reconciler = reconciler.on_verified({
            let verified_clusters = Arc::clone(&verified_clusters);
            Arc::new(move |cluster| {
                verified_clusters
                    .lock()
                    .expect("lock")
                    .push(cluster.to_owned());
            })
        });

        reconciler.process(KEY).await.expect("first check");
        let token = status(&store).token;
        verifier.publish("_kuadrant-verification.example.com", &token);

        // The next check is not due yet
        reconciler.process(KEY).await.expect("not due");
        assert!(!status(&store).verified);
        assert_eq!(verifier.lookups(), 1);

        let mut dv = store.object(&KEY.parse().expect("key")).expect("exists");
        if let Some(status) = dv.status.as_mut() {
            status.next_check = Some(Time(Timestamp::UNIX_EPOCH));
        }
        store.insert(dv);

        reconciler.process(KEY).await.expect("due");
        let status = status(&store);
        assert!(status.verified);
        assert_eq!(status.next_check, None);
        assert_eq!(*verified_clusters.lock().expect("lock"), vec!["root:org"]);

        // Verified domains are final
        reconciler.process(KEY).await.expect("verified");
        assert_eq!(verifier.lookups(), 2);
    }

    #[tokio::test]
    async fn deleted_verification_is_ignored() {
        let (_, verifier, reconciler) = fixture();
        reconciler
            .process("root:org|gone.example.com")
            .await
            .expect("reconciles");
        assert_eq!(verifier.lookups(), 0);
    }

    #[test]
    fn record_check_schedules_next_check_after_interval() {
        let mut status = DomainVerificationStatus::default();
        let now = Timestamp::UNIX_EPOCH;
        record_check(&mut status, false, now, Duration::from_secs(60));

        let next = status.next_check.expect("scheduled").0;
        assert_eq!(duration_between(now, next), Duration::from_secs(60));
        assert_eq!(duration_between(next, now), Duration::ZERO);
    }
}
