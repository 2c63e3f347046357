//! In-memory collaborators for tests.
//!
//! Everything here behaves like the real thing as far as the controller can observe: the
//! [`MemoryStore`] enforces resource versions and finalizers, the providers report the same
//! errors their production counterparts do.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use k8s_openapi::{
    ByteString,
    api::{
        admissionregistration::v1::ValidatingWebhookConfiguration, core::v1::Secret,
        networking::v1::Ingress,
    },
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
    jiff::Timestamp,
};
use kube::Resource;

use crate::{
    cli::ControllerOptions,
    controller::TrafficController,
    dns::{
        DnsRecord, DnsZone, Endpoint,
        provider::{BoxError, DnsProvider},
    },
    domain::{
        DomainVerification,
        oracle::{self, TxtVerifier},
    },
    metrics::TracingMetricsSink,
    net::{StaticResolver, watcher::HostWatcher},
    reconciler::{Collaborators, Pipeline},
    store::{self, ObjectKey, Store},
    tls::{self, CertificateProvider, CertificateRequest},
    traffic::{TrafficKey, TrafficKind, route::Route},
    workqueue::{RateLimiter, WorkQueue},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A [`Store`] keeping objects in memory.
///
/// Writes bump the resource version, updates of a stale object fail with a conflict and
/// deleting an object with finalizers only marks it as deleting.
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<ObjectKey, K>>,
    writes: AtomicUsize,
    next_version: AtomicUsize,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            writes: AtomicUsize::new(0),
            next_version: AtomicUsize::new(1),
        }
    }
}

fn has_finalizers(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|finalizers| !finalizers.is_empty())
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone,
{
    pub fn new(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::default();
        for object in objects {
            store.insert(object);
        }
        store
    }

    fn next_version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Stores `object` as is, bypassing version checks. Not counted as a write.
    pub fn insert(&self, mut object: K) {
        if object.meta().resource_version.is_none() {
            object.meta_mut().resource_version = Some(self.next_version());
        }
        let key = ObjectKey::from_meta(object.meta());
        lock(&self.objects).insert(key, object);
    }

    pub fn object(&self, key: &ObjectKey) -> Option<K> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn objects(&self) -> Vec<K> {
        lock(&self.objects).values().cloned().collect()
    }

    /// Number of create, update and delete calls that changed the store.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn key_of(object: &K) -> store::Result<ObjectKey> {
        if object.meta().name.as_deref().unwrap_or_default().is_empty() {
            return store::MissingNameSnafu.fail();
        }
        Ok(ObjectKey::from_meta(object.meta()))
    }
}

#[async_trait]
impl<K> Store<K> for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> store::Result<Option<K>> {
        Ok(self.object(key))
    }

    async fn list(&self, cluster: &str) -> store::Result<Vec<K>> {
        Ok(lock(&self.objects)
            .iter()
            .filter(|(key, _)| key.cluster == cluster)
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, object: &K) -> store::Result<K> {
        let key = Self::key_of(object)?;
        let mut objects = lock(&self.objects);
        if objects.contains_key(&key) {
            return store::AlreadyExistsSnafu { key }.fail();
        }

        let mut object = object.clone();
        let meta = object.meta_mut();
        meta.resource_version = Some(self.next_version());
        meta.uid = Some(format!("uid-{key}"));
        meta.creation_timestamp
            .get_or_insert_with(|| Time(Timestamp::now()));
        meta.generation = Some(1);
        objects.insert(key, object.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(object)
    }

    async fn update(&self, object: &K) -> store::Result<K> {
        let key = Self::key_of(object)?;
        let mut objects = lock(&self.objects);
        let Some(existing) = objects.get(&key) else {
            return store::NotFoundSnafu { key }.fail();
        };
        let version = &object.meta().resource_version;
        if version.is_some() && *version != existing.meta().resource_version {
            return store::ConflictSnafu { key }.fail();
        }

        let mut object = object.clone();
        object.meta_mut().resource_version = Some(self.next_version());
        self.writes.fetch_add(1, Ordering::SeqCst);
        if object.meta().deletion_timestamp.is_some() && !has_finalizers(object.meta()) {
            objects.remove(&key);
        } else {
            objects.insert(key, object.clone());
        }
        Ok(object)
    }

    async fn delete(&self, key: &ObjectKey) -> store::Result<()> {
        let mut objects = lock(&self.objects);
        let Some(existing) = objects.get_mut(key) else {
            return store::NotFoundSnafu { key: key.clone() }.fail();
        };

        if has_finalizers(existing.meta()) {
            if existing.meta().deletion_timestamp.is_none() {
                existing.meta_mut().deletion_timestamp = Some(Time(Timestamp::now()));
                existing.meta_mut().resource_version = Some(self.next_version());
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
        } else {
            objects.remove(key);
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// A [`TxtVerifier`] answering from a fixed set of TXT records.
#[derive(Default)]
pub struct FakeTxtVerifier {
    records: Mutex<BTreeMap<String, String>>,
    lookups: AtomicUsize,
}

impl FakeTxtVerifier {
    pub fn publish(&self, domain: &str, value: &str) {
        lock(&self.records).insert(domain.to_owned(), value.to_owned());
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TxtVerifier for FakeTxtVerifier {
    async fn txt_record_exists(&self, domain: &str, value: &str) -> Result<bool, oracle::Error> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.records).get(domain).is_some_and(|record| record == value))
    }
}

/// A [`DnsProvider`] keeping the published endpoints per zone.
#[derive(Default)]
pub struct FakeDnsProvider {
    zones: Mutex<BTreeMap<String, BTreeMap<ObjectKey, Vec<Endpoint>>>>,
    failing_zones: Mutex<BTreeSet<String>>,
}

impl FakeDnsProvider {
    /// All endpoints currently published to `zone`.
    pub fn published(&self, zone: &str) -> Vec<Endpoint> {
        lock(&self.zones)
            .get(zone)
            .into_iter()
            .flat_map(|records| records.values().flatten().cloned())
            .collect()
    }

    /// Makes every request to `zone` fail.
    pub fn fail_zone(&self, zone: &str) {
        lock(&self.failing_zones).insert(zone.to_owned());
    }

    fn check_zone(&self, zone: &DnsZone) -> Result<(), BoxError> {
        if lock(&self.failing_zones).contains(&zone.id) {
            return Err(format!("zone {:?} is unavailable", zone.id).into());
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for FakeDnsProvider {
    async fn ensure(&self, record: &DnsRecord, zone: &DnsZone) -> Result<(), BoxError> {
        self.check_zone(zone)?;
        lock(&self.zones)
            .entry(zone.id.clone())
            .or_default()
            .insert(ObjectKey::from_meta(&record.metadata), record.spec.endpoints.clone());
        Ok(())
    }

    async fn delete(&self, record: &DnsRecord, zone: &DnsZone) -> Result<(), BoxError> {
        self.check_zone(zone)?;
        if let Some(records) = lock(&self.zones).get_mut(&zone.id) {
            records.remove(&ObjectKey::from_meta(&record.metadata));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct FakeCertificate {
    request: CertificateRequest,
    ready: bool,
}

/// A [`CertificateProvider`] issuing certificates on demand.
///
/// Certificates stay pending until [`issue`](Self::issue) is called, unless the provider was
/// built with [`issuing_immediately`](Self::issuing_immediately).
#[derive(Default)]
pub struct FakeCertificateProvider {
    certificates: Mutex<BTreeMap<String, FakeCertificate>>,
    issue_immediately: bool,
    calls: AtomicUsize,
}

impl FakeCertificateProvider {
    pub fn issuing_immediately() -> Self {
        Self {
            issue_immediately: true,
            ..Self::default()
        }
    }

    /// Marks the certificate `name` as issued.
    pub fn issue(&self, name: &str) {
        if let Some(certificate) = lock(&self.certificates).get_mut(name) {
            certificate.ready = true;
        }
    }

    pub fn requests(&self) -> Vec<CertificateRequest> {
        lock(&self.certificates)
            .values()
            .map(|certificate| certificate.request.clone())
            .collect()
    }

    /// Number of create, update and delete calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn secret(request: &CertificateRequest) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(request.name.clone()),
                ..ObjectMeta::default()
            },
            type_: Some("kubernetes.io/tls".to_owned()),
            data: Some(BTreeMap::from([
                (
                    "tls.crt".to_owned(),
                    ByteString(format!("certificate for {}", request.host).into_bytes()),
                ),
                (
                    "tls.key".to_owned(),
                    ByteString(format!("key for {}", request.host).into_bytes()),
                ),
                ("ca.crt".to_owned(), ByteString(b"fake ca".to_vec())),
            ])),
            ..Secret::default()
        }
    }
}

#[async_trait]
impl CertificateProvider for FakeCertificateProvider {
    async fn create(&self, request: &CertificateRequest) -> Result<(), tls::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut certificates = lock(&self.certificates);
        if certificates.contains_key(&request.name) {
            return tls::AlreadyExistsSnafu {
                name: request.name.clone(),
            }
            .fail();
        }
        certificates.insert(request.name.clone(), FakeCertificate {
            request: request.clone(),
            ready: self.issue_immediately,
        });
        Ok(())
    }

    async fn update(&self, request: &CertificateRequest) -> Result<(), tls::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.certificates)
            .entry(request.name.clone())
            .or_insert_with(|| FakeCertificate {
                request: request.clone(),
                ready: self.issue_immediately,
            })
            .request = request.clone();
        Ok(())
    }

    async fn delete(&self, request: &CertificateRequest) -> Result<(), tls::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.certificates).remove(&request.name) {
            Some(_) => Ok(()),
            None => tls::NotFoundSnafu {
                name: request.name.clone(),
            }
            .fail(),
        }
    }

    async fn get_secret(&self, request: &CertificateRequest) -> Result<Option<Secret>, tls::Error> {
        Ok(lock(&self.certificates)
            .get(&request.name)
            .filter(|certificate| certificate.ready)
            .map(|certificate| Self::secret(&certificate.request)))
    }

    async fn status(&self, request: &CertificateRequest) -> Result<String, tls::Error> {
        match lock(&self.certificates).get(&request.name) {
            Some(certificate) if certificate.ready => Ok("ready".to_owned()),
            Some(_) => Ok("pending".to_owned()),
            None => tls::NotFoundSnafu {
                name: request.name.clone(),
            }
            .fail(),
        }
    }
}

/// A shared [`MemoryStore`].
pub fn memory_store<K>(objects: impl IntoIterator<Item = K>) -> Arc<MemoryStore<K>>
where
    K: Resource + Clone,
{
    Arc::new(MemoryStore::new(objects))
}

/// The whole controller wired to in-memory collaborators.
///
/// Ingresses and Routes are processed from separate queues, host changes seen by the
/// [`HostWatcher`] are routed to the queue of the object's kind.
pub struct Harness {
    pub options: ControllerOptions,
    pub ingresses: Arc<MemoryStore<Ingress>>,
    pub routes: Arc<MemoryStore<Route>>,
    pub verifications: Arc<MemoryStore<DomainVerification>>,
    pub dns_records: Arc<MemoryStore<DnsRecord>>,
    pub secrets: Arc<MemoryStore<Secret>>,
    pub webhook_configurations: Arc<MemoryStore<ValidatingWebhookConfiguration>>,
    pub certificates: Arc<FakeCertificateProvider>,
    pub resolver: Arc<StaticResolver>,
    pub watcher: Arc<HostWatcher>,
    pub ingress_queue: Arc<WorkQueue>,
    pub route_queue: Arc<WorkQueue>,
}

impl Harness {
    pub fn new(options: ControllerOptions) -> Self {
        let ingress_queue = WorkQueue::new(RateLimiter::default());
        let route_queue = WorkQueue::new(RateLimiter::default());
        let resolver = Arc::new(StaticResolver::default());

        let queues = (Arc::clone(&ingress_queue), Arc::clone(&route_queue));
        let watcher = Arc::new(HostWatcher::new(
            resolver.clone(),
            Arc::new(move |key: &str| match key.parse::<TrafficKey>() {
                Ok(traffic) if traffic.kind == TrafficKind::Route => queues.1.add(key),
                _ => queues.0.add(key),
            }),
        ));

        Self {
            options,
            ingresses: Arc::default(),
            routes: Arc::default(),
            verifications: Arc::default(),
            dns_records: Arc::default(),
            secrets: Arc::default(),
            webhook_configurations: Arc::default(),
            certificates: Arc::default(),
            resolver,
            watcher,
            ingress_queue,
            route_queue,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            verifications: self.verifications.clone(),
            shadows: self.routes.clone(),
            dns_records: self.dns_records.clone(),
            secrets: self.secrets.clone(),
            webhook_configurations: self.webhook_configurations.clone(),
            certificates: self.certificates.clone(),
            watcher: self.watcher.clone(),
            metrics: Arc::new(TracingMetricsSink),
        }
    }

    pub fn ingress_controller(&self) -> TrafficController<Ingress> {
        TrafficController::new(
            self.ingresses.clone(),
            Pipeline::from_options(&self.options, self.collaborators()),
            Arc::clone(&self.ingress_queue),
            self.options.dns_retry_interval,
        )
    }

    pub fn route_controller(&self) -> TrafficController<Route> {
        TrafficController::new(
            self.routes.clone(),
            Pipeline::from_options(&self.options, self.collaborators()),
            Arc::clone(&self.route_queue),
            self.options.dns_retry_interval,
        )
    }
}
