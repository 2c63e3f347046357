//! The resource store collaborator.
//!
//! All persisted state (traffic objects, DNS Records, TLS secrets, Domain Verifications and the
//! webhook configuration) is read and written through a [`Store`]. The production implementation
//! is [`KubeStore`](crate::client::KubeStore), tests use the in-memory store from
//! [`testing`](crate::testing).
//!
//! Objects are addressed by an [`ObjectKey`], which adds the logical cluster to the usual
//! namespace/name pair.

use std::{fmt::Display, str::FromStr};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use snafu::{OptionExt, Snafu, ensure};

/// Annotation carrying the logical cluster (workspace) an object lives in.
pub const CLUSTER_ANNOTATION: &str = "kcp.io/cluster";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("object {key} not found"))]
    NotFound { key: ObjectKey },

    #[snafu(display("object {key} already exists"))]
    AlreadyExists { key: ObjectKey },

    #[snafu(display("object {key} was modified concurrently"))]
    Conflict { key: ObjectKey },

    #[snafu(display("object has no name"))]
    MissingName,

    #[snafu(display("failed to serialize object {key}"))]
    SerializeObject {
        source: serde_json::Error,
        key: ObjectKey,
    },

    #[snafu(display("invalid object key {key:?}"))]
    InvalidKey { key: String },

    #[snafu(display("api request for object {key} failed"))]
    Api { source: kube::Error, key: ObjectKey },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Identity of an object across logical clusters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub cluster: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(
        cluster: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(cluster: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: None,
            name: name.into(),
        }
    }

    /// Builds the key of an object from its metadata.
    ///
    /// A missing cluster annotation maps onto the empty (default) cluster.
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            cluster: cluster_of(meta).to_owned(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// Same cluster and namespace, different name.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}|{namespace}/{}", self.cluster, self.name),
            None => write!(f, "{}|{}", self.cluster, self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    /// Parses the [`Display`] form, `cluster|namespace/name` or `cluster|name`.
    fn from_str(key: &str) -> Result<Self> {
        let (cluster, rest) = key.split_once('|').context(InvalidKeySnafu { key })?;
        let key = match rest.split_once('/') {
            Some((namespace, name)) => Self::namespaced(cluster, namespace, name),
            None => Self::cluster_scoped(cluster, rest),
        };
        ensure!(!key.name.is_empty(), InvalidKeySnafu { key: key.to_string() });
        Ok(key)
    }
}

/// Returns the logical cluster recorded on an object.
pub fn cluster_of(meta: &ObjectMeta) -> &str {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(CLUSTER_ANNOTATION))
        .map_or("", String::as_str)
}

/// Records the logical cluster on an object.
pub fn set_cluster(meta: &mut ObjectMeta, cluster: &str) {
    if cluster.is_empty() {
        return;
    }
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(CLUSTER_ANNOTATION.to_owned(), cluster.to_owned());
}

/// Get/List/Create/Update/Delete access to one resource type.
///
/// Updates use optimistic concurrency: an update of a stale object fails with
/// [`Error::Conflict`], which the caller resolves by requeueing.
#[async_trait]
pub trait Store<K>: Send + Sync
where
    K: Send + Sync,
{
    /// Returns [`None`] if the object does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// Lists all objects of a logical cluster.
    async fn list(&self, cluster: &str) -> Result<Vec<K>>;

    async fn create(&self, object: &K) -> Result<K>;

    async fn update(&self, object: &K) -> Result<K>;

    /// Writes the status of an object. Stores without a status subresource write the whole object.
    async fn update_status(&self, object: &K) -> Result<K> {
        self.update(object).await
    }

    /// Fails with [`Error::NotFound`] if the object does not exist.
    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// Deletes an object, treating a missing object as success.
pub async fn delete_ignore_not_found<K>(store: &dyn Store<K>, key: &ObjectKey) -> Result<()>
where
    K: Send + Sync,
{
    match store.delete(key).await {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

/// Creates `desired` or updates the existing object if it differs.
///
/// `desired` is either built from scratch or laid over the live object. The server-managed
/// metadata of the live object is carried over before comparing.
pub async fn create_or_update<K>(store: &dyn Store<K>, desired: K) -> Result<K>
where
    K: Resource + Clone + PartialEq + Send + Sync,
{
    let key = ObjectKey::from_meta(desired.meta());
    match store.get(&key).await? {
        None => match store.create(&desired).await {
            // Lost a race against another worker, the next reconcile converges
            Err(err) if err.is_already_exists() => Ok(desired),
            other => other,
        },
        Some(existing) => {
            let mut desired = desired;
            desired.meta_mut().resource_version = existing.meta().resource_version.clone();
            desired.meta_mut().uid = existing.meta().uid.clone();
            desired.meta_mut().creation_timestamp = existing.meta().creation_timestamp.clone();
            desired.meta_mut().generation = existing.meta().generation;
            desired.meta_mut().managed_fields = existing.meta().managed_fields.clone();
            if desired == existing {
                return Ok(existing);
            }
            store.update(&desired).await
        }
    }
}
