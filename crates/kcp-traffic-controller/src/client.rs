use std::{fmt::Debug, marker::PhantomData};

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    Api, Client, Resource,
    api::{DeleteParams, ListParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::{OptionExt, ResultExt};

use crate::store::{
    self, AlreadyExistsSnafu, ConflictSnafu, MissingNameSnafu, NotFoundSnafu, ObjectKey,
    SerializeObjectSnafu, Store,
};

/// A [`Store`] backed by the Kubernetes API.
///
/// It wraps an underlying [`kube::Client`] for a single resource type. The logical cluster of an
/// object is metadata only: the client is expected to point at an endpoint that serves all
/// clusters the controller is responsible for.
pub struct KubeStore<K> {
    client: Client,
    post_params: PostParams,
    delete_params: DeleteParams,
    api_for: fn(Client, Option<&str>) -> Api<K>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    /// Creates a store for a namespaced resource type.
    pub fn namespaced(client: Client, field_manager: Option<String>) -> Self {
        Self::new(client, field_manager, |client, namespace| match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        })
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>,
{
    /// Creates a store for a cluster-scoped resource type.
    pub fn cluster_scoped(client: Client, field_manager: Option<String>) -> Self {
        Self::new(client, field_manager, |client, _| Api::all(client))
    }
}

impl<K> KubeStore<K> {
    fn new(
        client: Client,
        field_manager: Option<String>,
        api_for: fn(Client, Option<&str>) -> Api<K>,
    ) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager,
                ..PostParams::default()
            },
            delete_params: DeleteParams::default(),
            api_for,
            _kind: PhantomData,
        }
    }

    /// Returns a [`kube::Client`] that can be freely used.
    pub fn as_kube_client(&self) -> Client {
        self.client.clone()
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api_for)(self.client.clone(), namespace)
    }
}

/// HTTP status code of a failed API request, if the API server answered at all.
fn status_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

/// Maps an API error onto the store error taxonomy.
fn map_api_error(error: kube::Error, key: ObjectKey) -> store::Error {
    match status_code(&error) {
        Some(404) => NotFoundSnafu { key }.build(),
        Some(409) => match &error {
            kube::Error::Api(response) if response.reason == "AlreadyExists" => {
                AlreadyExistsSnafu { key }.build()
            }
            _ => ConflictSnafu { key }.build(),
        },
        _ => store::Error::Api { source: error, key },
    }
}

#[async_trait]
impl<K> Store<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> store::Result<Option<K>> {
        self.api(key.namespace.as_deref())
            .get_opt(&key.name)
            .await
            .map_err(|err| map_api_error(err, key.clone()))
    }

    async fn list(&self, cluster: &str) -> store::Result<Vec<K>> {
        let objects = self
            .api(None)
            .list(&ListParams::default())
            .await
            .map_err(|err| map_api_error(err, ObjectKey::cluster_scoped(cluster, "")))?;

        Ok(objects
            .items
            .into_iter()
            .filter(|object| cluster.is_empty() || store::cluster_of(object.meta()) == cluster)
            .collect())
    }

    async fn create(&self, object: &K) -> store::Result<K> {
        let key = ObjectKey::from_meta(object.meta());
        self.api(key.namespace.as_deref())
            .create(&self.post_params, object)
            .await
            .map_err(|err| map_api_error(err, key))
    }

    async fn update(&self, object: &K) -> store::Result<K> {
        let key = ObjectKey::from_meta(object.meta());
        let name = object.meta().name.clone().context(MissingNameSnafu)?;
        self.api(key.namespace.as_deref())
            .replace(&name, &self.post_params, object)
            .await
            .map_err(|err| map_api_error(err, key))
    }

    async fn update_status(&self, object: &K) -> store::Result<K> {
        let key = ObjectKey::from_meta(object.meta());
        let name = object.meta().name.clone().context(MissingNameSnafu)?;
        serde_json::to_vec(object).with_context(|_| SerializeObjectSnafu {
            key: key.clone(),
        })?;
        self.api(key.namespace.as_deref())
            .replace_status(&name, &self.post_params, object)
            .await
            .map_err(|err| map_api_error(err, key))
    }

    async fn delete(&self, key: &ObjectKey) -> store::Result<()> {
        self.api(key.namespace.as_deref())
            .delete(&key.name, &self.delete_params)
            .await
            .map(|_| ())
            .map_err(|err| map_api_error(err, key.clone()))
    }
}
