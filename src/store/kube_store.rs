use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::{Api, ListParams, PostParams},
    client::Client,
    Resource,
};
use serde::{de::DeserializeOwned, Serialize};

use super::{ObjectKey, ResourceStore};
use crate::{Error, Result};

/// [`ResourceStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore<K> {
    client: Client,
    api_for: fn(Client, Option<&str>) -> Api<K>,
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api_for: |client, ns| match ns {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            },
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>,
{
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api_for: |client, _| Api::all(client),
        }
    }
}

impl<K> KubeStore<K> {
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api_for)(self.client.clone(), namespace)
    }
}

/// Translate API status codes into the store's error taxonomy
fn classify(err: kube::Error, key: &ObjectKey, conflict: fn(String) -> Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(key.to_string()),
        kube::Error::Api(ae) if ae.code == 409 => conflict(format!("{key}: {}", ae.message)),
        e => Error::KubeError(e),
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        self.api(key.namespace.as_deref())
            .get_opt(&key.name)
            .await
            .map_err(Error::KubeError)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        self.api(key.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &key, Error::AlreadyExists))
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        self.api(key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, &key, Error::Conflict))
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let data = serde_json::to_vec(obj).map_err(Error::SerializationError)?;
        self.api(key.namespace.as_deref())
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(|e| classify(e, &key, Error::Conflict))
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>> {
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        let list = self.api(namespace).list(&lp).await.map_err(Error::KubeError)?;
        Ok(list.items)
    }
}
