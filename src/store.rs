use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use kube::ResourceExt;
use tokio::time::Instant;

use crate::{Error, Result};

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::{Failure, MemoryStore, StoreCall};

/// Identity of a single object: namespace (absent for cluster-scoped kinds) and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn of<K: ResourceExt>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// get/create/replace/list capability over one resource kind. Production
/// wires a [`KubeStore`] over the API server, tests use [`MemoryStore`].
///
/// `replace` and `replace_status` are separate operations with separate
/// conflict domains: `replace` never changes status and `replace_status`
/// never changes anything but status. Both carry the object's
/// resourceVersion and fail with [`Error::Conflict`] if it is stale.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// Create an object; [`Error::AlreadyExists`] if the identity is taken
    async fn create(&self, obj: &K) -> Result<K>;

    /// Full replace of everything but status
    async fn replace(&self, obj: &K) -> Result<K>;

    /// Replace of the status subresource only
    async fn replace_status(&self, obj: &K) -> Result<K>;

    /// List objects, optionally restricted to a namespace and a label selector
    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>>;
}

/// Bind a store operation to the invocation deadline.
pub async fn within<T, F>(deadline: Instant, op: impl fmt::Display, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout(op.to_string())),
    }
}
