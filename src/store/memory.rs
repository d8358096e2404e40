use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::{ObjectKey, ResourceStore};
use crate::{Error, Result};

/// One recorded call against a [`MemoryStore`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreCall {
    Get(ObjectKey),
    Create(ObjectKey),
    Replace(ObjectKey),
    ReplaceStatus(ObjectKey),
    List(Option<String>),
}

impl StoreCall {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            StoreCall::Create(_) | StoreCall::Replace(_) | StoreCall::ReplaceStatus(_)
        )
    }
}

/// Failure injected in place of a call's normal result
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    Conflict,
    Unavailable,
}

impl Failure {
    fn into_error(self, call: &StoreCall) -> Error {
        match self {
            Failure::Conflict => Error::Conflict(format!("injected on {call:?}")),
            Failure::Unavailable => Error::OtherError(format!("store unavailable on {call:?}")),
        }
    }
}

struct Inner<K> {
    objects: BTreeMap<ObjectKey, K>,
    calls: Vec<StoreCall>,
    faults: Vec<(StoreCall, Failure)>,
    version: u64,
}

/// In-memory [`ResourceStore`] that records calls and supports fault injection.
///
/// Mirrors the API server where the reconciler depends on it: resourceVersions
/// increase on every write, stale writes are rejected, and status is only
/// writable through `replace_status`.
pub struct MemoryStore<K> {
    inner: Mutex<Inner<K>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                calls: Vec::new(),
                faults: Vec::new(),
                version: 0,
            }),
        }
    }
}

fn to_value<K: Serialize>(obj: &K) -> Result<Value> {
    serde_json::to_value(obj).map_err(Error::SerializationError)
}

fn from_value<K: DeserializeOwned>(value: Value) -> Result<K> {
    serde_json::from_value(value).map_err(Error::SerializationError)
}

/// `base` with its `status` taken from `status_source`
fn graft_status<K>(base: &K, status_source: &K) -> Result<K>
where
    K: Serialize + DeserializeOwned,
{
    let mut value = to_value(base)?;
    let status = to_value(status_source)?.get("status").cloned();
    if let Value::Object(map) = &mut value {
        match status {
            Some(status) => map.insert("status".into(), status),
            None => map.remove("status"),
        };
    }
    from_value(value)
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k.trim()).map(String::as_str) == Some(v.trim()),
            None => labels.contains_key(term),
        })
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::new();
        for obj in objects {
            store.insert(obj);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put an object directly, as another actor would, without recording a call
    pub fn insert(&self, mut obj: K) {
        let mut inner = self.lock();
        inner.version += 1;
        let version = inner.version;
        let meta = obj.meta_mut();
        meta.resource_version = Some(version.to_string());
        meta.uid.get_or_insert_with(|| format!("uid-{version}"));
        inner.objects.insert(ObjectKey::of(&obj), obj);
    }

    /// Delete an object out from under the reconciler
    pub fn remove(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.remove(key)
    }

    pub fn object(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    pub fn objects(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<StoreCall> {
        self.lock().calls.iter().filter(|c| c.is_mutation()).cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Make the next occurrence of `call` fail with `failure`
    pub fn fail_once(&self, call: StoreCall, failure: Failure) {
        self.lock().faults.push((call, failure));
    }

    /// Record the call and consume a matching injected fault, if any
    fn begin(inner: &mut Inner<K>, call: StoreCall) -> Result<()> {
        inner.calls.push(call.clone());
        match inner.faults.iter().position(|(c, _)| *c == call) {
            Some(pos) => {
                let (_, failure) = inner.faults.remove(pos);
                Err(failure.into_error(&call))
            }
            None => Ok(()),
        }
    }

    /// Common path for replace and replace_status: compare-and-swap on resourceVersion
    fn swap(inner: &mut Inner<K>, key: ObjectKey, obj: &K, status_only: bool) -> Result<K> {
        let existing = inner
            .objects
            .get(&key)
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if let Some(rv) = obj.meta().resource_version.as_ref() {
            if existing.meta().resource_version.as_ref() != Some(rv) {
                return Err(Error::Conflict(format!(
                    "{key}: resourceVersion {rv} is stale"
                )));
            }
        }
        let mut updated = if status_only {
            graft_status(existing, obj)?
        } else {
            graft_status(obj, existing)?
        };
        let uid = existing.meta().uid.clone();
        inner.version += 1;
        let meta = updated.meta_mut();
        meta.resource_version = Some(inner.version.to_string());
        meta.uid = uid;
        inner.objects.insert(key, updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        let mut inner = self.lock();
        Self::begin(&mut inner, StoreCall::Get(key.clone()))?;
        Ok(inner.objects.get(key).cloned())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut inner = self.lock();
        Self::begin(&mut inner, StoreCall::Create(key.clone()))?;
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        inner.version += 1;
        let version = inner.version;
        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.resource_version = Some(version.to_string());
        meta.uid = Some(format!("uid-{version}"));
        inner.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut inner = self.lock();
        Self::begin(&mut inner, StoreCall::Replace(key.clone()))?;
        Self::swap(&mut inner, key, obj, false)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut inner = self.lock();
        Self::begin(&mut inner, StoreCall::ReplaceStatus(key.clone()))?;
        Self::swap(&mut inner, key, obj, true)
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>> {
        let mut inner = self.lock();
        Self::begin(&mut inner, StoreCall::List(namespace.map(str::to_string)))?;
        Ok(inner
            .objects
            .iter()
            .filter(|(key, _)| namespace.is_none() || key.namespace.as_deref() == namespace)
            .filter(|(_, obj)| label_selector.is_none_or(|s| matches_selector(obj.labels(), s)))
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}
