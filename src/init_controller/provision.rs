use std::fmt::Debug;
use std::sync::Arc;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::*;

use crate::{
    crd::OCSInitialization,
    desired::DesiredState,
    events_helper::{emit_info, emit_warning, EventPublisher},
    store::{within, ObjectKey, ResourceStore},
    Error, Result,
};

/// What `ensure_object` did to one desired object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Restored,
    Unchanged,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub created: Vec<String>,
    pub restored: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ProvisionReport {
    fn record(&mut self, name: String, applied: Applied) {
        match applied {
            Applied::Created => self.created.push(name),
            Applied::Restored => self.restored.push(name),
            Applied::Unchanged => self.unchanged.push(name),
        }
    }
}

/// Content of an object that the provisioner owns: everything except
/// server-populated metadata and status.
fn managed_content<K: Serialize>(obj: &K) -> Result<Value> {
    let mut value = serde_json::to_value(obj).map_err(Error::SerializationError)?;
    if let Value::Object(map) = &mut value {
        map.remove("status");
        let metadata = map.remove("metadata");
        let kept: serde_json::Map<String, Value> = metadata
            .and_then(|m| match m {
                Value::Object(m) => Some(m),
                _ => None,
            })
            .into_iter()
            .flatten()
            .filter(|(k, v)| {
                (k == "labels" || k == "annotations")
                    && v.as_object().is_some_and(|o| !o.is_empty())
            })
            .collect();
        if !kept.is_empty() {
            map.insert("metadata".into(), Value::Object(kept));
        }
    }
    Ok(value)
}

/// Whether `existing` differs from `desired` in anything the provisioner owns
pub fn drifted<K: Serialize>(desired: &K, existing: &K) -> Result<bool> {
    Ok(managed_content(desired)? != managed_content(existing)?)
}

/// The desired object carrying the identity of `existing`, ready for a full replace
pub fn adopt_identity<K: Resource + Clone>(desired: &K, existing: &K) -> K {
    let mut restored = desired.clone();
    let from = existing.meta();
    let meta = restored.meta_mut();
    meta.name = from.name.clone();
    meta.namespace = from.namespace.clone();
    meta.uid = from.uid.clone();
    meta.resource_version = from.resource_version.clone();
    restored
}

/// Make one desired object exist with exactly its desired content:
/// create when absent, full replace when drifted, nothing otherwise.
pub async fn ensure_object<K>(
    store: &dyn ResourceStore<K>,
    desired: &K,
    deadline: Instant,
) -> Result<Applied>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + Send + Sync,
{
    let key = ObjectKey::of(desired);
    match within(deadline, format!("get {key}"), store.get(&key)).await? {
        None => {
            info!("Creating {} {}", K::kind(&()), key);
            within(deadline, format!("create {key}"), store.create(desired)).await?;
            Ok(Applied::Created)
        }
        Some(existing) if !drifted(desired, &existing)? => {
            debug!("{} {} already as desired", K::kind(&()), key);
            Ok(Applied::Unchanged)
        }
        Some(existing) => {
            info!("Restoring original {} {}", K::kind(&()), key);
            let restored = adopt_identity(desired, &existing);
            within(deadline, format!("replace {key}"), store.replace(&restored)).await?;
            Ok(Applied::Restored)
        }
    }
}

/// Ensures the desired StorageClasses exist, in order, stopping at the first failure.
pub struct Provisioner {
    storage_classes: Arc<dyn ResourceStore<StorageClass>>,
    desired: Arc<DesiredState>,
}

impl Provisioner {
    pub fn new(
        storage_classes: Arc<dyn ResourceStore<StorageClass>>,
        desired: Arc<DesiredState>,
    ) -> Self {
        Self {
            storage_classes,
            desired,
        }
    }

    pub async fn ensure_storage_classes(
        &self,
        init: &OCSInitialization,
        deadline: Instant,
        events: &dyn EventPublisher,
    ) -> Result<ProvisionReport> {
        let mut report = ProvisionReport::default();
        for sc in self.desired.storage_classes(init) {
            let name = sc.name_any();
            let applied = ensure_object(self.storage_classes.as_ref(), &sc, deadline).await?;
            match applied {
                Applied::Created => {
                    let note = format!("Created StorageClass `{name}`");
                    emit_info(events, init, "StorageClassCreated", "Creating", note).await
                }
                Applied::Restored => {
                    let note = format!("Restored drifted StorageClass `{name}`");
                    emit_warning(events, init, "StorageClassRestored", "Restoring", note).await
                }
                Applied::Unchanged => {}
            }
            report.record(name, applied);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Failure, MemoryStore, StoreCall};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn sc(name: &str, pool: &str) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..ObjectMeta::default()
            },
            provisioner: "openshift-storage.rbd.csi.ceph.com".into(),
            parameters: Some(BTreeMap::from([("pool".to_string(), pool.to_string())])),
            ..StorageClass::default()
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn server_metadata_is_not_drift() {
        let desired = sc("fast", "a");
        let mut existing = desired.clone();
        existing.metadata.uid = Some("u".into());
        existing.metadata.resource_version = Some("42".into());
        existing.metadata.labels = Some(BTreeMap::new());
        assert!(!drifted(&desired, &existing).unwrap());

        existing.metadata.labels = Some(BTreeMap::from([("x".to_string(), "y".to_string())]));
        assert!(drifted(&desired, &existing).unwrap());
    }

    #[test]
    fn adopt_identity_keeps_desired_content() {
        let desired = sc("fast", "a");
        let mut existing = sc("fast", "b");
        existing.metadata.uid = Some("u".into());
        existing.metadata.resource_version = Some("7".into());
        existing.mount_options = Some(vec!["debug".into()]);

        let restored = adopt_identity(&desired, &existing);
        assert_eq!(restored.metadata.resource_version.as_deref(), Some("7"));
        assert_eq!(restored.metadata.uid.as_deref(), Some("u"));
        assert_eq!(restored.parameters, desired.parameters);
        assert_eq!(restored.mount_options, None);
    }

    #[tokio::test]
    async fn ensure_object_creates_restores_and_skips() {
        let store = MemoryStore::with_objects([sc("drifted", "wrong"), sc("same", "a")]);

        let created = ensure_object(&store, &sc("new", "a"), deadline()).await.unwrap();
        assert_eq!(created, Applied::Created);
        let restored = ensure_object(&store, &sc("drifted", "a"), deadline()).await.unwrap();
        assert_eq!(restored, Applied::Restored);
        let unchanged = ensure_object(&store, &sc("same", "a"), deadline()).await.unwrap();
        assert_eq!(unchanged, Applied::Unchanged);

        let restored = store.object(&ObjectKey::cluster("drifted")).unwrap();
        assert_eq!(restored.parameters, sc("drifted", "a").parameters);
        assert_eq!(
            store.mutations(),
            vec![
                StoreCall::Create(ObjectKey::cluster("new")),
                StoreCall::Replace(ObjectKey::cluster("drifted")),
            ]
        );
    }

    #[tokio::test]
    async fn get_failure_propagates_without_writes() {
        let store = MemoryStore::<StorageClass>::new();
        store.fail_once(StoreCall::Get(ObjectKey::cluster("fast")), Failure::Unavailable);
        let err = ensure_object(&store, &sc("fast", "a"), deadline()).await.unwrap_err();
        assert!(matches!(err, Error::OtherError(_)));
        assert!(store.mutations().is_empty());
    }
}
