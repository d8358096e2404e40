use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use operator::config::{DispatchSettings, WatchScope};
use operator::crd::OCSInitialization;
use operator::desired::DesiredState;
use operator::events_helper::RecordedEvents;
use operator::init_controller::{
    bootstrap, reconcile_initialization, Context, Diagnostics, Reconciler, RECREATE_REQUEUE,
};
use operator::store::{MemoryStore, ObjectKey};
use tokio::sync::RwLock;

struct Cluster {
    inits: Arc<MemoryStore<OCSInitialization>>,
    classes: Arc<MemoryStore<StorageClass>>,
    ctx: Arc<Context>,
    canonical: ObjectKey,
}

fn cluster() -> Cluster {
    let inits = Arc::new(MemoryStore::<OCSInitialization>::new());
    let classes = Arc::new(MemoryStore::<StorageClass>::new());
    let desired = DesiredState::new(vec![StorageClass {
        metadata: ObjectMeta {
            name: Some("ocs-rbd".into()),
            ..ObjectMeta::default()
        },
        provisioner: "openshift-storage.rbd.csi.ceph.com".into(),
        ..StorageClass::default()
    }])
    .unwrap();
    let scope = WatchScope::new("openshift-storage", false).unwrap();
    let canonical = scope.canonical_identity();
    let reconciler = Reconciler::new(
        scope,
        inits.clone(),
        classes.clone(),
        Arc::new(desired),
        Arc::new(RecordedEvents::default()),
        Duration::from_secs(30),
    );
    let diagnostics = Arc::new(RwLock::new(Diagnostics::default()));
    let ctx = Arc::new(Context::new(reconciler, DispatchSettings::default(), diagnostics));
    Cluster {
        inits,
        classes,
        ctx,
        canonical,
    }
}

/// What the controller does once the watch has cached the object
async fn reconcile_cached(c: &Cluster) -> Action {
    let cached = c.inits.object(&c.canonical).expect("cached");
    reconcile_initialization(Arc::new(cached), c.ctx.clone()).await.unwrap()
}

#[tokio::test]
async fn startup_trigger_converges_an_empty_cluster() {
    let c = cluster();

    // nothing is cached, so the startup trigger is handled by bootstrap
    assert_eq!(bootstrap(&c.canonical, &c.ctx).await, Some(RECREATE_REQUEUE));
    assert!(!c.inits.object(&c.canonical).unwrap().is_initialized());

    assert_eq!(reconcile_cached(&c).await, Action::await_change());
    assert!(c.inits.object(&c.canonical).unwrap().is_initialized());
    assert!(c.classes.object(&ObjectKey::cluster("ocs-rbd")).is_some());
    assert_eq!(c.ctx.diagnostics.read().await.reconciles, 2);
}

#[tokio::test]
async fn deleted_singleton_is_provisioned_again() {
    let c = cluster();
    bootstrap(&c.canonical, &c.ctx).await;
    reconcile_cached(&c).await;

    // an external actor resets the singleton and drifts a StorageClass
    c.inits.remove(&c.canonical);
    let mut drifted = c.classes.object(&ObjectKey::cluster("ocs-rbd")).unwrap();
    drifted.provisioner = "elsewhere".into();
    c.classes.insert(drifted);

    assert_eq!(bootstrap(&c.canonical, &c.ctx).await, Some(RECREATE_REQUEUE));
    assert_eq!(reconcile_cached(&c).await, Action::await_change());

    assert!(c.inits.object(&c.canonical).unwrap().is_initialized());
    let restored = c.classes.object(&ObjectKey::cluster("ocs-rbd")).unwrap();
    assert_eq!(restored.provisioner, "openshift-storage.rbd.csi.ceph.com");
}

#[tokio::test]
async fn bootstrap_of_a_present_singleton_is_harmless() {
    let c = cluster();
    bootstrap(&c.canonical, &c.ctx).await;
    reconcile_cached(&c).await;
    c.inits.clear_calls();

    // a resync racing the cache finds the singleton already initialized
    assert_eq!(bootstrap(&c.canonical, &c.ctx).await, None);
    assert!(c.inits.mutations().is_empty());
}
