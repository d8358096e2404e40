use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{channel::mpsc, stream, Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{self, Action},
        events::Reporter,
        reflector::{self, ObjectRef},
        watcher::{self, Event},
        Config, Controller, WatchStreamExt,
    },
};
use serde::Serialize;
use tokio::{
    sync::{Mutex, RwLock},
    time::{Duration, Instant},
};
use tracing::*;

use super::{Outcome, Reconciler};
use crate::{
    config::{DispatchSettings, Settings, WatchScope},
    crd::{OCSInitialization, MANAGER_NAME},
    desired::DesiredState,
    events_helper::RecorderPublisher,
    store::{KubeStore, ObjectKey, ResourceStore},
    Error, Result,
};

/// Context for our reconciler
pub struct Context {
    pub reconciler: Reconciler,
    pub settings: DispatchSettings,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Held while the canonical identity is reconciled, by the controller or by bootstrap
    canonical: Mutex<()>,
}

impl Context {
    pub fn new(
        reconciler: Reconciler,
        settings: DispatchSettings,
        diagnostics: Arc<RwLock<Diagnostics>>,
    ) -> Self {
        Self {
            reconciler,
            settings,
            diagnostics,
            canonical: Mutex::new(()),
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        let _serial = if *key == self.reconciler.canonical_identity() {
            Some(self.canonical.lock().await)
        } else {
            None
        };
        let res = self.reconciler.reconcile(key).await;
        self.record(&res).await;
        res
    }

    async fn record(&self, res: &Result<Outcome>) {
        let mut diagnostics = self.diagnostics.write().await;
        diagnostics.last_event = Utc::now();
        diagnostics.reconciles += 1;
        if let Err(e) = res {
            diagnostics.failures += 1;
            diagnostics.last_error = Some(e.to_string());
        }
    }

    /// Delay before a failed identity is tried again; `None` for permanent failures
    fn retry_after(&self, error: &Error) -> Option<Duration> {
        if error.is_retryable() {
            warn!("reconcile failed, retrying in {:?}: {error}", self.settings.error_backoff);
            Some(self.settings.error_backoff)
        } else {
            error!("reconcile failed permanently: {error}");
            None
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub reconciles: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reconciles: 0,
            failures: 0,
            last_error: None,
            reporter: MANAGER_NAME.into(),
        }
    }
}
impl Diagnostics {
    fn publisher(&self, client: Client) -> RecorderPublisher {
        RecorderPublisher::new(client, &self.reporter.controller)
    }
}

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the controller
    diagnostics: Arc<RwLock<Diagnostics>>,
}

impl State {
    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

fn to_action(next_look: Option<Duration>) -> Action {
    next_look.map_or_else(Action::await_change, Action::requeue)
}

/// Reconcile an OCSInitialization held in the controller's cache
pub async fn reconcile_initialization(
    obj: Arc<OCSInitialization>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let outcome = ctx.reconcile(&ObjectKey::of(obj.as_ref())).await?;
    Ok(to_action(outcome.next_look()))
}

pub fn error_policy(_: Arc<OCSInitialization>, error: &Error, ctx: Arc<Context>) -> Action {
    to_action(ctx.retry_after(error))
}

/// Reconcile an identity the controller has no cached object for.
///
/// The controller only reconciles objects that exist, so a deleted or
/// never-created singleton comes through here. Returns when the canonical
/// identity should be triggered again.
pub async fn bootstrap(key: &ObjectKey, ctx: &Context) -> Option<Duration> {
    if *key != ctx.reconciler.canonical_identity() {
        debug!("{key} is gone");
        return None;
    }
    match ctx.reconcile(key).await {
        Ok(outcome) => outcome.next_look(),
        Err(e) => ctx.retry_after(&e),
    }
}

/// Trigger `obj_ref` every `every`, starting one period from now
pub fn resync(
    obj_ref: ObjectRef<OCSInitialization>,
    every: Duration,
) -> impl Stream<Item = ObjectRef<OCSInitialization>> + Send + 'static {
    let ticker = tokio::time::interval_at(Instant::now() + every, every);
    stream::unfold((ticker, obj_ref), |(mut ticker, obj_ref)| async move {
        ticker.tick().await;
        debug!("resync {}", obj_ref);
        Some((obj_ref.clone(), (ticker, obj_ref)))
    })
}

fn load_desired(settings: &Settings) -> Result<DesiredState> {
    match &settings.storage_classes {
        Some(path) => {
            let desired = DesiredState::from_path(path)?;
            if desired.is_empty() {
                warn!("{} holds no StorageClasses", path.display());
            } else {
                info!(
                    "Loaded StorageClasses {:?} from {}",
                    desired.storage_class_names(),
                    path.display()
                );
            }
            Ok(desired)
        }
        None => {
            info!("No StorageClasses configured; initialization only records itself");
            Ok(DesiredState::default())
        }
    }
}

fn watch_api(client: Client, scope: &WatchScope) -> Api<OCSInitialization> {
    if scope.all_namespaces() {
        Api::all(client)
    } else {
        Api::namespaced(client, scope.namespace())
    }
}

/// Run the OCSInitialization controller until a shutdown signal arrives.
/// Configuration problems and a missing CRD are returned before anything starts.
pub async fn run(settings: Settings, state: State) -> Result<()> {
    let scope = settings.watch_scope()?;
    let dispatch = settings.dispatch()?;
    let store_timeout = settings.deadline()?;
    let desired = Arc::new(load_desired(&settings)?);
    let client = Client::try_default().await.map_err(Error::KubeError)?;

    let initializations = Arc::new(KubeStore::<OCSInitialization>::namespaced(client.clone()));
    if let Err(e) = initializations.list(Some(scope.namespace()), None).await {
        error!("OCSInitialization CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin gencrd | kubectl apply -f -");
        return Err(e);
    }
    let storage_classes = Arc::new(KubeStore::<StorageClass>::cluster(client.clone()));
    let events = Arc::new(state.diagnostics.read().await.publisher(client.clone()));

    let canonical = scope.canonical_identity();
    info!("Managing OCSInitialization {canonical}");
    let canonical_ref = ObjectRef::new(&canonical.name).within(scope.namespace());
    let reconciler = Reconciler::new(
        scope.clone(),
        initializations,
        storage_classes,
        desired,
        events,
        store_timeout,
    );
    let ctx = Arc::new(Context::new(reconciler, dispatch.clone(), state.diagnostics.clone()));

    let (trigger, triggers) = mpsc::unbounded();
    // the singleton may not exist yet, in which case the watch never reports it
    let _ = trigger.unbounded_send(canonical_ref.clone());

    let (reader, writer) = reflector::store();
    let deletions = trigger.clone();
    let initializations = watcher::watcher(
        watch_api(client, &scope),
        watcher::Config::default().any_semantic(),
    )
    .default_backoff()
    .reflect(writer)
    .inspect_ok(move |event| {
        // deleted objects are not reconciled by the controller; route them to bootstrap
        if let Event::Delete(obj) = event {
            let _ = deletions.unbounded_send(ObjectRef::from_obj(obj));
        }
    })
    .applied_objects();

    Controller::for_stream(initializations, reader)
        .with_config(Config::default().concurrency(dispatch.workers))
        .reconcile_on(stream::select(
            triggers,
            resync(canonical_ref.clone(), dispatch.resync_interval),
        ))
        .shutdown_on_signal()
        .run(reconcile_initialization, error_policy, ctx.clone())
        .for_each(|res| {
            let ctx = ctx.clone();
            let trigger = trigger.clone();
            let canonical_ref = canonical_ref.clone();
            async move {
                match res {
                    Ok((obj, action)) => debug!("reconciled {obj}: {action:?}"),
                    Err(controller::Error::ObjectNotFound(obj_ref)) => {
                        let key = ObjectKey {
                            namespace: obj_ref.namespace,
                            name: obj_ref.name,
                        };
                        if let Some(delay) = bootstrap(&key, &ctx).await {
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = trigger.unbounded_send(canonical_ref);
                            });
                        }
                    }
                    Err(e) => debug!("reconcile error: {e}"),
                }
            }
        })
        .await;
    info!("OCSInitialization controller shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::OCSInitializationSpec;
    use crate::events_helper::RecordedEvents;
    use crate::init_controller::RECREATE_REQUEUE;
    use crate::store::{Failure, MemoryStore, StoreCall};

    const NS: &str = "openshift-storage";

    fn context(inits: Arc<MemoryStore<OCSInitialization>>) -> Arc<Context> {
        let reconciler = Reconciler::new(
            WatchScope::new(NS, false).unwrap(),
            inits,
            Arc::new(MemoryStore::<StorageClass>::new()),
            Arc::new(DesiredState::default()),
            Arc::new(RecordedEvents::default()),
            Duration::from_secs(30),
        );
        let settings = DispatchSettings {
            error_backoff: Duration::from_secs(5),
            ..DispatchSettings::default()
        };
        Arc::new(Context::new(reconciler, settings, Arc::new(RwLock::new(Diagnostics::default()))))
    }

    fn init(ns: &str, name: &str) -> OCSInitialization {
        let mut obj = OCSInitialization::new(name, OCSInitializationSpec::default());
        obj.metadata.namespace = Some(ns.into());
        obj
    }

    #[test]
    fn outcomes_map_to_actions() {
        assert_eq!(to_action(Outcome::Done.next_look()), Action::await_change());
        assert_eq!(
            to_action(Outcome::RequeueAfter(RECREATE_REQUEUE).next_look()),
            Action::requeue(Duration::from_millis(200))
        );
        assert_eq!(to_action(Outcome::Requeue.next_look()), Action::requeue(Duration::ZERO));
    }

    #[tokio::test]
    async fn error_policy_retries_only_retryable_errors() {
        let ctx = context(Arc::new(MemoryStore::<OCSInitialization>::new()));
        let obj = Arc::new(init(NS, "ocsinit"));

        let conflict = Error::Conflict("x".into());
        assert_eq!(
            error_policy(obj.clone(), &conflict, ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );

        let foreign = Error::ForeignStatusUpdate(Box::new(Error::Conflict("x".into())));
        assert_eq!(error_policy(obj, &foreign, ctx), Action::await_change());
    }

    #[tokio::test]
    async fn reconcile_records_diagnostics() {
        let inits = Arc::new(MemoryStore::<OCSInitialization>::new());
        inits.insert(init(NS, "ocsinit"));
        let ctx = context(inits.clone());

        let action = reconcile_initialization(Arc::new(init(NS, "ocsinit")), ctx.clone())
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert!(inits.object(&ObjectKey::namespaced(NS, "ocsinit")).unwrap().is_initialized());

        let diagnostics = ctx.diagnostics.read().await;
        assert_eq!(diagnostics.reconciles, 1);
        assert_eq!(diagnostics.failures, 0);
    }

    #[tokio::test]
    async fn bootstrap_recreates_missing_singleton() {
        let inits = Arc::new(MemoryStore::<OCSInitialization>::new());
        let ctx = context(inits.clone());
        let canonical = ObjectKey::namespaced(NS, "ocsinit");

        assert_eq!(bootstrap(&canonical, &ctx).await, Some(RECREATE_REQUEUE));
        assert!(inits.object(&canonical).is_some());
    }

    #[tokio::test]
    async fn bootstrap_ignores_deleted_foreign_instances() {
        let inits = Arc::new(MemoryStore::<OCSInitialization>::new());
        let ctx = context(inits.clone());

        assert_eq!(bootstrap(&ObjectKey::namespaced(NS, "other"), &ctx).await, None);
        assert!(inits.calls().is_empty());
        assert_eq!(ctx.diagnostics.read().await.reconciles, 0);
    }

    #[tokio::test]
    async fn bootstrap_failure_is_retried_after_backoff() {
        let inits = Arc::new(MemoryStore::<OCSInitialization>::new());
        let canonical = ObjectKey::namespaced(NS, "ocsinit");
        inits.fail_once(StoreCall::Create(canonical.clone()), Failure::Unavailable);
        let ctx = context(inits.clone());

        assert_eq!(bootstrap(&canonical, &ctx).await, Some(Duration::from_secs(5)));
        assert_eq!(inits.object(&canonical), None);
        assert_eq!(ctx.diagnostics.read().await.failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resync_ticks_once_per_period() {
        let obj_ref = ObjectRef::new("ocsinit").within(NS);
        let started = Instant::now();
        let ticks: Vec<_> = resync(obj_ref.clone(), Duration::from_secs(60))
            .take(2)
            .map(|r| (r, started.elapsed()))
            .collect()
            .await;

        assert_eq!(ticks[0], (obj_ref.clone(), Duration::from_secs(60)));
        assert_eq!(ticks[1], (obj_ref, Duration::from_secs(120)));
    }
}
