use std::sync::Arc;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::ObjectMeta;
use tokio::time::{Duration, Instant};
use tracing::*;

use super::provision::Provisioner;
use crate::{
    config::WatchScope,
    crd::{OCSInitialization, OCSInitializationSpec},
    desired::DesiredState,
    events_helper::{emit_info, emit_warning, EventPublisher},
    store::{within, ObjectKey, ResourceStore},
    Error, Result,
};

/// Diagnostic written onto any instance that is not the canonical one
pub static WRONG_NAMESPACED_NAME: &str =
    "Ignoring this resource. Only one should exist, and this one has the wrong name and/or namespace.";

/// Delay before a freshly recreated singleton is looked at again
pub const RECREATE_REQUEUE: Duration = Duration::from_millis(200);

/// When the same identity should be looked at again after a successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Requeue,
    RequeueAfter(Duration),
}

impl Outcome {
    /// Delay until the next look, if one is wanted
    pub fn next_look(self) -> Option<Duration> {
        match self {
            Outcome::Done => None,
            Outcome::Requeue => Some(Duration::ZERO),
            Outcome::RequeueAfter(delay) => Some(delay),
        }
    }
}

/// Converges the OCSInitialization singleton and its StorageClasses.
///
/// Holds no state between invocations beyond its collaborators; every call
/// reads the store afresh, so repeated or spurious invocations are harmless.
pub struct Reconciler {
    scope: WatchScope,
    initializations: Arc<dyn ResourceStore<OCSInitialization>>,
    provisioner: Provisioner,
    events: Arc<dyn EventPublisher>,
    store_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        scope: WatchScope,
        initializations: Arc<dyn ResourceStore<OCSInitialization>>,
        storage_classes: Arc<dyn ResourceStore<StorageClass>>,
        desired: Arc<DesiredState>,
        events: Arc<dyn EventPublisher>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            scope,
            initializations,
            provisioner: Provisioner::new(storage_classes, desired),
            events,
            store_timeout,
        }
    }

    pub fn canonical_identity(&self) -> ObjectKey {
        self.scope.canonical_identity()
    }

    #[instrument(
        skip_all,
        fields(namespace = request.namespace.as_deref().unwrap_or_default(), name = %request.name)
    )]
    pub async fn reconcile(&self, request: &ObjectKey) -> Result<Outcome> {
        info!("Reconciling OCSInitialization");
        let deadline = Instant::now() + self.store_timeout;
        let canonical = self.canonical_identity();
        if *request != canonical {
            return self.reconcile_foreign(request, deadline).await;
        }

        let Some(instance) = within(
            deadline,
            format!("get {request}"),
            self.initializations.get(request),
        )
        .await?
        else {
            return self.recreate(&canonical, deadline).await;
        };

        if instance.is_initialized() {
            // Provisioning runs once; later edits or deletions of the
            // StorageClasses are left alone.
            debug!("already initialized");
            return Ok(Outcome::Done);
        }

        self.provision(&instance, deadline).await?;
        Ok(Outcome::Done)
    }

    /// Flag a misplaced instance; never touches the canonical one
    async fn reconcile_foreign(&self, request: &ObjectKey, deadline: Instant) -> Result<Outcome> {
        info!("{}", WRONG_NAMESPACED_NAME);
        let Some(instance) = within(
            deadline,
            format!("get {request}"),
            self.initializations.get(request),
        )
        .await?
        else {
            debug!("foreign instance is gone");
            return Ok(Outcome::Done);
        };

        if instance.error_message() == Some(WRONG_NAMESPACED_NAME) {
            debug!("foreign instance already flagged");
            return Ok(Outcome::Done);
        }

        let flagged = instance.with_error_message(WRONG_NAMESPACED_NAME);
        let res = within(
            deadline,
            format!("update status of {request}"),
            self.initializations.replace_status(&flagged),
        )
        .await;
        match res {
            Ok(_) => {
                emit_warning(
                    self.events.as_ref(),
                    &instance,
                    "Ignored",
                    "Ignoring",
                    format!("Only {} is managed", self.canonical_identity()),
                )
                .await;
                Ok(Outcome::Done)
            }
            Err(e) => {
                error!("failed to update ignored resource: {e}");
                Err(Error::ForeignStatusUpdate(Box::new(e)))
            }
        }
    }

    /// Bring back a deleted (or never created) singleton with empty status
    async fn recreate(&self, canonical: &ObjectKey, deadline: Instant) -> Result<Outcome> {
        info!("recreating OCSInitialization resource");
        let fresh = OCSInitialization {
            metadata: ObjectMeta {
                name: Some(canonical.name.clone()),
                namespace: canonical.namespace.clone(),
                ..ObjectMeta::default()
            },
            spec: OCSInitializationSpec::default(),
            status: None,
        };
        let created = within(
            deadline,
            format!("create {canonical}"),
            self.initializations.create(&fresh),
        )
        .await?;
        emit_info(
            self.events.as_ref(),
            &created,
            "Recreated",
            "Creating",
            format!("Created `{canonical}`"),
        )
        .await;
        Ok(Outcome::RequeueAfter(RECREATE_REQUEUE))
    }

    /// Provision every StorageClass, then record that it happened.
    /// A failure leaves `initialized` unset so the whole pass runs again.
    async fn provision(&self, instance: &OCSInitialization, deadline: Instant) -> Result<()> {
        let report = self
            .provisioner
            .ensure_storage_classes(instance, deadline, self.events.as_ref())
            .await?;
        info!(
            created = report.created.len(),
            restored = report.restored.len(),
            unchanged = report.unchanged.len(),
            "StorageClasses provisioned"
        );

        let initialized = instance.mark_initialized();
        within(
            deadline,
            "update status of initialization",
            self.initializations.replace_status(&initialized),
        )
        .await?;
        emit_info(
            self.events.as_ref(),
            instance,
            "Initialized",
            "Provisioning",
            "Initial StorageClasses provisioned",
        )
        .await;
        Ok(())
    }
}
