use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client, Resource};
use tracing::debug;

/// Sink for Kubernetes Events about objects the reconciler touches.
/// Publishing is best effort and never fails the caller.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    );
}

/// Publish a Normal event about `obj`
pub async fn emit_info<R: Resource<DynamicType = ()>>(
    events: &dyn EventPublisher,
    obj: &R,
    reason: &str,
    action: &str,
    note: impl Into<String>,
) {
    events
        .publish(&obj.object_ref(&()), EventType::Normal, reason, action, note.into())
        .await;
}

/// Publish a Warning event about `obj`
pub async fn emit_warning<R: Resource<DynamicType = ()>>(
    events: &dyn EventPublisher,
    obj: &R,
    reason: &str,
    action: &str,
    note: impl Into<String>,
) {
    events
        .publish(&obj.object_ref(&()), EventType::Warning, reason, action, note.into())
        .await;
}

/// Publishes through the API server
pub struct RecorderPublisher {
    recorder: Recorder,
}

impl RecorderPublisher {
    pub fn new(client: Client, reporter: &str) -> Self {
        Self {
            recorder: Recorder::new(client, reporter.into()),
        }
    }
}

#[async_trait]
impl EventPublisher for RecorderPublisher {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let res = self
            .recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note: Some(note),
                    action: action.into(),
                    secondary: None,
                },
                reference,
            )
            .await;
        if let Err(e) = res {
            debug!("failed to publish {reason} event: {e}");
        }
    }
}

/// Event as captured by [`RecordedEvents`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub type_: EventType,
    pub reason: String,
    pub note: String,
}

/// Keeps published events in memory
#[derive(Default)]
pub struct RecordedEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordedEvents {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordedEvents {
    async fn publish(
        &self,
        reference: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: String,
    ) {
        let object = match (&reference.namespace, &reference.name) {
            (Some(ns), Some(name)) => format!("{ns}/{name}"),
            (None, Some(name)) => name.clone(),
            _ => String::new(),
        };
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedEvent {
                object,
                type_,
                reason: reason.into(),
                note,
            });
    }
}
