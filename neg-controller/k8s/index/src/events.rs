//! Event recording.
//!
//! Syncers and the index report user-visible conditions (annotation parse
//! failures, NEG creation/deletion, sync failures after backoff exhaustion)
//! as Kubernetes Events on the owning Service. The sink is a narrow trait so
//! syncers do not hold a reference back into the manager and tests can run
//! without an API server. Publishing is fire-and-forget: a failed event must
//! never stall reconciliation.

use neg_controller_core::ServiceKey;
use neg_controller_k8s_api as k8s;

pub trait EventSink: std::fmt::Debug + Send + Sync + 'static {
    fn publish(&self, service: &ServiceKey, type_: k8s::EventType, reason: &'static str, note: String);

    fn normal(&self, service: &ServiceKey, reason: &'static str, note: String) {
        self.publish(service, k8s::EventType::Normal, reason, note);
    }

    fn warn(&self, service: &ServiceKey, reason: &'static str, note: String) {
        self.publish(service, k8s::EventType::Warning, reason, note);
    }
}

/// Publishes events through the Kubernetes API.
#[derive(Clone)]
pub struct KubeEventSink {
    client: k8s::Client,
    reporter: k8s::Reporter,
}

impl std::fmt::Debug for KubeEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventSink")
            .field("reporter", &self.reporter)
            .finish_non_exhaustive()
    }
}

/// Swallows events. For tests.
#[derive(Clone, Debug, Default)]
pub struct NoopEventSink;

// === impl KubeEventSink ===

impl KubeEventSink {
    pub fn new(client: k8s::Client, controller: &str) -> Self {
        Self {
            client,
            reporter: k8s::Reporter {
                controller: controller.to_string(),
                instance: None,
            },
        }
    }
}

impl EventSink for KubeEventSink {
    fn publish(&self, service: &ServiceKey, type_: k8s::EventType, reason: &'static str, note: String) {
        let reference = k8s::ObjectReference {
            kind: Some("Service".to_string()),
            namespace: Some(service.namespace.clone()),
            name: Some(service.name.clone()),
            ..Default::default()
        };
        let recorder = k8s::Recorder::new(self.client.clone(), self.reporter.clone(), reference);
        tokio::spawn(async move {
            let event = k8s::Event {
                type_,
                reason: reason.to_string(),
                note: Some(note),
                action: "Reconcile".to_string(),
                secondary: None,
            };
            if let Err(error) = recorder.publish(event).await {
                tracing::warn!(%error, reason, "Failed to publish event");
            }
        });
    }
}

impl EventSink for NoopEventSink {
    fn publish(
        &self,
        _service: &ServiceKey,
        _type: k8s::EventType,
        _reason: &'static str,
        _note: String,
    ) {
    }
}

/// Collects events for assertions.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingEventSink {
    events: parking_lot::Mutex<Vec<(ServiceKey, &'static str, String)>>,
}

#[cfg(test)]
impl RecordingEventSink {
    pub(crate) fn reasons(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|(_, reason, _)| *reason).collect()
    }
}

#[cfg(test)]
impl EventSink for RecordingEventSink {
    fn publish(&self, service: &ServiceKey, _type: k8s::EventType, reason: &'static str, note: String) {
        self.events.lock().push((service.clone(), reason, note));
    }
}
