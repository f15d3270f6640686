//! Kubernetes Event recording for the preview controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that environment transitions are visible via `kubectl describe`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Provisioning")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as the given controller name.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Child resources applied, waiting on deployments
    pub const PROVISIONING: &str = "Provisioning";
    /// All deployment units healthy
    pub const READY: &str = "Ready";
    /// A deployment unit reports Degraded
    pub const DEGRADED: &str = "Degraded";
    /// A materializer failed to converge its resource
    pub const MATERIALIZE_FAILED: &str = "MaterializeFailed";
    /// Spec failed validation
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// Child resources removed, finalizer released
    pub const CLEANUP_COMPLETE: &str = "CleanupComplete";
    /// A child resource could not be removed
    pub const CLEANUP_FAILED: &str = "CleanupFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Regular reconciliation
    pub const RECONCILE: &str = "Reconcile";
    /// Deletion path
    pub const CLEANUP: &str = "Cleanup";
}
