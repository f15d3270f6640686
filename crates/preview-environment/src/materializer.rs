//! Uniform interface over the child resources of a PreviewEnvironment

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::warn;

use preview_common::crd::PreviewEnvironment;
use preview_common::kube_utils::is_claimed_by_other;
use preview_common::Error;

use crate::client::{ClusterClient, ResourceRef};

/// Converges one kind of child resource for an environment.
///
/// `ensure` and `delete` must be idempotent: the controller may call them
/// any number of times for the same record, including after a crash midway.
#[async_trait]
pub trait Materializer: Send + Sync {
    /// Kind name used in logs and errors (e.g. "Namespace")
    fn kind(&self) -> &'static str;

    /// Create or update the resource to match the environment
    async fn ensure(&self, env: &PreviewEnvironment, namespace: &str) -> Result<(), Error>;

    /// Remove the resource; already absent counts as success
    async fn delete(&self, env: &PreviewEnvironment, namespace: &str) -> Result<(), Error>;

    /// Observe the resource's health
    async fn status(&self, env: &PreviewEnvironment, namespace: &str)
        -> Result<ResourceHealth, Error>;
}

/// Delete a child found by its derived name, unless another record owns it.
///
/// The owner-uid annotation is consulted first: a child that another record
/// with the same name has claimed is kept and counted as done. Returns
/// whether a delete was issued.
pub async fn delete_owned(
    client: &dyn ClusterClient,
    env: &PreviewEnvironment,
    target: &ResourceRef,
) -> Result<bool, Error> {
    let Some(existing) = client.get_resource(target).await? else {
        return Ok(false);
    };
    if is_claimed_by_other(&existing.metadata, env) {
        warn!(
            env = %env.name_any(),
            kind = %target.api_resource.kind,
            name = %target.name,
            owner_uid = ?existing.annotations().get(preview_common::ANNOTATION_OWNER_UID),
            "child belongs to another environment, leaving it in place"
        );
        return Ok(false);
    }
    client.delete_resource(target).await
}

/// Aggregate health of a child resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthState {
    /// Resource exists and everything it deploys is healthy
    Ready,
    /// Resource exists but is still converging
    Progressing,
    /// At least one deployment unit reports Degraded
    Degraded,
    /// Resource does not exist
    Missing,
}

/// Health of one deployment unit (one generated Application)
#[derive(Clone, Debug, PartialEq)]
pub struct UnitHealth {
    /// Service the unit deploys
    pub service: String,
    /// Health status as reported by the GitOps engine (e.g. "Healthy")
    pub health: String,
    /// Sync status as reported by the GitOps engine (e.g. "Synced")
    pub sync: String,
}

impl UnitHealth {
    /// Health and sync state of a unit that has not been generated yet
    pub fn missing(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            health: "Missing".to_string(),
            sync: "Unknown".to_string(),
        }
    }

    /// Healthy and Synced
    pub fn is_ready(&self) -> bool {
        self.health == "Healthy" && self.sync == "Synced"
    }

    /// Reports Degraded
    pub fn is_degraded(&self) -> bool {
        self.health == "Degraded"
    }
}

/// Observed health of a child resource
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceHealth {
    /// Aggregate state
    pub state: HealthState,
    /// Per-unit detail; empty for kinds without deployment units
    pub units: Vec<UnitHealth>,
    /// Optional detail for the status message
    pub message: Option<String>,
}

impl ResourceHealth {
    /// Healthy with no units
    pub fn ready() -> Self {
        Self {
            state: HealthState::Ready,
            units: Vec::new(),
            message: None,
        }
    }

    /// Not present in the cluster
    pub fn missing() -> Self {
        Self {
            state: HealthState::Missing,
            units: Vec::new(),
            message: None,
        }
    }

    /// Converging, with a reason
    pub fn progressing(message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Progressing,
            units: Vec::new(),
            message: Some(message.into()),
        }
    }

    /// Aggregate per-unit health.
    ///
    /// Ready requires at least one unit and every unit Healthy and Synced.
    /// Any Degraded unit makes the whole resource Degraded.
    pub fn from_units(units: Vec<UnitHealth>) -> Self {
        let degraded: Vec<&str> = units
            .iter()
            .filter(|u| u.is_degraded())
            .map(|u| u.service.as_str())
            .collect();

        let (state, message) = if !degraded.is_empty() {
            (
                HealthState::Degraded,
                Some(format!("degraded services: {}", degraded.join(", "))),
            )
        } else if !units.is_empty() && units.iter().all(UnitHealth::is_ready) {
            (HealthState::Ready, None)
        } else {
            let waiting = units.iter().filter(|u| !u.is_ready()).count();
            (
                HealthState::Progressing,
                Some(format!("{} of {} services not ready", waiting, units.len())),
            )
        };

        Self {
            state,
            units,
            message,
        }
    }
}
